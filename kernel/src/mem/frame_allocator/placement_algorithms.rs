//! Frame placement policies for the user frame pool.

use super::CoreMapEntry;

/// A placement algorithm for allocating single frames.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns the frame number to allocate, or [`None`] if every frame is in use.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();

        // Search from the cursor to the end, then wrap around to the frames before it.
        let found = (self.position..total_frames)
            .chain(0..self.position.min(total_frames))
            .find(|&i| !core_map[i].allocated())?;

        self.position = (found + 1) % total_frames;
        Some(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Marks the coremap entries in `frames` as allocated.
    fn fill_coremap(core_map: &mut [CoreMapEntry], frames: &[usize]) {
        for &i in frames {
            assert!(!core_map[i].allocated());
            core_map[i] = core_map[i].with_allocated(true);
        }
    }

    #[test]
    fn test_next_fit() {
        let mut core_map = [CoreMapEntry::default(); 8];
        fill_coremap(&mut core_map, &[0, 1, 3]);

        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&core_map), Some(2));
        fill_coremap(&mut core_map, &[2]);

        // Next allocation continues after frame 2 rather than rescanning from the start.
        assert_eq!(algorithm.place(&core_map), Some(4));
    }

    #[test]
    fn test_next_fit_wrap_around() {
        let mut core_map = [CoreMapEntry::default(); 8];
        fill_coremap(&mut core_map, &[5, 6, 7]);
        let mut algorithm = NextFit { position: 5 };
        assert_eq!(algorithm.place(&core_map), Some(0));
    }

    #[test]
    fn test_next_fit_full() {
        let mut core_map = [CoreMapEntry::default(); 4];
        fill_coremap(&mut core_map, &[0, 1, 2, 3]);
        let mut algorithm = NextFit { position: 2 };
        assert_eq!(algorithm.place(&core_map), None);
    }
}
