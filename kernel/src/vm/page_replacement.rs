use crate::mem::FrameId;

/// A frame the frame table is willing to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictimCandidate {
    pub frame: FrameId,
    /// Frame table tick at which the frame was handed out.
    pub created: u64,
}

/// Decides which frame to evict when the pool runs dry.
pub trait PageReplacementPolicy: Send {
    /// Reorders `candidates` so the preferred victim comes first. The frame table takes the first
    /// candidate whose owner it can lock.
    fn rank(&mut self, candidates: &mut [VictimCandidate]);
}

/// Evicts the frame that was allocated longest ago.
///
/// This is an approximation of recency, not LRU: accesses after allocation are not tracked.
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestFirst;

impl PageReplacementPolicy for OldestFirst {
    fn rank(&mut self, candidates: &mut [VictimCandidate]) {
        candidates.sort_unstable_by_key(|candidate| (candidate.created, candidate.frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(frame: usize, created: u64) -> VictimCandidate {
        VictimCandidate {
            frame: FrameId(frame),
            created,
        }
    }

    #[test]
    fn test_oldest_first() {
        let mut candidates = [candidate(0, 9), candidate(1, 3), candidate(2, 5)];
        OldestFirst.rank(&mut candidates);
        let order: Vec<_> = candidates.iter().map(|c| c.frame.0).collect();
        assert_eq!(order, [1, 2, 0]);
    }

    #[test]
    fn test_ties_break_on_frame_index() {
        let mut candidates = [candidate(4, 1), candidate(2, 1)];
        OldestFirst.rank(&mut candidates);
        assert_eq!(candidates[0].frame, FrameId(2));
    }

    #[test]
    fn test_empty_candidates() {
        OldestFirst.rank(&mut []);
    }
}
