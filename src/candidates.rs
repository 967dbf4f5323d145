use crate::segment::{SegmentRef, SegmentState};
use crate::{CleanerError, SegmentManager};

/// Snapshot of the closed segments eligible for cleaning, rebuilt from the
/// segment manager at the start of every tick.
pub(crate) struct CandidateSet {
    segments: Vec<SegmentRef>,
}

impl CandidateSet {
    pub(crate) fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Replace the snapshot with the manager's current candidates. Anything
    /// outside Closed/Cleanable has no business being offered to the cleaner
    /// and indicates a broken manager.
    pub(crate) fn refresh<M: SegmentManager>(&mut self, manager: &M) -> Result<(), CleanerError> {
        self.segments = manager.cleanable_candidates();
        for segment in &self.segments {
            match segment.state() {
                SegmentState::Closed | SegmentState::Cleanable => {}
                other => {
                    return Err(CleanerError::CollaboratorInvariant(format!(
                        "segment {} offered for cleaning in state {other:?}",
                        segment.id()
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn as_slice(&self) -> &[SegmentRef] {
        &self.segments
    }
}
