use crate::domain::models::patch::PatchRecord;

/// Receives committed field writes in commit order.
///
/// A recorder only ever sees patches of passes that committed; aborted passes
/// record nothing.
pub trait PatchRecorder: Send + Sync {
    fn record(&self, patch: PatchRecord);
}
