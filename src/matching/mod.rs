/// Face-recognition matching pipeline
///
/// The queue coordinator requests detection for uploaded photos; the
/// external detection capability writes candidate rows back, which the
/// verification workflow then moderates.

pub mod models;
pub mod queue;
pub mod verification;

pub use models::{
    BoundingBox, CandidateStatus, MatchCandidate, MatchQueueEntry, QueueStats, QueueStatus,
};
pub use queue::{Enqueued, MatchQueue};
pub use verification::MatchVerifier;
