//! Durable mutation queue and the processor that replays it against the
//! remote service once connectivity returns.

mod job;
mod processor;
mod queue;

pub use job::{FailedJob, JobType, RetryDecision, SyncJob, SyncJobInput};
pub use processor::{backoff_delay, DrainReport, SyncEvent, SyncProcessor, SyncSettings};
pub use queue::SyncQueue;
