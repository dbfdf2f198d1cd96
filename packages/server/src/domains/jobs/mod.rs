pub mod dispatcher;
pub mod models;
pub mod queue;
pub mod store;
pub mod sweeper;

pub use models::{
    Artifact, CacheEvent, FailureCategory, FailureConfidence, FailureExplanation, Job,
    JobAiExplanation, JobAttempt, JobDependency, JobSpec, JobSpecRow, JobState, Lease, LeaseState,
};
