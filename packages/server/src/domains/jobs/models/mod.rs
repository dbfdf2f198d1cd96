mod artifact;
mod cache_event;
mod failure_explanation;
mod job;
mod job_attempt;
mod job_dependency;
mod job_spec;
mod lease;

pub use artifact::Artifact;
pub use cache_event::CacheEvent;
pub use failure_explanation::{
    FailureCategory, FailureConfidence, FailureExplanation, JobAiExplanation,
};
pub use job::{Job, JobState};
pub use job_attempt::JobAttempt;
pub use job_dependency::JobDependency;
pub use job_spec::{CacheSpec, JobSpec, JobSpecRow};
pub use lease::{Lease, LeaseState};
