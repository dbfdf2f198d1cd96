//! Failure analysis: a deterministic rule-based classifier, plus an
//! optional advisory AI hook behind a circuit breaker.

pub mod advisor;
pub mod classifier;
pub mod sanitize;

pub use advisor::{AiAdvisor, CircuitBreaker};
pub use classifier::{classify, Classification, FailureFacts};
