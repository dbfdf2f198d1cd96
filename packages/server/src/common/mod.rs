pub mod error;

pub use error::{CoreError, StaleLeaseReason, TransitionError};
