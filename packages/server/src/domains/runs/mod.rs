pub mod models;

pub use models::{
    Run, RunPlan, RunRerun, RunState, RunTrigger, SkippedJob, StatusReport,
};
