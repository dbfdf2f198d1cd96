mod run;
mod run_plan;
mod run_rerun;
mod run_trigger;
mod status_report;

pub use run::{Run, RunState};
pub use run_plan::{RunPlan, SkippedJob};
pub use run_rerun::RunRerun;
pub use run_trigger::RunTrigger;
pub use status_report::StatusReport;
