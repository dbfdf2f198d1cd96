//! Process counters exposed at `/metrics`.
//!
//! Plain atomics rendered as text; there is no metrics pipeline dependency.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub runs_created: AtomicU64,
    pub runs_finalized: AtomicU64,
    pub plans_failed: AtomicU64,
    pub leases_granted: AtomicU64,
    pub leases_expired: AtomicU64,
    pub stale_lease_rejections: AtomicU64,
    pub attempts_completed: AtomicU64,
    pub attempts_retried: AtomicU64,
    pub queue_dequeues: AtomicU64,
    pub ai_failures: AtomicU64,
    pub report_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("delta_ci_runs_created_total", &self.runs_created),
            ("delta_ci_runs_finalized_total", &self.runs_finalized),
            ("delta_ci_plans_failed_total", &self.plans_failed),
            ("delta_ci_leases_granted_total", &self.leases_granted),
            ("delta_ci_leases_expired_total", &self.leases_expired),
            (
                "delta_ci_stale_lease_rejections_total",
                &self.stale_lease_rejections,
            ),
            ("delta_ci_attempts_completed_total", &self.attempts_completed),
            ("delta_ci_attempts_retried_total", &self.attempts_retried),
            ("delta_ci_queue_dequeues_total", &self.queue_dequeues),
            ("delta_ci_ai_failures_total", &self.ai_failures),
            ("delta_ci_report_failures_total", &self.report_failures),
        ] {
            out.push_str(&format!(
                "# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_counter() {
        let metrics = Metrics::new();
        metrics.leases_granted.fetch_add(3, Ordering::Relaxed);
        let text = metrics.render();
        assert!(text.contains("delta_ci_leases_granted_total 3"));
        assert!(text.contains("delta_ci_runs_created_total 0"));
    }
}
