mod health;
mod internal;
mod runs;
mod webhooks;

pub use health::{health_handler, metrics_handler};
pub use internal::{
    protocol_ack_lease, protocol_cancel_ack, protocol_complete, protocol_heartbeat,
};
pub use runs::{cancel_run_handler, create_run_handler, get_run_handler, rerun_run_handler};
pub use webhooks::webhook_handler;
