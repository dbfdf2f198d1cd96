// ServerKernel - core infrastructure with all dependencies
//
// The ServerKernel holds the database pool, configuration, and every
// swappable capability (planner, runner dispatcher, status reporter, AI
// advisor, lease tokens, webhook verifier) so the orchestrator and HTTP
// layer reach collaborators through traits.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use super::ai::HttpAiClient;
use super::metrics::Metrics;
use super::traits::{
    AcceptAllVerifier, BaseLeaseTokens, BaseRunnerDispatcher, BaseStatusReporter,
    BaseWebhookVerifier, LoggingRunnerDispatcher, LoggingStatusReporter, RandomLeaseTokens,
};
use crate::config::Config;
use crate::domains::failures::AiAdvisor;
use crate::domains::planner::{BasePlanner, DefaultPlanner};

/// ServerKernel holds all server dependencies
pub struct ServerKernel {
    pub db_pool: PgPool,
    pub config: Config,
    pub planner: Arc<dyn BasePlanner>,
    pub dispatcher: Arc<dyn BaseRunnerDispatcher>,
    pub status_reporter: Arc<dyn BaseStatusReporter>,
    pub lease_tokens: Arc<dyn BaseLeaseTokens>,
    pub webhook_verifier: Arc<dyn BaseWebhookVerifier>,
    /// Present only when the AI hook is enabled in config.
    pub ai_advisor: Option<Arc<AiAdvisor>>,
    pub metrics: Arc<Metrics>,
}

impl ServerKernel {
    /// Creates a new ServerKernel with the given dependencies
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: PgPool,
        config: Config,
        planner: Arc<dyn BasePlanner>,
        dispatcher: Arc<dyn BaseRunnerDispatcher>,
        status_reporter: Arc<dyn BaseStatusReporter>,
        lease_tokens: Arc<dyn BaseLeaseTokens>,
        webhook_verifier: Arc<dyn BaseWebhookVerifier>,
        ai_advisor: Option<Arc<AiAdvisor>>,
    ) -> Self {
        Self {
            db_pool,
            config,
            planner,
            dispatcher,
            status_reporter,
            lease_tokens,
            webhook_verifier,
            ai_advisor,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Production wiring: default implementations for every capability, so
    /// the core runs end-to-end without external services.
    pub fn with_defaults(db_pool: PgPool, config: Config) -> Result<Self> {
        let planner = Arc::new(DefaultPlanner::new(
            config.repo_root.clone(),
            db_pool.clone(),
        ));
        let status_reporter = Arc::new(LoggingStatusReporter {
            db_pool: db_pool.clone(),
        });

        let ai_advisor = if config.ai.enabled {
            let client = Arc::new(HttpAiClient::new(&config.ai)?);
            Some(Arc::new(AiAdvisor::new(&config.ai, client)))
        } else {
            None
        };

        Ok(Self::new(
            db_pool,
            config,
            planner,
            Arc::new(LoggingRunnerDispatcher),
            status_reporter,
            Arc::new(RandomLeaseTokens),
            Arc::new(AcceptAllVerifier),
            ai_advisor,
        ))
    }
}
