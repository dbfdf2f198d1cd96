// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic. The planner and
// failure analyzer live in their domains; everything here is a seam to an
// external collaborator (runner transport, VCS status API, AI provider,
// entropy source) with a default that lets the core run end-to-end without
// external services.

use anyhow::Result;
use async_trait::async_trait;
use rand::RngCore;
use tracing::info;

use crate::common::error::CoreError;
use crate::domains::runs::models::{Run, StatusReport};
use crate::protocol::LeaseGranted;

// =============================================================================
// AI Trait (Infrastructure - generic LLM completion)
// =============================================================================

#[async_trait]
pub trait BaseAI: Send + Sync {
    /// Complete a prompt with an LLM (returns raw text response)
    async fn complete(&self, prompt: &str) -> Result<String>;
}

// =============================================================================
// Runner dispatch
// =============================================================================

/// Delivers a granted lease to a runner. The transport is deployment
/// specific (long-poll reply, message bus, runner pool API); the control
/// plane only needs the handoff to be at-least-once.
#[async_trait]
pub trait BaseRunnerDispatcher: Send + Sync {
    async fn dispatch(&self, grant: &LeaseGranted) -> Result<()>;
}

/// Default dispatcher: logs the grant. Suitable for development and for
/// deployments where runners poll the protocol endpoints directly.
pub struct LoggingRunnerDispatcher;

#[async_trait]
impl BaseRunnerDispatcher for LoggingRunnerDispatcher {
    async fn dispatch(&self, grant: &LeaseGranted) -> Result<()> {
        info!(
            run_id = %grant.run_id,
            job_id = %grant.job_id,
            ttl = grant.lease_ttl_seconds,
            "lease granted"
        );
        Ok(())
    }
}

// =============================================================================
// Status reporting
// =============================================================================

/// Posts terminal run states back to the source-control provider. Owns the
/// `vcs_status_reports` table.
#[async_trait]
pub trait BaseStatusReporter: Send + Sync {
    async fn report(&self, run: &Run) -> Result<()>;
}

/// Default reporter: records the report row and logs. Real deployments wrap
/// this with a check-run client.
pub struct LoggingStatusReporter {
    pub db_pool: sqlx::PgPool,
}

#[async_trait]
impl BaseStatusReporter for LoggingStatusReporter {
    async fn report(&self, run: &Run) -> Result<()> {
        StatusReport::builder()
            .run_id(run.id)
            .provider("log")
            .state(run.state.as_str())
            .build()
            .insert(&self.db_pool)
            .await?;

        info!(run_id = %run.id, state = run.state.as_str(), "run status reported");
        Ok(())
    }
}

// =============================================================================
// Lease tokens
// =============================================================================

/// Mints lease ids. Lease ids are fencing tokens and must be unguessable;
/// swappable so tests can use predictable tokens.
pub trait BaseLeaseTokens: Send + Sync {
    fn mint(&self) -> String;
}

/// Default: 32 bytes from the OS RNG, hex-encoded with an `ls_` prefix.
pub struct RandomLeaseTokens;

impl BaseLeaseTokens for RandomLeaseTokens {
    fn mint(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        format!("ls_{}", hex::encode(bytes))
    }
}

// =============================================================================
// Webhook signature verification
// =============================================================================

/// Verifies webhook deliveries. Signature schemes are provider specific and
/// handled by external collaborators; this is the seam they plug into.
pub trait BaseWebhookVerifier: Send + Sync {
    fn verify(&self, provider: &str, body: &[u8], signature: Option<&str>) -> Result<(), CoreError>;
}

/// Default verifier: accepts all deliveries.
pub struct AcceptAllVerifier;

impl BaseWebhookVerifier for AcceptAllVerifier {
    fn verify(
        &self,
        _provider: &str,
        _body: &[u8],
        _signature: Option<&str>,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}
