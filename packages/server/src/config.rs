use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub listen_addr: String,
    pub webhook_secret: Option<String>,
    pub webhook_max_body_bytes: usize,
    /// Root directory the planner resolves repository checkouts under.
    pub repo_root: String,
    pub default_lease_ttl_seconds: i64,
    pub default_heartbeat_interval_seconds: i64,
    pub queue_visibility_timeout_seconds: i64,
    pub lease_sweep_interval: Duration,
    pub lease_sweep_batch_size: i64,
    pub cancel_deadline_seconds: i64,
    pub max_run_seconds: i64,
    pub max_job_attempts: i32,
    pub dispatch_workers: usize,
    pub ai: AiConfig,
}

/// Settings for the advisory AI failure-explanation hook.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub token: Option<String>,
    pub prompt_version: String,
    pub timeout: Duration,
    pub max_output_len: usize,
    pub max_cache_events: usize,
    pub circuit_failures: u32,
    pub cooldown: Duration,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be valid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            webhook_secret: env::var("WEBHOOK_SECRET").ok(),
            webhook_max_body_bytes: env_or("WEBHOOK_MAX_BODY_BYTES", 1024 * 1024)?,
            repo_root: env::var("REPO_ROOT").unwrap_or_else(|_| "/var/lib/delta-ci/repos".to_string()),
            default_lease_ttl_seconds: env_or("DEFAULT_LEASE_TTL_SECONDS", 120)?,
            default_heartbeat_interval_seconds: env_or("DEFAULT_HEARTBEAT_INTERVAL_SECONDS", 30)?,
            queue_visibility_timeout_seconds: env_or("QUEUE_VISIBILITY_TIMEOUT_SECONDS", 30)?,
            lease_sweep_interval: Duration::from_secs(env_or("LEASE_SWEEP_INTERVAL_SECONDS", 5)?),
            lease_sweep_batch_size: env_or("LEASE_SWEEP_BATCH_SIZE", 25)?,
            cancel_deadline_seconds: env_or("CANCEL_DEADLINE_SECONDS", 30)?,
            max_run_seconds: env_or("MAX_RUN_SECONDS", 3600)?,
            max_job_attempts: env_or("MAX_JOB_ATTEMPTS", 3)?,
            dispatch_workers: env_or("DISPATCH_WORKERS", 2)?,
            ai: AiConfig::from_env()?,
        };

        if config.default_lease_ttl_seconds <= config.default_heartbeat_interval_seconds {
            bail!(
                "DEFAULT_LEASE_TTL_SECONDS ({}) must be greater than DEFAULT_HEARTBEAT_INTERVAL_SECONDS ({})",
                config.default_lease_ttl_seconds,
                config.default_heartbeat_interval_seconds
            );
        }

        Ok(config)
    }
}

impl AiConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: env_or("AI_ENABLED", false)?,
            provider: env::var("AI_PROVIDER").unwrap_or_else(|_| "generic".to_string()),
            model: env::var("AI_MODEL").unwrap_or_else(|_| "default".to_string()),
            endpoint: env::var("AI_ENDPOINT").unwrap_or_default(),
            token: env::var("AI_TOKEN").ok(),
            prompt_version: env::var("AI_PROMPT_VERSION").unwrap_or_else(|_| "v1".to_string()),
            timeout: Duration::from_secs(env_or("AI_TIMEOUT_SECONDS", 10)?),
            max_output_len: env_or("AI_MAX_OUTPUT_LEN", 4096)?,
            max_cache_events: env_or("AI_MAX_CACHE_EVENTS", 10)?,
            circuit_failures: env_or("AI_CIRCUIT_FAILURES", 3)?,
            cooldown: Duration::from_secs(env_or("AI_COOLDOWN_SECONDS", 300)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default() {
        let value: i64 = env_or("DELTA_CI_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn ai_config_defaults_to_disabled() {
        let ai = AiConfig::from_env().unwrap();
        assert!(!ai.enabled);
        assert_eq!(ai.circuit_failures, 3);
    }
}
