// Provider-agnostic AI client.
//
// The control plane does not speak any vendor SDK; it POSTs a JSON envelope
// to a configured shim endpoint and expects `{"output": "..."}` back. The
// shim translates to whatever provider is deployed. AI output is advisory
// metadata only and never influences state transitions.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::traits::BaseAI;
use crate::config::AiConfig;

pub struct HttpAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    token: Option<String>,
    max_output_len: usize,
}

#[derive(Deserialize)]
struct ShimResponse {
    output: String,
}

impl HttpAiClient {
    pub fn new(config: &AiConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            bail!("AI_ENDPOINT must be set when AI is enabled");
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build AI HTTP client")?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            token: config.token.clone(),
            max_output_len: config.max_output_len,
        })
    }
}

#[async_trait]
impl BaseAI for HttpAiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut request = self.http.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "input": prompt,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("AI provider request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("AI provider returned {}", status);
        }

        let body: ShimResponse = response
            .json()
            .await
            .context("AI provider returned malformed JSON")?;

        let mut output = body.output;
        if output.len() > self.max_output_len {
            output.truncate(self.max_output_len);
        }
        Ok(output)
    }
}
