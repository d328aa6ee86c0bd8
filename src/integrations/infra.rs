use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{InfraClient, InfraOutcome, InfraRequest};
use crate::config::InfraSection;
use crate::errors::StepFailure;

/// Provisioning and deployment through JSON webhooks.
///
/// Every delivery carries `Idempotency-Key: <runId>:<stepId>` so a step
/// re-executed after a crash does not provision twice.
pub struct WebhookInfraClient {
    http: reqwest::Client,
    provision_url: Option<String>,
    deploy_url: Option<String>,
    token: Option<String>,
}

impl WebhookInfraClient {
    pub fn new(settings: &InfraSection, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("runway")
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build infra HTTP client")?;
        Ok(Self {
            http,
            provision_url: settings.provision_url.clone(),
            deploy_url: settings.deploy_url.clone(),
            token,
        })
    }

    async fn deliver(
        &self,
        operation: &str,
        url: Option<&str>,
        request: &InfraRequest,
    ) -> Result<InfraOutcome> {
        let url = url.ok_or_else(|| StepFailure::InfraNotConfigured {
            operation: operation.to_string(),
        })?;

        let mut builder = self
            .http
            .post(url)
            .header("Idempotency-Key", request.idempotency_key())
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to call {} webhook", operation))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(
                "{} webhook returned HTTP {}: {}",
                operation,
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        info!(
            run_id = %request.run_id,
            step_id = %request.step_id,
            operation,
            environment = %request.environment,
            "infra webhook accepted"
        );
        Ok(InfraOutcome {
            operation: operation.to_string(),
            environment: request.environment.clone(),
            response: parse_body(&body),
        })
    }
}

fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

#[async_trait]
impl InfraClient for WebhookInfraClient {
    async fn provision(&self, request: &InfraRequest) -> Result<InfraOutcome> {
        self.deliver("provision", self.provision_url.as_deref(), request)
            .await
    }

    async fn deploy(&self, request: &InfraRequest) -> Result<InfraOutcome> {
        self.deliver("deploy", self.deploy_url.as_deref(), request)
            .await
    }
}
