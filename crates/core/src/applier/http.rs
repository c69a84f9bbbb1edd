use crate::applier::{Applier, AttemptTag};
use crate::config::{env_parse, Settings};
use crate::domain::recommendation::{Action, ResourceRef};
use crate::error::ApplierError;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Applier reached over HTTP: `POST {base}/v1/changes/apply` and `/v1/changes/revert`.
#[derive(Debug, Clone)]
pub struct HttpApplier {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChangeRequest<'a> {
    action: &'a Action,
    resource: &'a ResourceRef,
    tag: AttemptTag,
}

impl HttpApplier {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_applier_base_url()?.to_string();
        let api_key = settings.applier_api_key.clone();

        // Transport timeout is a backstop; the coordinator enforces its own per-call timeout.
        let timeout_secs = env_parse::<u64>("APPLIER_TIMEOUT_SECS").unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build applier http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn url(&self, op: &str) -> String {
        format!("{}/v1/changes/{op}", self.base_url.trim_end_matches('/'))
    }

    fn headers(&self, tag: AttemptTag, op: &str) -> Result<HeaderMap, ApplierError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| ApplierError::permanent(format!("invalid APPLIER_API_KEY: {e}")))?;
            headers.insert("x-api-key", value);
        }
        let key = HeaderValue::from_str(&tag.idempotency_key(op))
            .map_err(|e| ApplierError::permanent(format!("invalid idempotency key: {e}")))?;
        headers.insert("idempotency-key", key);
        Ok(headers)
    }

    async fn send(
        &self,
        op: &str,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError> {
        let res = self
            .http
            .post(self.url(op))
            .headers(self.headers(tag, op)?)
            .json(&ChangeRequest {
                action,
                resource,
                tag,
            })
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }

        let body = res.text().await.unwrap_or_default();
        let reason = format!("applier HTTP {status}: {}", body.trim());
        Err(classify_status(status, reason))
    }
}

fn classify_transport_error(err: reqwest::Error) -> ApplierError {
    if err.is_timeout() {
        return ApplierError::timeout();
    }
    if err.is_builder() {
        return ApplierError::permanent(format!("applier request invalid: {err}"));
    }
    ApplierError::transient(format!("applier request failed: {err}"))
}

fn classify_status(status: StatusCode, reason: String) -> ApplierError {
    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if transient {
        ApplierError::transient(reason)
    } else {
        ApplierError::permanent(reason)
    }
}

#[async_trait::async_trait]
impl Applier for HttpApplier {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn apply(
        &self,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError> {
        self.send("apply", action, resource, tag).await
    }

    async fn revert(
        &self,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError> {
        self.send("revert", action, resource, tag).await
    }
}
