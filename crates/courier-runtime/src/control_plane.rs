//! HTTP client for the remote ops control plane.
//!
//! Two endpoints: command relay and session listing, both bearer-token
//! authenticated and bounded by per-call timeouts. Failures surface as a
//! typed error so the router can log full detail while keeping the chat
//! channel display-safe.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SESSIONS_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control plane returned status {0}")]
    Status(u16),
    #[error("control plane response was malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneSession {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Deserialize)]
struct SessionListResponse {
    #[serde(default)]
    sessions: Vec<ControlPlaneSession>,
}

#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    command_timeout: Duration,
    sessions_timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: String,
        api_token: String,
        command_timeout_ms: u64,
        sessions_timeout_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("courier-bridge"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to create control plane client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.trim().to_string(),
            command_timeout: Duration::from_millis(command_timeout_ms.max(1)),
            sessions_timeout: Duration::from_millis(sessions_timeout_ms.max(1)),
        })
    }

    /// Relays one opaque command for a linked session. Success responses
    /// yield the `data` field of the body, or the whole body when `data` is
    /// absent.
    pub async fn send_command(
        &self,
        session_id: &str,
        user_id: &str,
        command: &str,
        timestamp: &str,
    ) -> Result<Value, ControlPlaneError> {
        let response = self
            .http
            .post(format!("{}/api/command", self.base_url))
            .bearer_auth(&self.api_token)
            .timeout(self.command_timeout)
            .json(&json!({
                "session_id": session_id,
                "command": command,
                "user": user_id,
                "timestamp": timestamp,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlPlaneError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ControlPlaneError::Malformed(error.to_string()))?;
        Ok(match body.get("data") {
            Some(data) => data.clone(),
            None => body,
        })
    }

    pub async fn list_sessions(&self) -> Result<Vec<ControlPlaneSession>, ControlPlaneError> {
        let response = self
            .http
            .get(format!("{}/api/sessions", self.base_url))
            .bearer_auth(&self.api_token)
            .timeout(self.sessions_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlPlaneError::Status(status.as_u16()));
        }

        let body: SessionListResponse = response
            .json()
            .await
            .map_err(|error| ControlPlaneError::Malformed(error.to_string()))?;
        Ok(body.sessions)
    }
}
