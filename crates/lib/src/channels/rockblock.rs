//! RockBLOCK uplink: submit `identity:body` to the modem via the MT (mobile-terminated) HTTP API.

use crate::config::RockBlockConfig;
use async_trait::async_trait;
use std::time::Duration;

/// Iridium SBD mobile-terminated messages carry at most 270 bytes.
const MT_MAX_BYTES: usize = 270;

#[derive(Debug, thiserror::Error)]
pub enum RockBlockError {
    /// Built only through [`RockBlockError::request`], which strips the URL (it carries the password).
    #[error("rockblock request failed: {0}")]
    Request(reqwest::Error),
    #[error("rockblock api error: {0}")]
    Api(String),
    #[error("rockblock not configured: {0} missing")]
    NotConfigured(&'static str),
}

impl RockBlockError {
    fn request(e: reqwest::Error) -> Self {
        Self::Request(e.without_url())
    }
}

/// Something that can deliver a message to the satellite modem.
#[async_trait]
pub trait SatelliteUplink: Send + Sync {
    /// Send `body` on behalf of the Signal `identity` (so the modem side can reply to it).
    async fn send(&self, identity: &str, body: &str) -> Result<(), RockBlockError>;
}

/// Encode the `identity:body` convention as uppercase hex of its UTF-8 bytes.
pub fn encode_payload(identity: &str, body: &str) -> String {
    hex::encode_upper(format!("{}:{}", identity, body))
}

/// HTTP client for the RockBLOCK MT endpoint. One attempt per message, no retry.
#[derive(Clone)]
pub struct RockBlockClient {
    url: String,
    imei: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl RockBlockClient {
    pub fn new(config: &RockBlockConfig) -> Result<Self, RockBlockError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(RockBlockError::request)?;
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            imei: config.imei.clone().filter(|s| !s.trim().is_empty()),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    /// POST the hex payload with flush=yes. Non-2xx and `FAILED,...` bodies are errors.
    pub async fn submit(&self, payload_hex: &str) -> Result<String, RockBlockError> {
        let imei = self.imei.as_deref().ok_or(RockBlockError::NotConfigured("imei"))?;
        let username = self
            .username
            .as_deref()
            .ok_or(RockBlockError::NotConfigured("username"))?;
        let password = self
            .password
            .as_deref()
            .ok_or(RockBlockError::NotConfigured("password"))?;
        if payload_hex.len() / 2 > MT_MAX_BYTES {
            log::warn!(
                "rockblock: payload is {} bytes, over the {} byte MT limit",
                payload_hex.len() / 2,
                MT_MAX_BYTES
            );
        }
        log::debug!(
            "rockblock: POST {} imei={} data_length={} flush=yes",
            self.url,
            imei,
            payload_hex.len()
        );
        let res = self
            .client
            .post(&self.url)
            .query(&[
                ("imei", imei),
                ("username", username),
                ("password", password),
                ("data", payload_hex),
                ("flush", "yes"),
            ])
            .header(reqwest::header::ACCEPT, "text/plain")
            .send()
            .await
            .map_err(RockBlockError::request)?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        log::debug!("rockblock: response {} {:?}", status, body);
        if !status.is_success() {
            return Err(RockBlockError::Api(format!("{} {}", status, body.trim())));
        }
        if body.trim_start().starts_with("FAILED") {
            return Err(RockBlockError::Api(body.trim().to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl SatelliteUplink for RockBlockClient {
    async fn send(&self, identity: &str, body: &str) -> Result<(), RockBlockError> {
        let payload = encode_payload(identity, body);
        let reply = self.submit(&payload).await?;
        log::info!(
            "rockblock: forwarded message from {} ({})",
            identity,
            reply.trim()
        );
        Ok(())
    }
}
