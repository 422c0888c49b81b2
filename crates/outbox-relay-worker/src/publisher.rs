//! Broker publishers.
//!
//! The relay hands each claimed message to a [`BrokerPublisher`]. The HTTP
//! publisher talks to a RabbitMQ-compatible management API; the log
//! publisher only records what would have been sent.

use crate::PublishError;
use async_trait::async_trait;
use base64::Engine;
use relay_config_and_utils::RelayConfig;
use relay_store::Destination;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Header carrying the key the broker and consumers dedupe on.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const WORKFLOW_TYPE_HEADER: &str = "x-workflow-type";
pub const ATTEMPT_HEADER: &str = "x-attempt";

/// Per-publish metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub message_id: String,
    pub correlation_id: String,
    pub persistent: bool,
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish one message. `Ok` means the broker accepted and routed it.
    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), PublishError>;
}

/// Publishes through the broker's HTTP management API.
pub struct HttpBrokerPublisher {
    client: Client,
    base_url: Url,
    vhost: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    properties: PublishProperties<'a>,
    routing_key: &'a str,
    payload: String,
    payload_encoding: &'static str,
}

#[derive(Debug, Serialize)]
struct PublishProperties<'a> {
    delivery_mode: u8,
    message_id: &'a str,
    correlation_id: &'a str,
    content_type: &'static str,
    headers: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    routed: bool,
}

impl HttpBrokerPublisher {
    pub fn new(
        base_url: &str,
        vhost: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, PublishError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PublishError::Config(format!("invalid broker url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(PublishError::Config(format!(
                "broker url '{base_url}' cannot carry a path"
            )));
        }
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            vhost: vhost.into(),
            username,
            password,
        })
    }

    /// Build from configuration; `None` when no broker url is configured.
    pub fn from_config(config: &RelayConfig) -> Result<Option<Self>, PublishError> {
        match config.broker_url.as_deref() {
            Some(url) => Self::new(
                url,
                config.broker_vhost.clone(),
                config.broker_username.clone(),
                config.broker_password.clone(),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// `{base}/api/exchanges/{vhost}/{exchange}/publish`, segments percent-encoded.
    fn publish_url(&self, exchange: &str) -> Result<Url, PublishError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PublishError::Config("broker url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["api", "exchanges", self.vhost.as_str(), exchange, "publish"]);
        Ok(url)
    }
}

#[async_trait]
impl BrokerPublisher for HttpBrokerPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        let url = self.publish_url(&destination.exchange)?;
        let body = PublishRequest {
            properties: PublishProperties {
                delivery_mode: if options.persistent { 2 } else { 1 },
                message_id: &options.message_id,
                correlation_id: &options.correlation_id,
                content_type: "application/json",
                headers: &options.headers,
            },
            routing_key: &destination.routing_key,
            payload: BASE64.encode(payload),
            payload_encoding: "base64",
        };

        let mut request = self.client.post(url).timeout(options.timeout).json(&body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PublishError::Timeout(options.timeout.as_millis() as u64)
            } else {
                PublishError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("HTTP {status}: {text}")));
        }

        let result: PublishResponse = response.json().await?;
        if !result.routed {
            return Err(PublishError::Unroutable(destination.to_string()));
        }

        debug!(
            message_id = %options.message_id,
            destination = %destination,
            "Published message"
        );
        Ok(())
    }
}

/// Logs each publish and reports success. For dry runs without a broker.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl BrokerPublisher for LogPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        info!(
            message_id = %options.message_id,
            correlation_id = %options.correlation_id,
            destination = %destination,
            bytes = payload.len(),
            "Publish (log only)"
        );
        Ok(())
    }
}
