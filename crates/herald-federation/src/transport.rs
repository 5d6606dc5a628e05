//! Outbound transport — hands sealed delivery envelopes to remote nodes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use herald_common::models::Node;

use crate::error::FederationError;
use crate::types::{DeliveryEnvelope, DeliveryReceipt};

/// Result of a successful hand-off.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryOutcome {
    /// Round-trip latency observed for the delivery request.
    pub latency_ms: i64,
}

/// Outbound Transport contract consumed by the delivery worker.
///
/// A returned error means the *transport* failed — the distinction matters
/// because only confirmed transport failures consume a retry attempt.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn deliver(
        &self,
        node: &Node,
        envelope: &DeliveryEnvelope,
    ) -> Result<DeliveryOutcome, FederationError>;
}

/// HTTP implementation of [`OutboundTransport`].
///
/// `POST {federation_url}/messages` with the envelope as JSON body. The
/// remote acknowledges with a [`DeliveryReceipt`].
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Herald-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build transport http client");
        Self { http }
    }
}

#[async_trait]
impl OutboundTransport for HttpTransport {
    async fn deliver(
        &self,
        node: &Node,
        envelope: &DeliveryEnvelope,
    ) -> Result<DeliveryOutcome, FederationError> {
        let url = format!("{}/messages", node.federation_url.trim_end_matches('/'));
        debug!("Delivery POST {} (message {})", url, envelope.message_id);

        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| FederationError::from_reqwest(&node.domain, e))?;

        if !resp.status().is_success() {
            return Err(FederationError::RemoteProtocol(
                node.domain.clone(),
                format!("delivery returned {}", resp.status()),
            ));
        }

        let receipt: DeliveryReceipt = resp.json().await.map_err(|_| {
            FederationError::RemoteProtocol(node.domain.clone(), "malformed receipt".to_owned())
        })?;
        if !receipt.accepted {
            return Err(FederationError::RemoteProtocol(
                node.domain.clone(),
                "remote node rejected the envelope".to_owned(),
            ));
        }

        Ok(DeliveryOutcome { latency_ms: started.elapsed().as_millis() as i64 })
    }
}
