//! Remote discovery — probes a bare domain for its federation endpoint and
//! fetches identity key material from remote nodes.
//!
//! Resolution follows the well-known convention: a node at `node-b.example`
//! serves its discovery document at
//! `https://node-b.example/.well-known/herald-node`.
//!
//! Both operations wait on external network I/O and are individually
//! timeout-bounded so one unreachable peer cannot stall a request thread or
//! the delivery worker.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use herald_common::handle::Handle;
use herald_common::models::Node;

use crate::error::FederationError;
use crate::types::{NodeDiscoveryDocument, RemoteIdentity};

/// Remote Discovery Client contract consumed by the node registry and the
/// identity resolver. Implemented over HTTP in production and mocked in
/// tests.
#[async_trait]
pub trait RemoteDiscovery: Send + Sync {
    /// Probe `domain` for its discovery document.
    async fn discover(&self, domain: &str) -> Result<NodeDiscoveryDocument, FederationError>;

    /// Fetch current key material for an identity hosted on `node`.
    async fn lookup_identity(
        &self,
        node: &Node,
        handle: &Handle,
    ) -> Result<RemoteIdentity, FederationError>;
}

/// HTTP implementation of [`RemoteDiscovery`].
pub struct HttpDiscovery {
    http: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Herald-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build discovery http client");
        Self { http }
    }

    fn well_known_url(domain: &str) -> String {
        format!("https://{domain}/.well-known/herald-node")
    }
}

#[async_trait]
impl RemoteDiscovery for HttpDiscovery {
    async fn discover(&self, domain: &str) -> Result<NodeDiscoveryDocument, FederationError> {
        let url = Self::well_known_url(domain);
        debug!("Discovery probe: GET {}", url);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FederationError::from_reqwest(domain, e))?;

        if !resp.status().is_success() {
            return Err(FederationError::DiscoveryFailed(
                domain.to_owned(),
                format!("well-known endpoint returned {}", resp.status()),
            ));
        }

        let doc: NodeDiscoveryDocument = resp
            .json()
            .await
            .map_err(|_| FederationError::BadDiscoveryDocument(domain.to_owned()))?;
        Ok(doc)
    }

    async fn lookup_identity(
        &self,
        node: &Node,
        handle: &Handle,
    ) -> Result<RemoteIdentity, FederationError> {
        let url = format!("{}/identities/{}", node.federation_url.trim_end_matches('/'), handle);
        debug!("Identity lookup: GET {}", url);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FederationError::from_reqwest(&node.domain, e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FederationError::UnknownIdentity(handle.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FederationError::RemoteProtocol(
                node.domain.clone(),
                format!("identity lookup returned {}", resp.status()),
            ));
        }

        resp.json()
            .await
            .map_err(|_| FederationError::RemoteProtocol(
                node.domain.clone(),
                "malformed identity document".to_owned(),
            ))
    }
}
