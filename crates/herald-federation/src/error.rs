//! Federation-specific error types.

use thiserror::Error;

/// Errors that can occur in federation operations.
///
/// The split between [`UnknownIdentity`](FederationError::UnknownIdentity)
/// and the reachability variants is load-bearing: the resolver maps the
/// former to a permanent `IdentityNotFound` and everything else to a
/// recoverable `FederationUnavailable`.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Discovery ───────────────────────────────────────────────────────────

    #[error("Failed to discover node '{0}': {1}")]
    DiscoveryFailed(String, String),

    #[error("Node '{0}' returned a bad discovery document")]
    BadDiscoveryDocument(String),

    // ── Remote communication ────────────────────────────────────────────────

    #[error("Node '{0}' is not reachable: {1}")]
    Unreachable(String, String),

    #[error("Node '{0}' returned an unexpected response: {1}")]
    RemoteProtocol(String, String),

    #[error("Request to node '{0}' timed out")]
    Timeout(String),

    // ── Identity lookup ─────────────────────────────────────────────────────

    #[error("Node reports no identity for '{0}'")]
    UnknownIdentity(String),

    // ── Policy ──────────────────────────────────────────────────────────────

    #[error("Node '{0}' is administratively blocked")]
    NodeBlocked(String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl FederationError {
    /// Attach the remote domain to a transport-level reqwest failure.
    pub fn from_reqwest(domain: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FederationError::Timeout(domain.to_owned())
        } else if e.is_connect() {
            FederationError::Unreachable(domain.to_owned(), e.to_string())
        } else {
            FederationError::RemoteProtocol(domain.to_owned(), e.to_string())
        }
    }
}
