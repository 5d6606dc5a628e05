//! Node model — a remote federation peer, keyed by domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reachability status of a remote node.
///
/// `offline` is advisory: it records that recent deliveries failed but does
/// not stop future attempts. `blocked` is administrator-set only, is never
/// auto-assigned, and short-circuits all resolution and delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Blocked,
    Offline,
}

/// A known remote node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique federation domain (`node-b.example`).
    pub domain: String,

    /// Base URL of the node's federation API.
    pub federation_url: String,

    /// Advertised software version, from discovery.
    pub server_version: Option<String>,

    /// Advertised node public key, from discovery. Opaque; kept for
    /// fingerprint comparison by operators.
    pub public_key: Option<String>,

    pub status: NodeStatus,

    pub last_seen: Option<DateTime<Utc>>,

    /// Most recently observed delivery latency. Last write wins.
    pub avg_latency_ms: Option<i64>,

    /// Advertised user count, from discovery. Informational.
    pub user_count: i64,

    /// Discovery provenance: probed automatically vs. manually trusted.
    pub auto_discovered: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// The well-known federation API location for a domain that has not
    /// advertised anything better.
    pub fn default_federation_url(domain: &str) -> String {
        format!("https://{domain}/api/federation")
    }

    pub fn is_blocked(&self) -> bool {
        self.status == NodeStatus::Blocked
    }
}
