//! Federation wire types — discovery documents, identity lookups, and the
//! delivery envelope exchanged between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Discovery document ──────────────────────────────────────────────────────

/// Metadata published at `/.well-known/herald-node` and consumed by peers
/// performing discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDiscoveryDocument {
    /// Federation protocol version.
    pub version: String,
    /// The canonical node domain (e.g. `herald.example.com`).
    pub domain: String,
    /// Base URL of the node's federation API.
    pub federation_api: String,
    /// Advertised node public key, if the node publishes one. Opaque; peers
    /// keep it for operator-level fingerprint comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Feature capabilities (e.g. `text_messages`, `image_sharing`).
    pub capabilities: Vec<String>,
    /// Largest encrypted payload this node accepts, in bytes.
    pub max_message_size: u64,
    /// Aggregate, non-PII statistics.
    pub statistics: NodeStatistics,
}

/// Aggregate statistics advertised in the discovery document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatistics {
    pub user_count: i64,
    pub federated_nodes: i64,
}

// ─── Identity lookup ─────────────────────────────────────────────────────────

/// Identity key material as served by `GET {fed}/identities/{handle}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIdentity {
    /// Full `local-part@domain` handle on the hosting node.
    pub handle: String,
    /// Public key material, PEM text. Opaque.
    pub public_key: String,
    /// The hosting node's claimed fingerprint. Advisory — the caller
    /// recomputes its own from `public_key`.
    pub public_key_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

// ─── Delivery envelope ───────────────────────────────────────────────────────

/// One encrypted message in flight between two nodes,
/// `POST {fed}/messages`.
///
/// `message_id` is the origin node's message id and doubles as the
/// idempotency key: a redelivered envelope is acknowledged without creating
/// a second record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub message_id: Uuid,
    pub sender_handle: String,
    pub recipient_handle: String,
    /// Sender's current public key, so the receiving node can seed its
    /// identity cache without an immediate discovery round-trip.
    pub sender_public_key: String,
    /// Client-encrypted payload. Opaque to both nodes.
    pub ciphertext: String,
    pub content_type: String,
    /// Domain of the originating node.
    pub origin_node: String,
    pub sent_at: DateTime<Utc>,
}

/// Acknowledgement returned by the receiving node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub accepted: bool,
    pub received_at: DateTime<Utc>,
}
