//! Identity model — a participant in the federation, local or remote.
//!
//! Local identities are created at registration by the account subsystem and
//! only mutated by profile updates. Federated identities are lazy cache
//! entries created on first resolution and refreshed by re-discovery; neither
//! kind is hard-deleted in normal operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::fingerprint;
use crate::handle::Handle;

/// A messaging identity known to this node.
///
/// The (local_part, domain) pair is unique across all identities the node
/// knows about, local and federated alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,

    pub local_part: String,

    pub domain: String,

    /// Public key material, PEM text. Opaque to the server — clients encrypt
    /// against it; the server only stores and relays it. Empty for an
    /// unverified stub created while the hosting node was unreachable.
    pub public_key: String,

    /// SHA-256 of `public_key`, lower-hex. Recomputed from the key, never
    /// supplied independently for local identities.
    pub public_key_fingerprint: String,

    /// Local account vs. federated cache entry.
    pub is_local: bool,

    /// Profile fields, maintained by the account subsystem.
    pub avatar_url: Option<String>,
    pub status_message: Option<String>,

    pub last_seen: Option<DateTime<Utc>>,

    /// For federated entries: when the cached key material was last confirmed
    /// against the hosting node. `None` means never verified (stub).
    pub refreshed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Full `local-part@domain` handle.
    pub fn handle(&self) -> Handle {
        Handle { local_part: self.local_part.clone(), domain: self.domain.clone() }
    }

    /// Create a federated cache entry from key material fetched off a remote
    /// node. The fingerprint is recomputed here regardless of what the remote
    /// claimed.
    pub fn federated(handle: &Handle, public_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_part: handle.local_part.clone(),
            domain: handle.domain.clone(),
            public_key: public_key.to_owned(),
            public_key_fingerprint: fingerprint(public_key),
            is_local: false,
            avatar_url: None,
            status_message: None,
            last_seen: None,
            refreshed_at: Some(now),
            created_at: now,
        }
    }

    /// Create an unverified federated stub for a handle whose hosting node
    /// could not be reached. Key material is filled in by a later refresh.
    pub fn federated_stub(handle: &Handle, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_part: handle.local_part.clone(),
            domain: handle.domain.clone(),
            public_key: String::new(),
            public_key_fingerprint: String::new(),
            is_local: false,
            avatar_url: None,
            status_message: None,
            last_seen: None,
            refreshed_at: None,
            created_at: now,
        }
    }

    /// Whether a federated cache entry is still fresh at `now`.
    /// Local identities are authoritative and always fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, freshness: chrono::Duration) -> bool {
        if self.is_local {
            return true;
        }
        match self.refreshed_at {
            Some(at) => now - at < freshness,
            None => false,
        }
    }
}
