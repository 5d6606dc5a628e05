//! Identity resolution — local vs. federated routing decisions.
//!
//! Resolution distinguishes two failures that look alike but demand
//! different reactions: `IdentityNotFound` ("this handle will never exist")
//! rejects a send outright, while `FederationUnavailable` ("the handle might
//! exist but its node is unreachable right now") still lets a send queue a
//! delivery attempt for later.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use herald_common::error::{HeraldError, HeraldResult};
use herald_common::fingerprint::{display_fingerprint, fingerprint};
use herald_common::handle::{Handle, parse_handle};
use herald_common::models::Identity;
use herald_db::IdentityStore;
use herald_federation::error::FederationError;
use herald_federation::registry::NodeRegistry;
use herald_federation::RemoteDiscovery;

/// How a recipient handle resolved for sending purposes.
#[derive(Debug)]
pub enum RecipientResolution {
    /// Key material on file, fresh or tolerated-stale.
    Resolved(Identity),
    /// The hosting node could not be reached; this is a cache stub whose key
    /// material arrives with a later refresh. Deliveries may still be queued
    /// against it.
    Unverified(Identity),
}

impl RecipientResolution {
    pub fn into_identity(self) -> Identity {
        match self {
            Self::Resolved(i) | Self::Unverified(i) => i,
        }
    }
}

/// Resolves handles and identifiers to identity records.
pub struct IdentityResolver {
    identities: Arc<dyn IdentityStore>,
    registry: Arc<NodeRegistry>,
    discovery: Arc<dyn RemoteDiscovery>,
    local_domain: String,
    freshness: chrono::Duration,
}

impl IdentityResolver {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        registry: Arc<NodeRegistry>,
        discovery: Arc<dyn RemoteDiscovery>,
        local_domain: impl Into<String>,
        freshness: chrono::Duration,
    ) -> Self {
        Self {
            identities,
            registry,
            discovery,
            local_domain: local_domain.into(),
            freshness,
        }
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Direct lookup by identifier.
    pub async fn resolve_by_id(&self, id: uuid::Uuid) -> HeraldResult<Identity> {
        self.identities
            .find_by_id(id)
            .await?
            .ok_or_else(|| HeraldError::IdentityNotFound { handle: id.to_string() })
    }

    /// Resolve a handle to an identity, performing remote discovery for
    /// foreign domains when the cache misses or has gone stale.
    pub async fn resolve_by_handle(&self, raw: &str) -> HeraldResult<Identity> {
        let handle = parse_handle(raw)?;

        if handle.is_local_to(&self.local_domain) {
            return self.resolve_local(&handle).await;
        }

        match self.resolve_federated(&handle, false).await? {
            RecipientResolution::Resolved(identity) => Ok(identity),
            // Stubs are only minted when the caller opted in.
            RecipientResolution::Unverified(_) => {
                Err(HeraldError::FederationUnavailable { domain: handle.domain })
            }
        }
    }

    /// Resolve a recipient for sending. Unlike [`resolve_by_handle`], an
    /// unreachable (but not blocked) foreign node yields an unverified stub
    /// instead of an error, so the send can create the message and queue a
    /// delivery attempt that may succeed once the node comes back.
    ///
    /// [`resolve_by_handle`]: IdentityResolver::resolve_by_handle
    pub async fn resolve_recipient(&self, raw: &str) -> HeraldResult<RecipientResolution> {
        let handle = parse_handle(raw)?;

        if handle.is_local_to(&self.local_domain) {
            return Ok(RecipientResolution::Resolved(self.resolve_local(&handle).await?));
        }

        self.resolve_federated(&handle, true).await
    }

    async fn resolve_local(&self, handle: &Handle) -> HeraldResult<Identity> {
        self.identities
            .find_by_handle(&handle.local_part, &handle.domain)
            .await?
            .filter(|i| i.is_local)
            .ok_or_else(|| HeraldError::IdentityNotFound { handle: handle.to_string() })
    }

    async fn resolve_federated(
        &self,
        handle: &Handle,
        allow_stub: bool,
    ) -> HeraldResult<RecipientResolution> {
        let now = Utc::now();
        let cached = self
            .identities
            .find_by_handle(&handle.local_part, &handle.domain)
            .await?;

        if let Some(identity) = &cached {
            if identity.is_fresh(now, self.freshness) {
                debug!("Federated identity cache hit: {}", handle);
                return Ok(RecipientResolution::Resolved(identity.clone()));
            }
        }

        // Cache miss or stale entry: we need the hosting node.
        let node = self.registry.get_or_discover(&handle.domain).await?;
        if node.is_blocked() {
            return Err(HeraldError::FederationUnavailable { domain: handle.domain.clone() });
        }

        match self.discovery.lookup_identity(&node, handle).await {
            Ok(remote) => {
                // The fingerprint is recomputed locally; the remote's claim
                // is advisory.
                let fp = fingerprint(&remote.public_key);
                if remote.public_key_fingerprint != fp {
                    warn!(
                        "Node {} claims fingerprint {} for {} but key hashes to {}",
                        node.domain, remote.public_key_fingerprint, handle, fp
                    );
                }

                let identity = match cached {
                    Some(existing) => {
                        if !existing.public_key_fingerprint.is_empty()
                            && existing.public_key_fingerprint != fp
                        {
                            warn!(
                                "Public key for {} changed since last refresh (now {})",
                                handle,
                                display_fingerprint(&fp)
                            );
                        }
                        self.identities
                            .refresh_federated(existing.id, &remote.public_key, &fp, now)
                            .await?;
                        Identity {
                            public_key: remote.public_key,
                            public_key_fingerprint: fp,
                            refreshed_at: Some(now),
                            ..existing
                        }
                    }
                    None => {
                        let identity = Identity::federated(handle, &remote.public_key, now);
                        self.identities.insert(&identity).await?;
                        // A concurrent resolution may have won the insert.
                        self.identities
                            .find_by_handle(&handle.local_part, &handle.domain)
                            .await?
                            .unwrap_or(identity)
                    }
                };
                Ok(RecipientResolution::Resolved(identity))
            }
            Err(FederationError::UnknownIdentity(_)) => {
                Err(HeraldError::IdentityNotFound { handle: handle.to_string() })
            }
            Err(e) => {
                warn!("Discovery against {} failed: {}", node.domain, e);

                // A stale entry beats no entry: the payload was encrypted by
                // the client, so outdated key material here only delays the
                // next refresh.
                if let Some(stale) = cached {
                    return Ok(RecipientResolution::Resolved(stale));
                }
                if allow_stub {
                    let stub = Identity::federated_stub(handle, now);
                    self.identities.insert(&stub).await?;
                    let stub = self
                        .identities
                        .find_by_handle(&handle.local_part, &handle.domain)
                        .await?
                        .unwrap_or(stub);
                    return Ok(RecipientResolution::Unverified(stub));
                }
                Err(HeraldError::FederationUnavailable { domain: handle.domain.clone() })
            }
        }
    }
}
