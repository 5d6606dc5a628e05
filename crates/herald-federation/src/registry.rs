//! Node registry — the reachability ledger for remote federation peers.
//!
//! Known nodes live in the durable store; the consecutive-failure streaks
//! that drive the `active -> offline` downgrade are kept in memory only.
//! They are advisory counters (a restart resets them, which merely delays a
//! downgrade by a few attempts), so they can be mutated by concurrent worker
//! reports without a global lock around the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use herald_common::error::{HeraldError, HeraldResult};
use herald_common::models::{Node, NodeStatus};
use herald_db::NodeStore;

use crate::discovery::RemoteDiscovery;

/// Tracks known remote nodes, their reachability, and discovery metadata.
pub struct NodeRegistry {
    nodes: Arc<dyn NodeStore>,
    discovery: Arc<dyn RemoteDiscovery>,
    /// domain -> consecutive delivery failures since the last success.
    streaks: RwLock<HashMap<String, u32>>,
    /// Failures in a row before a node is downgraded to offline.
    offline_threshold: u32,
}

impl NodeRegistry {
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        discovery: Arc<dyn RemoteDiscovery>,
        offline_threshold: u32,
    ) -> Self {
        Self { nodes, discovery, streaks: RwLock::new(HashMap::new()), offline_threshold }
    }

    /// Return the cached record for `domain`, or create one by probing the
    /// well-known discovery endpoint.
    ///
    /// A probe failure is not an error: unreachability is expected and
    /// recoverable, so an unknown-but-unreachable domain yields a record
    /// with status `offline` that future deliveries will keep retrying.
    pub async fn get_or_discover(&self, domain: &str) -> HeraldResult<Node> {
        if let Some(node) = self.nodes.find_by_domain(domain).await? {
            return Ok(node);
        }

        let now = Utc::now();
        let node = match self.discovery.discover(domain).await {
            Ok(doc) => {
                info!("Discovered federation node {} (version {})", domain, doc.version);
                Node {
                    domain: domain.to_owned(),
                    federation_url: doc.federation_api,
                    server_version: Some(doc.version),
                    public_key: doc.public_key,
                    status: NodeStatus::Active,
                    last_seen: Some(now),
                    avg_latency_ms: None,
                    user_count: doc.statistics.user_count,
                    auto_discovered: true,
                    created_at: now,
                    updated_at: now,
                }
            }
            Err(e) => {
                warn!("Discovery probe for {} failed: {}", domain, e);
                Node {
                    domain: domain.to_owned(),
                    federation_url: Node::default_federation_url(domain),
                    server_version: None,
                    public_key: None,
                    status: NodeStatus::Offline,
                    last_seen: None,
                    avg_latency_ms: None,
                    user_count: 0,
                    auto_discovered: true,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        self.nodes.insert(&node).await?;
        // A concurrent discovery of the same domain may have won the insert;
        // read back the authoritative row.
        Ok(self.nodes.find_by_domain(domain).await?.unwrap_or(node))
    }

    /// Feed a delivery outcome into the reachability signal.
    ///
    /// Success resets the failure streak and marks the node active with
    /// fresh last-seen/latency. Failure grows the streak; at the threshold
    /// the node is downgraded to `offline` — never to `blocked`, which is
    /// administrator-set only. Offline nodes still accept future attempts.
    pub async fn record_delivery_outcome(
        &self,
        domain: &str,
        success: bool,
        latency_ms: Option<i64>,
    ) -> HeraldResult<()> {
        if success {
            self.streaks.write().await.remove(domain);
            self.nodes.record_success(domain, latency_ms, Utc::now()).await?;
            return Ok(());
        }

        let streak = {
            let mut streaks = self.streaks.write().await;
            let streak = streaks.entry(domain.to_owned()).or_insert(0);
            *streak += 1;
            *streak
        };
        debug!("Delivery to {} failed ({} in a row)", domain, streak);

        if streak >= self.offline_threshold {
            if let Some(node) = self.nodes.find_by_domain(domain).await? {
                if node.status == NodeStatus::Active {
                    warn!(
                        "Node {} unreachable {} consecutive times, marking offline",
                        domain, streak
                    );
                    self.nodes.set_status(domain, NodeStatus::Offline, Utc::now()).await?;
                }
            }
        }
        Ok(())
    }

    /// Administratively block a domain. Resolution and queueing toward it
    /// fail fast from here on; outstanding tasks are parked, not failed.
    pub async fn set_blocked(&self, domain: &str) -> HeraldResult<()> {
        info!("Administratively blocking node {}", domain);
        self.nodes.set_status(domain, NodeStatus::Blocked, Utc::now()).await
    }

    /// Lift an administrative block. The node resumes as `offline` until a
    /// delivery succeeds.
    pub async fn set_unblocked(&self, domain: &str) -> HeraldResult<()> {
        info!("Unblocking node {}", domain);
        self.nodes.set_status(domain, NodeStatus::Offline, Utc::now()).await
    }

    /// Whether `domain` is currently blocked. Unknown domains are not.
    pub async fn is_blocked(&self, domain: &str) -> HeraldResult<bool> {
        Ok(self
            .nodes
            .find_by_domain(domain)
            .await?
            .map(|n| n.is_blocked())
            .unwrap_or(false))
    }

    /// Number of active peers, for the node statistics endpoints.
    pub async fn count_active(&self) -> HeraldResult<i64> {
        self.nodes.count_active().await
    }

    pub async fn find(&self, domain: &str) -> HeraldResult<Option<Node>> {
        self.nodes.find_by_domain(domain).await
    }

    /// Map a blocked-domain check into the caller-facing error.
    pub async fn ensure_not_blocked(&self, domain: &str) -> HeraldResult<()> {
        if self.is_blocked(domain).await? {
            return Err(HeraldError::FederationUnavailable { domain: domain.to_owned() });
        }
        Ok(())
    }
}
