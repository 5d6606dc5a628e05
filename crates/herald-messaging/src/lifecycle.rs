//! Message lifecycle — the per-message state machine and its operations.
//!
//! States: `pending -> delivered -> read`, with `pending -> failed` as the
//! failure edge. `read` and `failed` are terminal. Local deliveries are
//! synchronous: a successful send response already carries the `delivered`
//! state. Federated deliveries return `pending` and progress through the
//! delivery queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use herald_common::config::{FederationConfig, LimitsConfig};
use herald_common::error::{HeraldError, HeraldResult};
use herald_common::handle::parse_handle;
use herald_common::models::message::{ConversationPage, SendMessageRequest};
use herald_common::models::{
    DeliveryTask, Identity, Message, MessageStatus, Target,
};
use herald_common::validation::validate_request;
use herald_db::{DeliveryTaskStore, IdentityStore, MessageStore};
use herald_federation::types::DeliveryEnvelope;

use crate::resolver::IdentityResolver;

/// Owns every state transition of a message record. Nothing else mutates
/// messages.
pub struct MessageLifecycle {
    messages: Arc<dyn MessageStore>,
    tasks: Arc<dyn DeliveryTaskStore>,
    identities: Arc<dyn IdentityStore>,
    resolver: Arc<IdentityResolver>,
    local_domain: String,
    limits: LimitsConfig,
    max_attempts: u32,
}

impl MessageLifecycle {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        tasks: Arc<dyn DeliveryTaskStore>,
        identities: Arc<dyn IdentityStore>,
        resolver: Arc<IdentityResolver>,
        limits: LimitsConfig,
        federation: &FederationConfig,
    ) -> Self {
        let local_domain = resolver.local_domain().to_owned();
        Self {
            messages,
            tasks,
            identities,
            resolver,
            local_domain,
            limits,
            max_attempts: federation.max_attempts,
        }
    }

    // ─── Send ────────────────────────────────────────────────────────────────

    /// Create a message and either deliver it locally (synchronously) or
    /// queue a federated delivery task.
    ///
    /// Validation happens before any record exists: exactly one target,
    /// payload under the ceiling. A recipient whose node is unreachable (but
    /// not blocked) does not fail the send — the message is created and the
    /// delivery task waits out the outage.
    pub async fn send(
        &self,
        sender: &Identity,
        request: &SendMessageRequest,
    ) -> HeraldResult<Message> {
        validate_request(request)?;

        if request.ciphertext.len() as u64 > self.limits.max_message_size_bytes {
            return Err(HeraldError::PayloadTooLarge {
                limit: self.limits.max_message_size_bytes,
            });
        }

        match (&request.recipient_handle, request.group_id) {
            (Some(recipient_handle), None) => {
                self.send_direct(sender, recipient_handle, request).await
            }
            (None, Some(group_id)) => self.send_group(sender, group_id, request).await,
            _ => Err(HeraldError::InvalidTarget),
        }
    }

    async fn send_direct(
        &self,
        sender: &Identity,
        recipient_handle: &str,
        request: &SendMessageRequest,
    ) -> HeraldResult<Message> {
        let recipient = self
            .resolver
            .resolve_recipient(recipient_handle)
            .await?
            .into_identity();

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: Some(sender.id),
            target: Target::Direct(recipient.id),
            ciphertext: request.ciphertext.clone(),
            size_bytes: request.ciphertext.len() as i64,
            content_type: request.content_type.clone(),
            sender_handle: sender.handle().to_string(),
            recipient_handle: Some(recipient.handle().to_string()),
            origin_node: self.local_domain.clone(),
            status: MessageStatus::Pending,
            created_at: now,
            delivered_at: None,
            read_at: None,
        };

        if recipient.is_local {
            // Local delivery is synchronous and observable: the record is
            // durably pending, then flipped before the call returns.
            self.messages.insert_with_task(&message, None).await?;
            let delivered = self
                .messages
                .mark_delivered(message.id, now)
                .await?
                .unwrap_or(message);
            debug!("Delivered local message {} to {}", delivered.id, recipient.handle());
            Ok(delivered)
        } else {
            let task =
                DeliveryTask::new(message.id, &recipient.domain, self.max_attempts, now);
            self.messages.insert_with_task(&message, Some(&task)).await?;
            info!(
                "Queued message {} for {} via {}",
                message.id,
                recipient.handle(),
                recipient.domain
            );
            Ok(message)
        }
    }

    async fn send_group(
        &self,
        sender: &Identity,
        group_id: Uuid,
        request: &SendMessageRequest,
    ) -> HeraldResult<Message> {
        // Group fan-out is the group subsystem's concern; the core stores
        // the record and leaves delivery marking to that path.
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: Some(sender.id),
            target: Target::Group(group_id),
            ciphertext: request.ciphertext.clone(),
            size_bytes: request.ciphertext.len() as i64,
            content_type: request.content_type.clone(),
            sender_handle: sender.handle().to_string(),
            recipient_handle: None,
            origin_node: self.local_domain.clone(),
            status: MessageStatus::Pending,
            created_at: now,
            delivered_at: None,
            read_at: None,
        };
        self.messages.insert_with_task(&message, None).await?;
        Ok(message)
    }

    // ─── Delivery outcomes (reported by the worker) ──────────────────────────

    /// `pending -> delivered`, reported after a successful remote hand-off.
    pub async fn mark_delivered(&self, message_id: Uuid) -> HeraldResult<()> {
        match self.messages.mark_delivered(message_id, Utc::now()).await? {
            Some(m) => info!("Message {} delivered", m.id),
            None => debug!("Message {} was not pending; delivery mark skipped", message_id),
        }
        Ok(())
    }

    /// `pending -> failed`, but only when no other outstanding task for the
    /// message could still succeed.
    pub async fn mark_failed(&self, message_id: Uuid) -> HeraldResult<()> {
        if self.tasks.pending_for_message(message_id).await? > 0 {
            debug!(
                "Message {} still has outstanding delivery tasks; not failing",
                message_id
            );
            return Ok(());
        }
        if let Some(m) = self.messages.mark_failed(message_id).await? {
            warn!("Message {} permanently failed", m.id);
        }
        Ok(())
    }

    // ─── Read acknowledgement ────────────────────────────────────────────────

    /// `delivered -> read`, acknowledged by the recipient.
    ///
    /// Only the recipient may acknowledge. Re-acknowledging an already-read
    /// message is idempotent: no error, no state change, timestamp unchanged.
    pub async fn mark_read(&self, message_id: Uuid, caller_id: Uuid) -> HeraldResult<Message> {
        let message = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| HeraldError::NotFound { resource: "Message".into() })?;

        match message.target {
            Target::Direct(recipient_id) if recipient_id == caller_id => {}
            _ => return Err(HeraldError::Forbidden),
        }

        match message.status {
            MessageStatus::Read => Ok(message),
            MessageStatus::Delivered => {
                match self.messages.mark_read(message_id, Utc::now()).await? {
                    Some(updated) => Ok(updated),
                    // A concurrent acknowledgement won; surface its result.
                    None => self
                        .messages
                        .find_by_id(message_id)
                        .await?
                        .filter(|m| m.status == MessageStatus::Read)
                        .ok_or_else(|| HeraldError::Validation {
                            message: "message is not in a readable state".into(),
                        }),
                }
            }
            MessageStatus::Pending | MessageStatus::Failed => Err(HeraldError::Validation {
                message: "message has not been delivered".into(),
            }),
        }
    }

    // ─── Conversation retrieval ──────────────────────────────────────────────

    /// Messages between the caller and `other_handle`, newest first, with a
    /// strict `before` cursor.
    ///
    /// The cursor only ever excludes messages with `created_at >= before`,
    /// so pages stay stable while newer messages keep arriving.
    pub async fn conversation(
        &self,
        caller: &Identity,
        other_handle: &str,
        limit: Option<u32>,
        before: Option<DateTime<Utc>>,
    ) -> HeraldResult<ConversationPage> {
        let other = self.resolver.resolve_by_handle(other_handle).await?;

        let limit = limit
            .unwrap_or(50)
            .clamp(1, self.limits.max_conversation_page) as i64;

        // Fetch one extra row to learn whether another page exists.
        let mut messages = self
            .messages
            .conversation_page(caller.id, other.id, before, limit + 1)
            .await?;

        let has_more = messages.len() as i64 > limit;
        if has_more {
            messages.truncate(limit as usize);
        }
        let next_cursor = if has_more {
            messages.last().map(|m| m.created_at)
        } else {
            None
        };

        Ok(ConversationPage {
            messages: messages.into_iter().map(Into::into).collect(),
            has_more,
            next_cursor,
        })
    }

    // ─── Inbound federated delivery ──────────────────────────────────────────

    /// Accept a delivery envelope from a remote node.
    ///
    /// The recipient must be hosted here. The envelope's message id is the
    /// idempotency key: redelivery returns the already-stored record. An
    /// unknown federated sender is cached from the key material the envelope
    /// carries, so a reply can route without a discovery round-trip.
    pub async fn receive_federated(&self, envelope: &DeliveryEnvelope) -> HeraldResult<Message> {
        let recipient_handle = parse_handle(&envelope.recipient_handle)?;
        if !recipient_handle.is_local_to(&self.local_domain) {
            return Err(HeraldError::Validation {
                message: format!(
                    "recipient '{}' is not hosted on this node",
                    envelope.recipient_handle
                ),
            });
        }

        if envelope.ciphertext.len() as u64 > self.limits.max_message_size_bytes {
            return Err(HeraldError::PayloadTooLarge {
                limit: self.limits.max_message_size_bytes,
            });
        }

        let recipient = self
            .identities
            .find_by_handle(&recipient_handle.local_part, &recipient_handle.domain)
            .await?
            .filter(|i| i.is_local)
            .ok_or_else(|| HeraldError::IdentityNotFound {
                handle: envelope.recipient_handle.clone(),
            })?;

        if let Some(existing) = self.messages.find_by_id(envelope.message_id).await? {
            debug!("Envelope {} already stored; acknowledging again", envelope.message_id);
            return Ok(existing);
        }

        let sender_handle = parse_handle(&envelope.sender_handle)?;
        let sender = match self
            .identities
            .find_by_handle(&sender_handle.local_part, &sender_handle.domain)
            .await?
        {
            Some(identity) => identity,
            None => {
                let identity =
                    Identity::federated(&sender_handle, &envelope.sender_public_key, Utc::now());
                self.identities.insert(&identity).await?;
                self.identities
                    .find_by_handle(&sender_handle.local_part, &sender_handle.domain)
                    .await?
                    .unwrap_or(identity)
            }
        };

        let now = Utc::now();
        let message = Message {
            id: envelope.message_id,
            sender_id: Some(sender.id),
            target: Target::Direct(recipient.id),
            ciphertext: envelope.ciphertext.clone(),
            size_bytes: envelope.ciphertext.len() as i64,
            content_type: envelope.content_type.clone(),
            sender_handle: envelope.sender_handle.clone(),
            recipient_handle: Some(envelope.recipient_handle.clone()),
            origin_node: envelope.origin_node.clone(),
            status: MessageStatus::Pending,
            created_at: now,
            delivered_at: None,
            read_at: None,
        };
        self.messages.insert_with_task(&message, None).await?;

        // The recipient is local: the hand-off to this node is the delivery.
        let delivered = self
            .messages
            .mark_delivered(message.id, now)
            .await?
            .unwrap_or(message);
        info!(
            "Accepted federated message {} from {}",
            delivered.id, envelope.origin_node
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_common::fingerprint::fingerprint;
    use herald_common::handle::Handle;
    use herald_common::models::{Node, TaskStatus};
    use herald_db::Database;
    use herald_federation::error::FederationError;
    use herald_federation::registry::NodeRegistry;
    use herald_federation::types::{NodeDiscoveryDocument, NodeStatistics, RemoteIdentity};
    use herald_federation::RemoteDiscovery;
    use std::collections::HashMap;

    struct MockDiscovery {
        remote_identities: HashMap<String, String>,
        reachable: bool,
    }

    #[async_trait]
    impl RemoteDiscovery for MockDiscovery {
        async fn discover(
            &self,
            domain: &str,
        ) -> Result<NodeDiscoveryDocument, FederationError> {
            if !self.reachable {
                return Err(FederationError::Unreachable(domain.to_owned(), "down".into()));
            }
            Ok(NodeDiscoveryDocument {
                version: "1.0".into(),
                domain: domain.to_owned(),
                federation_api: format!("https://{domain}/api/federation"),
                public_key: None,
                capabilities: vec!["text_messages".into()],
                max_message_size: 10_485_760,
                statistics: NodeStatistics { user_count: 1, federated_nodes: 0 },
            })
        }

        async fn lookup_identity(
            &self,
            node: &Node,
            handle: &Handle,
        ) -> Result<RemoteIdentity, FederationError> {
            if !self.reachable {
                return Err(FederationError::Unreachable(node.domain.clone(), "down".into()));
            }
            match self.remote_identities.get(&handle.to_string()) {
                Some(key) => Ok(RemoteIdentity {
                    handle: handle.to_string(),
                    public_key: key.clone(),
                    public_key_fingerprint: fingerprint(key),
                    avatar_url: None,
                    status_message: None,
                }),
                None => Err(FederationError::UnknownIdentity(handle.to_string())),
            }
        }
    }

    struct Harness {
        db: Database,
        lifecycle: MessageLifecycle,
        alice: Identity,
        bob: Identity,
    }

    fn local_identity(local_part: &str) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            local_part: local_part.to_owned(),
            domain: "node-a.test".to_owned(),
            public_key: format!("{local_part}-key"),
            public_key_fingerprint: fingerprint(&format!("{local_part}-key")),
            is_local: true,
            avatar_url: None,
            status_message: None,
            last_seen: None,
            refreshed_at: None,
            created_at: Utc::now(),
        }
    }

    fn limits() -> LimitsConfig {
        LimitsConfig { max_message_size_bytes: 1024, max_conversation_page: 100 }
    }

    fn federation_cfg() -> FederationConfig {
        FederationConfig {
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
            claim_lease_secs: 60,
            offline_threshold: 3,
            identity_freshness_secs: 86_400,
            discovery_timeout_secs: 5,
            transport_timeout_secs: 30,
            worker_poll_interval_secs: 1,
            worker_count: 1,
        }
    }

    async fn harness(remote: &[(&str, &str)], reachable: bool) -> Harness {
        let db = Database::in_memory();
        let alice = local_identity("alice");
        let bob = local_identity("bob");
        db.identities.insert(&alice).await.unwrap();
        db.identities.insert(&bob).await.unwrap();

        let discovery: Arc<dyn RemoteDiscovery> = Arc::new(MockDiscovery {
            remote_identities: remote
                .iter()
                .map(|(h, k)| ((*h).to_owned(), (*k).to_owned()))
                .collect(),
            reachable,
        });
        let registry = Arc::new(NodeRegistry::new(db.nodes.clone(), discovery.clone(), 3));
        let resolver = Arc::new(IdentityResolver::new(
            db.identities.clone(),
            registry,
            discovery,
            "node-a.test",
            chrono::Duration::hours(24),
        ));
        let lifecycle = MessageLifecycle::new(
            db.messages.clone(),
            db.tasks.clone(),
            db.identities.clone(),
            resolver,
            limits(),
            &federation_cfg(),
        );
        Harness { db, lifecycle, alice, bob }
    }

    fn send_req(recipient: &str, body: &str) -> SendMessageRequest {
        SendMessageRequest {
            recipient_handle: Some(recipient.to_owned()),
            group_id: None,
            ciphertext: body.to_owned(),
            content_type: "text".to_owned(),
        }
    }

    // ── Send validation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn local_send_is_delivered_synchronously() {
        let h = harness(&[], true).await;
        let message = h
            .lifecycle
            .send(&h.alice, &send_req("bob@node-a.test", &"x".repeat(100)))
            .await
            .unwrap();

        assert_eq!(message.status, MessageStatus::Delivered);
        assert!(message.delivered_at.is_some());
        assert_eq!(message.sender_handle, "alice@node-a.test");
        assert_eq!(message.recipient_handle.as_deref(), Some("bob@node-a.test"));

        // Zero delivery tasks for a local send.
        assert!(h.db.tasks.find_by_message(message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn neither_or_both_targets_is_invalid() {
        let h = harness(&[], true).await;

        let neither = SendMessageRequest {
            recipient_handle: None,
            group_id: None,
            ciphertext: "ct".into(),
            content_type: "text".into(),
        };
        assert!(matches!(
            h.lifecycle.send(&h.alice, &neither).await.unwrap_err(),
            HeraldError::InvalidTarget
        ));

        let both = SendMessageRequest {
            recipient_handle: Some("bob@node-a.test".into()),
            group_id: Some(Uuid::new_v4()),
            ciphertext: "ct".into(),
            content_type: "text".into(),
        };
        assert!(matches!(
            h.lifecycle.send(&h.alice, &both).await.unwrap_err(),
            HeraldError::InvalidTarget
        ));

        // No record was created either time.
        let page = h
            .lifecycle
            .conversation(&h.alice, "bob@node-a.test", None, None)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_any_record() {
        let h = harness(&[], true).await;
        let err = h
            .lifecycle
            .send(&h.alice, &send_req("bob@node-a.test", &"x".repeat(2000)))
            .await
            .unwrap_err();
        assert!(matches!(err, HeraldError::PayloadTooLarge { limit: 1024 }));

        let page = h
            .lifecycle
            .conversation(&h.alice, "bob@node-a.test", None, None)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_recipient_rejects_send() {
        let h = harness(&[], true).await;
        assert!(matches!(
            h.lifecycle
                .send(&h.alice, &send_req("ghost@node-a.test", "ct"))
                .await
                .unwrap_err(),
            HeraldError::IdentityNotFound { .. }
        ));
    }

    // ── Federated send ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn federated_send_queues_one_task() {
        let h = harness(&[("carol@node-b.test", "carol-key")], true).await;
        let message = h
            .lifecycle
            .send(&h.alice, &send_req("carol@node-b.test", "ct"))
            .await
            .unwrap();

        assert_eq!(message.status, MessageStatus::Pending);
        assert!(message.delivered_at.is_none());

        let tasks = h.db.tasks.find_by_message(message.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].attempts, 0);
        assert_eq!(tasks[0].max_attempts, 5);
        assert_eq!(tasks[0].target_node, "node-b.test");
    }

    #[tokio::test]
    async fn unreachable_node_still_accepts_the_send() {
        let h = harness(&[], false).await;
        let message = h
            .lifecycle
            .send(&h.alice, &send_req("carol@node-b.test", "ct"))
            .await
            .unwrap();

        // The send succeeded even though discovery failed; delivery waits
        // out the outage in the queue.
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(h.db.tasks.find_by_message(message.id).await.unwrap().len(), 1);
    }

    // ── Delivery outcome edges ───────────────────────────────────────────────

    #[tokio::test]
    async fn delivered_and_failed_marks_follow_task_state() {
        let h = harness(&[("carol@node-b.test", "carol-key")], true).await;
        let message = h
            .lifecycle
            .send(&h.alice, &send_req("carol@node-b.test", "ct"))
            .await
            .unwrap();
        let task = h.db.tasks.find_by_message(message.id).await.unwrap().remove(0);

        // With the task still pending, a failure report does not fail the
        // message.
        h.lifecycle.mark_failed(message.id).await.unwrap();
        assert_eq!(
            h.db.messages.find_by_id(message.id).await.unwrap().unwrap().status,
            MessageStatus::Pending
        );

        // Once the task is terminally failed, the message follows.
        h.db.tasks.mark_failed(task.id, "exhausted").await.unwrap();
        h.lifecycle.mark_failed(message.id).await.unwrap();
        assert_eq!(
            h.db.messages.find_by_id(message.id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );

        // failed is terminal: a late success report cannot resurrect it.
        h.lifecycle.mark_delivered(message.id).await.unwrap();
        assert_eq!(
            h.db.messages.find_by_id(message.id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    // ── Read acknowledgement ─────────────────────────────────────────────────

    #[tokio::test]
    async fn mark_read_is_recipient_only_and_idempotent() {
        let h = harness(&[], true).await;
        let message = h
            .lifecycle
            .send(&h.alice, &send_req("bob@node-a.test", "ct"))
            .await
            .unwrap();

        // The sender cannot acknowledge their own message.
        assert!(matches!(
            h.lifecycle.mark_read(message.id, h.alice.id).await.unwrap_err(),
            HeraldError::Forbidden
        ));

        let read = h.lifecycle.mark_read(message.id, h.bob.id).await.unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        let first_read_at = read.read_at.unwrap();

        // Second acknowledgement: same state, same timestamp, no error.
        let again = h.lifecycle.mark_read(message.id, h.bob.id).await.unwrap();
        assert_eq!(again.status, MessageStatus::Read);
        assert_eq!(again.read_at.unwrap(), first_read_at);
    }

    #[tokio::test]
    async fn mark_read_missing_message_is_not_found() {
        let h = harness(&[], true).await;
        assert!(matches!(
            h.lifecycle.mark_read(Uuid::new_v4(), h.bob.id).await.unwrap_err(),
            HeraldError::NotFound { .. }
        ));
    }

    // ── Conversation pagination ──────────────────────────────────────────────

    /// Insert a direct message with a controlled timestamp, bypassing send.
    async fn seed_message(
        h: &Harness,
        from: &Identity,
        to: &Identity,
        body: &str,
        at: DateTime<Utc>,
    ) {
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: Some(from.id),
            target: Target::Direct(to.id),
            ciphertext: body.to_owned(),
            size_bytes: body.len() as i64,
            content_type: "text".into(),
            sender_handle: from.handle().to_string(),
            recipient_handle: Some(to.handle().to_string()),
            origin_node: "node-a.test".into(),
            status: MessageStatus::Delivered,
            created_at: at,
            delivered_at: Some(at),
            read_at: None,
        };
        h.db.messages.insert_with_task(&message, None).await.unwrap();
    }

    #[tokio::test]
    async fn conversation_pages_are_stable_and_gapless() {
        let h = harness(&[], true).await;
        let base = Utc::now();

        // 25 messages alternating direction, one second apart.
        for i in 0..25 {
            let at = base + chrono::Duration::seconds(i);
            if i % 2 == 0 {
                seed_message(&h, &h.alice, &h.bob, &format!("m{i}"), at).await;
            } else {
                seed_message(&h, &h.bob, &h.alice, &format!("m{i}"), at).await;
            }
        }

        let first = h
            .lifecycle
            .conversation(&h.alice, "bob@node-a.test", Some(10), None)
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 10);
        assert!(first.has_more);
        let cursor = first.next_cursor.unwrap();
        assert_eq!(cursor, first.messages.last().unwrap().created_at);

        // Newest first within the page.
        for pair in first.messages.windows(2) {
            assert!(pair[0].created_at > pair[1].created_at);
        }

        // A newer message arriving between pages must not disturb the cursor.
        seed_message(&h, &h.bob, &h.alice, "late", base + chrono::Duration::seconds(99))
            .await;

        let second = h
            .lifecycle
            .conversation(&h.alice, "bob@node-a.test", Some(10), Some(cursor))
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 10);
        assert!(second.has_more);
        // Strictly older than the cursor — no duplicates across pages.
        assert!(second.messages.iter().all(|m| m.created_at < cursor));

        let third = h
            .lifecycle
            .conversation(&h.alice, "bob@node-a.test", Some(10), second.next_cursor)
            .await
            .unwrap();
        assert_eq!(third.messages.len(), 5);
        assert!(!third.has_more);
        assert!(third.next_cursor.is_none());

        // Concatenated pages cover all 25 original messages exactly once.
        let mut seen: Vec<Uuid> = first
            .messages
            .iter()
            .chain(&second.messages)
            .chain(&third.messages)
            .map(|m| m.id)
            .collect();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(total, 25);
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn conversation_limit_is_clamped() {
        let h = harness(&[], true).await;
        let base = Utc::now();
        for i in 0..3 {
            seed_message(&h, &h.alice, &h.bob, "m", base + chrono::Duration::seconds(i)).await;
        }

        // An oversized limit is clamped to the configured page ceiling.
        let page = h
            .lifecycle
            .conversation(&h.alice, "bob@node-a.test", Some(10_000), None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(!page.has_more);
    }

    // ── Inbound federated delivery ───────────────────────────────────────────

    fn envelope_for(h: &Harness, id: Uuid) -> DeliveryEnvelope {
        DeliveryEnvelope {
            message_id: id,
            sender_handle: "carol@node-b.test".into(),
            recipient_handle: h.bob.handle().to_string(),
            sender_public_key: "carol-key".into(),
            ciphertext: "ct".into(),
            content_type: "text".into(),
            origin_node: "node-b.test".into(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn inbound_envelope_is_stored_delivered_and_seeds_sender() {
        let h = harness(&[], true).await;
        let id = Uuid::new_v4();

        let message = h.lifecycle.receive_federated(&envelope_for(&h, id)).await.unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.origin_node, "node-b.test");

        // The unknown sender was cached from the envelope's key material.
        let carol = h
            .db
            .identities
            .find_by_handle("carol", "node-b.test")
            .await
            .unwrap()
            .unwrap();
        assert!(!carol.is_local);
        assert_eq!(carol.public_key, "carol-key");
        assert_eq!(carol.public_key_fingerprint, fingerprint("carol-key"));
    }

    #[tokio::test]
    async fn inbound_redelivery_is_idempotent() {
        let h = harness(&[], true).await;
        let id = Uuid::new_v4();

        let first = h.lifecycle.receive_federated(&envelope_for(&h, id)).await.unwrap();
        let mut replay = envelope_for(&h, id);
        replay.ciphertext = "tampered".into();
        let second = h.lifecycle.receive_federated(&replay).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.ciphertext, "ct");
    }

    #[tokio::test]
    async fn inbound_for_foreign_or_unknown_recipient_is_rejected() {
        let h = harness(&[], true).await;

        let mut foreign = envelope_for(&h, Uuid::new_v4());
        foreign.recipient_handle = "dave@node-c.test".into();
        assert!(matches!(
            h.lifecycle.receive_federated(&foreign).await.unwrap_err(),
            HeraldError::Validation { .. }
        ));

        let mut unknown = envelope_for(&h, Uuid::new_v4());
        unknown.recipient_handle = "ghost@node-a.test".into();
        assert!(matches!(
            h.lifecycle.receive_federated(&unknown).await.unwrap_err(),
            HeraldError::IdentityNotFound { .. }
        ));
    }
}
