//! In-memory store backend.
//!
//! Implements all four store contracts over tokio `RwLock`-guarded maps.
//! Used in lite mode (no `HERALD_DATABASE__URL`) and throughout the test
//! suite. Every method takes the lock for the whole operation, so the
//! guarded transitions and the queue claim are atomic exactly like their
//! SQL counterparts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use herald_common::error::HeraldResult;
use herald_common::models::{
    DeliveryTask, Identity, Message, MessageStatus, Node, NodeStatus, TaskStatus,
};

use crate::{DeliveryTaskStore, IdentityStore, MessageStore, NodeStore};

#[derive(Default)]
struct Inner {
    identities: HashMap<Uuid, Identity>,
    /// (local_part, domain) -> identity id
    handle_index: HashMap<(String, String), Uuid>,
    messages: HashMap<Uuid, Message>,
    nodes: HashMap<String, Node>,
    tasks: HashMap<Uuid, DeliveryTask>,
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── IdentityStore ───────────────────────────────────────────────────────────

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> HeraldResult<Option<Identity>> {
        Ok(self.inner.read().await.identities.get(&id).cloned())
    }

    async fn find_by_handle(
        &self,
        local_part: &str,
        domain: &str,
    ) -> HeraldResult<Option<Identity>> {
        let inner = self.inner.read().await;
        let id = inner.handle_index.get(&(local_part.to_owned(), domain.to_owned()));
        Ok(id.and_then(|id| inner.identities.get(id)).cloned())
    }

    async fn insert(&self, identity: &Identity) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        let key = (identity.local_part.clone(), identity.domain.clone());
        // Handle uniqueness: a concurrent insert of the same handle keeps
        // the first entry.
        if inner.handle_index.contains_key(&key) {
            return Ok(());
        }
        inner.handle_index.insert(key, identity.id);
        inner.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn refresh_federated(
        &self,
        id: Uuid,
        public_key: &str,
        fingerprint: &str,
        refreshed_at: DateTime<Utc>,
    ) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(identity) = inner.identities.get_mut(&id) {
            identity.public_key = public_key.to_owned();
            identity.public_key_fingerprint = fingerprint.to_owned();
            identity.refreshed_at = Some(refreshed_at);
        }
        Ok(())
    }

    async fn count_local(&self) -> HeraldResult<i64> {
        Ok(self.inner.read().await.identities.values().filter(|i| i.is_local).count() as i64)
    }
}

// ─── MessageStore ────────────────────────────────────────────────────────────

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_with_task(
        &self,
        message: &Message,
        task: Option<&DeliveryTask>,
    ) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if inner.messages.contains_key(&message.id) {
            // Idempotent: a redelivered message changes nothing.
            return Ok(());
        }
        inner.messages.insert(message.id, message.clone());
        if let Some(task) = task {
            inner.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> HeraldResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(&id).cloned())
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> HeraldResult<Option<Message>> {
        let mut inner = self.inner.write().await;
        match inner.messages.get_mut(&id) {
            Some(m) if m.status == MessageStatus::Pending => {
                m.status = MessageStatus::Delivered;
                m.delivered_at = Some(at);
                Ok(Some(m.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> HeraldResult<Option<Message>> {
        let mut inner = self.inner.write().await;
        match inner.messages.get_mut(&id) {
            Some(m) if m.status == MessageStatus::Delivered => {
                m.status = MessageStatus::Read;
                m.read_at = Some(at);
                Ok(Some(m.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_failed(&self, id: Uuid) -> HeraldResult<Option<Message>> {
        let mut inner = self.inner.write().await;
        match inner.messages.get_mut(&id) {
            Some(m) if m.status == MessageStatus::Pending => {
                m.status = MessageStatus::Failed;
                Ok(Some(m.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn conversation_page(
        &self,
        a: Uuid,
        b: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> HeraldResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut page: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| {
                let between = (m.sender_id == Some(a) && m.target.recipient_id() == Some(b))
                    || (m.sender_id == Some(b) && m.target.recipient_id() == Some(a));
                let older = before.is_none_or(|cutoff| m.created_at < cutoff);
                between && older
            })
            .cloned()
            .collect();
        page.sort_by(|x, y| y.created_at.cmp(&x.created_at));
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }
}

// ─── NodeStore ───────────────────────────────────────────────────────────────

#[async_trait]
impl NodeStore for MemoryStore {
    async fn find_by_domain(&self, domain: &str) -> HeraldResult<Option<Node>> {
        Ok(self.inner.read().await.nodes.get(domain).cloned())
    }

    async fn insert(&self, node: &Node) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        inner.nodes.entry(node.domain.clone()).or_insert_with(|| node.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        domain: &str,
        status: NodeStatus,
        at: DateTime<Utc>,
    ) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(domain) {
            node.status = status;
            node.updated_at = at;
        }
        Ok(())
    }

    async fn record_success(
        &self,
        domain: &str,
        latency_ms: Option<i64>,
        at: DateTime<Utc>,
    ) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(domain) {
            // An administrative block outranks any delivery outcome.
            if node.status != NodeStatus::Blocked {
                node.status = NodeStatus::Active;
            }
            node.last_seen = Some(at);
            if latency_ms.is_some() {
                node.avg_latency_ms = latency_ms;
            }
            node.updated_at = at;
        }
        Ok(())
    }

    async fn count_active(&self) -> HeraldResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner.nodes.values().filter(|n| n.status == NodeStatus::Active).count() as i64)
    }
}

// ─── DeliveryTaskStore ───────────────────────────────────────────────────────

#[async_trait]
impl DeliveryTaskStore for MemoryStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> HeraldResult<Option<DeliveryTask>> {
        let mut inner = self.inner.write().await;
        let due = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.next_attempt_at <= now)
            .min_by_key(|t| t.next_attempt_at)
            .map(|t| t.id);

        let Some(id) = due else { return Ok(None) };
        let task = inner.tasks.get_mut(&id).map(|t| {
            let snapshot = t.clone();
            // The lease is the claim: no other worker sees this task as due
            // until it expires or the outcome is recorded.
            t.next_attempt_at = now + lease;
            snapshot
        });
        Ok(task)
    }

    async fn mark_sent(&self, id: Uuid) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(t) = inner.tasks.get_mut(&id) {
            t.status = TaskStatus::Sent;
            t.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(t) = inner.tasks.get_mut(&id) {
            t.status = TaskStatus::Failed;
            t.attempts = (t.attempts + 1).min(t.max_attempts);
            t.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> HeraldResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(t) = inner.tasks.get_mut(&id) {
            t.attempts = attempts;
            t.next_attempt_at = next_attempt_at;
            if let Some(error) = error {
                t.last_error = Some(error.to_owned());
            }
        }
        Ok(())
    }

    async fn pending_for_message(&self, message_id: Uuid) -> HeraldResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.message_id == message_id && t.status == TaskStatus::Pending)
            .count() as i64)
    }

    async fn find_by_message(&self, message_id: Uuid) -> HeraldResult<Vec<DeliveryTask>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<DeliveryTask> =
            inner.tasks.values().filter(|t| t.message_id == message_id).cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::models::Target;

    fn message(sender: Uuid, recipient: Uuid, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: Some(sender),
            target: Target::Direct(recipient),
            ciphertext: "ct".into(),
            size_bytes: 2,
            content_type: "text".into(),
            sender_handle: "a@x".into(),
            recipient_handle: Some("b@x".into()),
            origin_node: "x".into(),
            status: MessageStatus::Pending,
            created_at: at,
            delivered_at: None,
            read_at: None,
        }
    }

    #[tokio::test]
    async fn guarded_transitions() {
        let store = MemoryStore::new();
        let m = message(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        store.insert_with_task(&m, None).await.unwrap();

        // pending -> read is not a legal edge.
        assert!(store.mark_read(m.id, Utc::now()).await.unwrap().is_none());

        let delivered = store.mark_delivered(m.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);

        // delivered -> delivered does not fire twice.
        assert!(store.mark_delivered(m.id, Utc::now()).await.unwrap().is_none());

        let read = store.mark_read(m.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(read.status, MessageStatus::Read);

        // Nothing leaves read.
        assert!(MessageStore::mark_failed(&store, m.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let task = DeliveryTask::new(Uuid::new_v4(), "node-b.test", 5, now);
        let m = message(Uuid::new_v4(), Uuid::new_v4(), now);
        store.insert_with_task(&m, Some(&task)).await.unwrap();

        let lease = chrono::Duration::seconds(60);
        let claimed = store.claim_due(now, lease).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        // Second claim within the lease window sees nothing due.
        assert!(store.claim_due(now, lease).await.unwrap().is_none());

        // After the lease expires the task is claimable again.
        let later = now + chrono::Duration::seconds(61);
        assert!(store.claim_due(later, lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_picks_earliest_due() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut early = DeliveryTask::new(Uuid::new_v4(), "node-b.test", 5, now);
        early.next_attempt_at = now - chrono::Duration::seconds(30);
        let late = DeliveryTask::new(Uuid::new_v4(), "node-c.test", 5, now);

        let m1 = message(Uuid::new_v4(), Uuid::new_v4(), now);
        let m2 = message(Uuid::new_v4(), Uuid::new_v4(), now);
        store.insert_with_task(&m1, Some(&early)).await.unwrap();
        store.insert_with_task(&m2, Some(&late)).await.unwrap();

        let claimed = store.claim_due(now, chrono::Duration::seconds(60)).await.unwrap().unwrap();
        assert_eq!(claimed.id, early.id);
    }

    #[tokio::test]
    async fn duplicate_message_insert_is_ignored() {
        let store = MemoryStore::new();
        let m = message(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        store.insert_with_task(&m, None).await.unwrap();

        let mut dup = m.clone();
        dup.ciphertext = "tampered".into();
        store.insert_with_task(&dup, None).await.unwrap();

        let stored = MessageStore::find_by_id(&store, m.id).await.unwrap().unwrap();
        assert_eq!(stored.ciphertext, "ct");
    }
}
