//! Delivery worker — drains the federated delivery queue.
//!
//! Each worker loop claims the earliest due task (the claim is atomic across
//! workers), attempts the hand-off via the outbound transport, and feeds the
//! outcome back into the message lifecycle and the node registry.
//!
//! Failure accounting is deliberate: only a confirmed transport failure
//! consumes a retry attempt. The worker's own infrastructure faults (store
//! unavailable) leave the task untouched for a later claim, and a blocked
//! target node parks the task without spending its budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use herald_common::config::FederationConfig;
use herald_common::error::HeraldResult;
use herald_common::models::{DeliveryTask, MessageStatus};
use herald_db::{DeliveryTaskStore, IdentityStore, MessageStore};
use herald_federation::registry::NodeRegistry;
use herald_federation::types::DeliveryEnvelope;
use herald_federation::{FederationError, OutboundTransport};

use crate::lifecycle::MessageLifecycle;
use crate::queue::backoff_delay;

/// Background processor for outbound federated deliveries.
pub struct DeliveryWorker {
    tasks: Arc<dyn DeliveryTaskStore>,
    messages: Arc<dyn MessageStore>,
    identities: Arc<dyn IdentityStore>,
    lifecycle: Arc<MessageLifecycle>,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn OutboundTransport>,
    cfg: FederationConfig,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn DeliveryTaskStore>,
        messages: Arc<dyn MessageStore>,
        identities: Arc<dyn IdentityStore>,
        lifecycle: Arc<MessageLifecycle>,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn OutboundTransport>,
        cfg: FederationConfig,
    ) -> Self {
        Self { tasks, messages, identities, lifecycle, registry, transport, cfg }
    }

    /// Run until `shutdown` flips. Sleeps the poll interval whenever the
    /// queue has nothing due.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Delivery worker started");
        let poll = Duration::from_secs(self.cfg.worker_poll_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                worked = self.step() => {
                    if !worked {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(poll) => {}
                        }
                    }
                }
            }
        }
        info!("Delivery worker stopped");
    }

    /// One iteration, swallowing infrastructure errors so the loop survives
    /// a flaky store. Returns whether a task was processed.
    async fn step(&self) -> bool {
        match self.tick().await {
            Ok(worked) => worked,
            Err(e) => {
                // Infrastructure fault: the claim lease will resurface
                // whatever we were holding; no task gets failed over this.
                warn!("Delivery worker iteration failed: {e}");
                false
            }
        }
    }

    /// Claim and process a single due task. Exposed for the test suite.
    pub async fn tick(&self) -> HeraldResult<bool> {
        let now = Utc::now();
        let Some(task) = self.tasks.claim_due(now, self.cfg.claim_lease()).await? else {
            return Ok(false);
        };
        self.process(task).await?;
        Ok(true)
    }

    async fn process(&self, task: DeliveryTask) -> HeraldResult<()> {
        let domain = task.target_node.clone();

        let Some(message) = self.messages.find_by_id(task.message_id).await? else {
            warn!("Task {} references a missing message; failing it", task.id);
            self.tasks.mark_failed(task.id, "message record missing").await?;
            return Ok(());
        };
        if message.status != MessageStatus::Pending {
            debug!(
                "Task {} for message {} in state {:?}; nothing to deliver",
                task.id, message.id, message.status
            );
            self.tasks.mark_sent(task.id).await?;
            return Ok(());
        }

        let node = self.registry.get_or_discover(&domain).await?;

        // An administrative block halts attempts immediately but does not
        // consume the retry budget: the task parks until the block lifts or
        // an operator disposes of it.
        if node.is_blocked() {
            debug!("Node {} is blocked; parking task {}", domain, task.id);
            let recheck = Utc::now() + chrono::Duration::seconds(self.cfg.backoff_cap_secs as i64);
            self.tasks
                .reschedule(task.id, task.attempts, recheck, Some("target node is blocked"))
                .await?;
            return Ok(());
        }

        let Some(recipient_handle) = message.recipient_handle.clone() else {
            warn!("Task {} carries a message without a recipient handle", task.id);
            self.tasks.mark_failed(task.id, "message has no recipient handle").await?;
            self.lifecycle.mark_failed(message.id).await?;
            return Ok(());
        };

        let sender_public_key = match message.sender_id {
            Some(sender_id) => self
                .identities
                .find_by_id(sender_id)
                .await?
                .map(|i| i.public_key)
                .unwrap_or_default(),
            None => String::new(),
        };

        let envelope = DeliveryEnvelope {
            message_id: message.id,
            sender_handle: message.sender_handle.clone(),
            recipient_handle,
            sender_public_key,
            ciphertext: message.ciphertext.clone(),
            content_type: message.content_type.clone(),
            origin_node: message.origin_node.clone(),
            sent_at: message.created_at,
        };

        match self.transport.deliver(&node, &envelope).await {
            Ok(outcome) => {
                debug!(
                    "Delivered message {} to {} in {}ms",
                    message.id, domain, outcome.latency_ms
                );
                self.tasks.mark_sent(task.id).await?;
                self.lifecycle.mark_delivered(message.id).await?;
                self.registry
                    .record_delivery_outcome(&domain, true, Some(outcome.latency_ms))
                    .await?;
            }
            Err(e) => {
                self.handle_transport_failure(&task, e).await?;
                self.registry.record_delivery_outcome(&domain, false, None).await?;
            }
        }
        Ok(())
    }

    async fn handle_transport_failure(
        &self,
        task: &DeliveryTask,
        error: FederationError,
    ) -> HeraldResult<()> {
        let failures = task.attempts + 1;
        let reason = error.to_string();

        if task.on_final_attempt() {
            warn!(
                "Task {} exhausted {} attempts against {}: {}",
                task.id, task.max_attempts, task.target_node, reason
            );
            self.tasks.mark_failed(task.id, &reason).await?;
            self.lifecycle.mark_failed(task.message_id).await?;
        } else {
            let delay = backoff_delay(failures as u32, &self.cfg);
            let next = Utc::now() + delay;
            debug!(
                "Task {} attempt {}/{} against {} failed ({}); retrying in {}s",
                task.id,
                failures,
                task.max_attempts,
                task.target_node,
                reason,
                delay.num_seconds()
            );
            self.tasks.reschedule(task.id, failures, next, Some(&reason)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_common::config::LimitsConfig;
    use herald_common::error::HeraldError;
    use herald_common::fingerprint::fingerprint;
    use herald_common::handle::Handle;
    use herald_common::models::message::SendMessageRequest;
    use herald_common::models::{Identity, Node, TaskStatus};
    use herald_db::Database;
    use herald_federation::transport::DeliveryOutcome;
    use herald_federation::types::{NodeDiscoveryDocument, NodeStatistics, RemoteIdentity};
    use herald_federation::RemoteDiscovery;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct MockDiscovery;

    #[async_trait]
    impl RemoteDiscovery for MockDiscovery {
        async fn discover(
            &self,
            domain: &str,
        ) -> Result<NodeDiscoveryDocument, FederationError> {
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
            _node: &Node,
            handle: &Handle,
        ) -> Result<RemoteIdentity, FederationError> {
            Ok(RemoteIdentity {
                handle: handle.to_string(),
                public_key: "remote-key".into(),
                public_key_fingerprint: fingerprint("remote-key"),
                avatar_url: None,
                status_message: None,
            })
        }
    }

    /// Transport that fails the first `failures_before_success` calls.
    struct FlakyTransport {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    impl FlakyTransport {
        fn failing(n: usize) -> Self {
            Self { failures_before_success: n, calls: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OutboundTransport for FlakyTransport {
        async fn deliver(
            &self,
            node: &Node,
            _envelope: &DeliveryEnvelope,
        ) -> Result<DeliveryOutcome, FederationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(FederationError::Unreachable(node.domain.clone(), "connect refused".into()))
            } else {
                Ok(DeliveryOutcome { latency_ms: 42 })
            }
        }
    }

    struct Harness {
        db: Database,
        lifecycle: Arc<MessageLifecycle>,
        registry: Arc<NodeRegistry>,
        transport: Arc<FlakyTransport>,
        worker: DeliveryWorker,
        alice: Identity,
    }

    fn cfg() -> FederationConfig {
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

    async fn harness(transport: FlakyTransport) -> Harness {
        let db = Database::in_memory();
        let alice = Identity {
            id: Uuid::new_v4(),
            local_part: "alice".into(),
            domain: "node-a.test".into(),
            public_key: "alice-key".into(),
            public_key_fingerprint: fingerprint("alice-key"),
            is_local: true,
            avatar_url: None,
            status_message: None,
            last_seen: None,
            refreshed_at: None,
            created_at: Utc::now(),
        };
        db.identities.insert(&alice).await.unwrap();

        let discovery: Arc<dyn RemoteDiscovery> = Arc::new(MockDiscovery);
        let registry = Arc::new(NodeRegistry::new(db.nodes.clone(), discovery.clone(), 3));
        let resolver = Arc::new(crate::resolver::IdentityResolver::new(
            db.identities.clone(),
            registry.clone(),
            discovery,
            "node-a.test",
            chrono::Duration::hours(24),
        ));
        let lifecycle = Arc::new(MessageLifecycle::new(
            db.messages.clone(),
            db.tasks.clone(),
            db.identities.clone(),
            resolver,
            LimitsConfig { max_message_size_bytes: 1024, max_conversation_page: 100 },
            &cfg(),
        ));
        let transport = Arc::new(transport);
        let worker = DeliveryWorker::new(
            db.tasks.clone(),
            db.messages.clone(),
            db.identities.clone(),
            lifecycle.clone(),
            registry.clone(),
            transport.clone(),
            cfg(),
        );
        Harness { db, lifecycle, registry, transport, worker, alice }
    }

    async fn queue_message(h: &Harness) -> (Uuid, Uuid) {
        let message = h
            .lifecycle
            .send(
                &h.alice,
                &SendMessageRequest {
                    recipient_handle: Some("carol@node-b.test".into()),
                    group_id: None,
                    ciphertext: "ct".into(),
                    content_type: "text".into(),
                },
            )
            .await
            .unwrap();
        let task = h.db.tasks.find_by_message(message.id).await.unwrap().remove(0);
        (message.id, task.id)
    }

    /// Make a task due again without touching its attempt count.
    async fn make_due(h: &Harness, message_id: Uuid) {
        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        h.db
            .tasks
            .reschedule(
                task.id,
                task.attempts,
                Utc::now() - chrono::Duration::seconds(1),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_handoff_marks_everything() {
        let h = harness(FlakyTransport::failing(0)).await;
        let (message_id, task_id) = queue_message(&h).await;

        assert!(h.worker.tick().await.unwrap());

        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.id, task_id);
        assert_eq!(task.status, TaskStatus::Sent);

        let message = h.db.messages.find_by_id(message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert!(message.delivered_at.is_some());

        let node = h.registry.find("node-b.test").await.unwrap().unwrap();
        assert_eq!(node.avg_latency_ms, Some(42));
        assert!(node.last_seen.is_some());
    }

    #[tokio::test]
    async fn transport_failure_backs_off_and_retries() {
        let h = harness(FlakyTransport::failing(1)).await;
        let (message_id, _) = queue_message(&h).await;

        let before = Utc::now();
        assert!(h.worker.tick().await.unwrap());

        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.is_some());
        // Rescheduled at least one backoff floor out.
        assert!(task.next_attempt_at >= before + chrono::Duration::seconds(30));

        // Nothing is due until the backoff elapses.
        assert!(!h.worker.tick().await.unwrap());

        // Once due again, the retry succeeds.
        make_due(&h, message_id).await;
        assert!(h.worker.tick().await.unwrap());
        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(
            h.db.messages.find_by_id(message_id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn backoff_schedule_is_strictly_later_each_failure() {
        let h = harness(FlakyTransport::failing(100)).await;
        let (message_id, _) = queue_message(&h).await;

        let mut previous = Utc::now();
        for _ in 0..4 {
            make_due(&h, message_id).await;
            assert!(h.worker.tick().await.unwrap());
            let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
            if task.status != TaskStatus::Pending {
                break;
            }
            assert!(task.next_attempt_at > previous);
            previous = task.next_attempt_at;
        }
    }

    #[tokio::test]
    async fn exhaustion_fails_task_and_message() {
        let h = harness(FlakyTransport::failing(100)).await;
        let (message_id, _) = queue_message(&h).await;

        for _ in 0..5 {
            make_due(&h, message_id).await;
            assert!(h.worker.tick().await.unwrap());
        }

        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 5);
        assert!(task.attempts <= task.max_attempts);

        let message = h.db.messages.find_by_id(message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);

        // Terminal: even a due-looking failed task is never claimed again.
        make_due(&h, message_id).await;
        assert!(!h.worker.tick().await.unwrap());
        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 5);
        assert_eq!(h.transport.calls(), 5);
    }

    #[tokio::test]
    async fn node_goes_offline_after_failure_streak() {
        let h = harness(FlakyTransport::failing(100)).await;
        let (message_id, _) = queue_message(&h).await;

        for _ in 0..3 {
            make_due(&h, message_id).await;
            assert!(h.worker.tick().await.unwrap());
        }

        let node = h.registry.find("node-b.test").await.unwrap().unwrap();
        assert_eq!(node.status, herald_common::models::NodeStatus::Offline);

        // Offline is advisory: the queue keeps attempting.
        make_due(&h, message_id).await;
        assert!(h.worker.tick().await.unwrap());
        assert_eq!(h.transport.calls(), 4);
    }

    #[tokio::test]
    async fn blocked_node_parks_tasks_without_spending_attempts() {
        let h = harness(FlakyTransport::failing(0)).await;
        let (message_id, _) = queue_message(&h).await;
        h.registry.set_blocked("node-b.test").await.unwrap();

        assert!(h.worker.tick().await.unwrap());

        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0, "a parked task spends no attempt");
        assert!(task.next_attempt_at > Utc::now());
        assert_eq!(h.transport.calls(), 0, "no transport call toward a blocked node");

        // The message is untouched — blocked mail waits, it does not fail.
        assert_eq!(
            h.db.messages.find_by_id(message_id).await.unwrap().unwrap().status,
            MessageStatus::Pending
        );

        // Unblock, make due, and the delivery completes.
        h.registry.set_unblocked("node-b.test").await.unwrap();
        make_due(&h, message_id).await;
        assert!(h.worker.tick().await.unwrap());
        assert_eq!(
            h.db.messages.find_by_id(message_id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn run_loop_drains_and_stops_on_shutdown() {
        let h = harness(FlakyTransport::failing(0)).await;
        let (message_id, _) = queue_message(&h).await;

        let worker = Arc::new(DeliveryWorker::new(
            h.db.tasks.clone(),
            h.db.messages.clone(),
            h.db.identities.clone(),
            h.lifecycle.clone(),
            h.registry.clone(),
            h.transport.clone(),
            cfg(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        // Wait for the queued delivery to complete.
        for _ in 0..100 {
            let status = h.db.messages.find_by_id(message_id).await.unwrap().unwrap().status;
            if status == MessageStatus::Delivered {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.db.messages.find_by_id(message_id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Task store whose write-back operations fail, simulating a store
    /// outage mid-processing. Claims still work so the worker gets as far as
    /// recording the outcome.
    struct FaultyTaskStore {
        inner: Arc<dyn DeliveryTaskStore>,
    }

    #[async_trait]
    impl DeliveryTaskStore for FaultyTaskStore {
        async fn claim_due(
            &self,
            now: chrono::DateTime<Utc>,
            lease: chrono::Duration,
        ) -> HeraldResult<Option<DeliveryTask>> {
            self.inner.claim_due(now, lease).await
        }

        async fn mark_sent(&self, _id: Uuid) -> HeraldResult<()> {
            Err(HeraldError::Internal(anyhow::anyhow!("store unavailable")))
        }

        async fn mark_failed(&self, _id: Uuid, _error: &str) -> HeraldResult<()> {
            Err(HeraldError::Internal(anyhow::anyhow!("store unavailable")))
        }

        async fn reschedule(
            &self,
            _id: Uuid,
            _attempts: i32,
            _next_attempt_at: chrono::DateTime<Utc>,
            _error: Option<&str>,
        ) -> HeraldResult<()> {
            Err(HeraldError::Internal(anyhow::anyhow!("store unavailable")))
        }

        async fn pending_for_message(&self, message_id: Uuid) -> HeraldResult<i64> {
            self.inner.pending_for_message(message_id).await
        }

        async fn find_by_message(&self, message_id: Uuid) -> HeraldResult<Vec<DeliveryTask>> {
            self.inner.find_by_message(message_id).await
        }
    }

    #[tokio::test]
    async fn store_fault_does_not_consume_the_retry_budget() {
        let h = harness(FlakyTransport::failing(100)).await;
        let (message_id, _) = queue_message(&h).await;

        let faulty_worker = DeliveryWorker::new(
            Arc::new(FaultyTaskStore { inner: h.db.tasks.clone() }),
            h.db.messages.clone(),
            h.db.identities.clone(),
            h.lifecycle.clone(),
            h.registry.clone(),
            h.transport.clone(),
            cfg(),
        );

        // The transport failure cannot be recorded, so the iteration errors
        // out — and the task keeps its full budget rather than being failed
        // over the worker's own fault.
        assert!(faulty_worker.tick().await.is_err());
        let task = h.db.tasks.find_by_message(message_id).await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(
            h.db.messages.find_by_id(message_id).await.unwrap().unwrap().status,
            MessageStatus::Pending
        );
    }
}
