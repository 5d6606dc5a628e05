//! # herald-db
//!
//! The Durable Record Store and Identity Store behind Herald's core. The
//! store is the single source of truth: every state transition is committed
//! here before it is considered authoritative.
//!
//! Consumers depend on the trait contracts, not on a backend:
//! - **PostgreSQL** ([`postgres`]) — production, runtime-checked sqlx queries.
//! - **In-memory** ([`memory`]) — lite mode and the test suite.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::config::DatabaseConfig;
use herald_common::error::HeraldResult;
use herald_common::models::{DeliveryTask, Identity, Message, Node, NodeStatus};

// ─── Identity Store ──────────────────────────────────────────────────────────

/// Lookup and cache maintenance for identities.
///
/// Local identity *creation* belongs to the account subsystem; this node's
/// core only creates federated cache entries.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> HeraldResult<Option<Identity>>;

    /// Lookup by the unique (local_part, domain) pair, local or federated.
    async fn find_by_handle(
        &self,
        local_part: &str,
        domain: &str,
    ) -> HeraldResult<Option<Identity>>;

    async fn insert(&self, identity: &Identity) -> HeraldResult<()>;

    /// Overwrite a federated entry's key material after re-discovery.
    async fn refresh_federated(
        &self,
        id: Uuid,
        public_key: &str,
        fingerprint: &str,
        refreshed_at: DateTime<Utc>,
    ) -> HeraldResult<()>;

    /// Number of local accounts, for node statistics.
    async fn count_local(&self) -> HeraldResult<i64>;
}

// ─── Message Store ───────────────────────────────────────────────────────────

/// Message records and their guarded state transitions.
///
/// The `mark_*` methods apply the transition only from the expected prior
/// state and return the updated record, or `None` when the guard did not
/// match; callers translate `None` into their own semantics (idempotent
/// success, conflict, and so on).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message and, when targeting a remote node, its delivery task
    /// in one logical operation: both committed or both absent. A message id
    /// that already exists is left untouched (idempotent inbound delivery).
    async fn insert_with_task(
        &self,
        message: &Message,
        task: Option<&DeliveryTask>,
    ) -> HeraldResult<()>;

    async fn find_by_id(&self, id: Uuid) -> HeraldResult<Option<Message>>;

    /// `pending -> delivered`.
    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>)
        -> HeraldResult<Option<Message>>;

    /// `delivered -> read`.
    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> HeraldResult<Option<Message>>;

    /// `pending -> failed`.
    async fn mark_failed(&self, id: Uuid) -> HeraldResult<Option<Message>>;

    /// Direct messages between two identities (either direction), newest
    /// first, strictly older than `before` when given.
    async fn conversation_page(
        &self,
        a: Uuid,
        b: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> HeraldResult<Vec<Message>>;
}

// ─── Node Store ──────────────────────────────────────────────────────────────

/// Remote-node records, keyed by domain.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn find_by_domain(&self, domain: &str) -> HeraldResult<Option<Node>>;

    async fn insert(&self, node: &Node) -> HeraldResult<()>;

    async fn set_status(
        &self,
        domain: &str,
        status: NodeStatus,
        at: DateTime<Utc>,
    ) -> HeraldResult<()>;

    /// Record a successful delivery: status active, last-seen and latency
    /// updated (latency is last-write-wins).
    async fn record_success(
        &self,
        domain: &str,
        latency_ms: Option<i64>,
        at: DateTime<Utc>,
    ) -> HeraldResult<()>;

    /// Number of nodes currently `active`, for node statistics.
    async fn count_active(&self) -> HeraldResult<i64>;
}

// ─── Delivery Task Store ─────────────────────────────────────────────────────

/// The durable work queue of outbound deliveries.
#[async_trait]
pub trait DeliveryTaskStore: Send + Sync {
    /// Atomically claim the due task with the smallest `next_attempt_at`:
    /// the claim pushes `next_attempt_at` forward by `lease` in the same
    /// operation, so two workers can never hold the same task. Returns the
    /// task as it was at claim time.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> HeraldResult<Option<DeliveryTask>>;

    async fn mark_sent(&self, id: Uuid) -> HeraldResult<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> HeraldResult<()>;

    /// Put a task back in the queue for a later attempt. `attempts` is the
    /// caller's updated count (unchanged when parking a task for a blocked
    /// node).
    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> HeraldResult<()>;

    /// Tasks still `pending` for a message. Zero means no outstanding task
    /// could still succeed.
    async fn pending_for_message(&self, message_id: Uuid) -> HeraldResult<i64>;

    async fn find_by_message(&self, message_id: Uuid) -> HeraldResult<Vec<DeliveryTask>>;
}

// ─── Database facade ─────────────────────────────────────────────────────────

/// Shared handle to all four stores, passed through application state.
#[derive(Clone)]
pub struct Database {
    pub identities: Arc<dyn IdentityStore>,
    pub messages: Arc<dyn MessageStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub tasks: Arc<dyn DeliveryTaskStore>,
}

impl Database {
    /// Connect to PostgreSQL and run migrations.
    pub async fn connect_postgres(url: &str, config: &DatabaseConfig) -> anyhow::Result<Self> {
        tracing::info!("Connecting to PostgreSQL...");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Connected to PostgreSQL");

        let store = Arc::new(postgres::PgStore::new(pool));
        Ok(Self {
            identities: store.clone(),
            messages: store.clone(),
            nodes: store.clone(),
            tasks: store,
        })
    }

    /// In-process store with no external dependencies. State dies with the
    /// process; suitable for lite mode and tests.
    pub fn in_memory() -> Self {
        let store = Arc::new(memory::MemoryStore::new());
        Self {
            identities: store.clone(),
            messages: store.clone(),
            nodes: store.clone(),
            tasks: store,
        }
    }
}
