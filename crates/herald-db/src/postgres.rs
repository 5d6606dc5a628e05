//! PostgreSQL store backend.
//!
//! Runtime-checked sqlx queries; cursor pagination keys on `created_at`;
//! the queue claim uses `FOR UPDATE SKIP LOCKED` so concurrent workers
//! never hold the same task. Row structs are flat and mapped manually since
//! the models carry nested types (the message target variant).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::{HeraldError, HeraldResult};
use herald_common::models::{
    DeliveryTask, Identity, Message, MessageStatus, Node, NodeStatus, Target, TaskStatus,
};

use crate::{DeliveryTaskStore, IdentityStore, MessageStore, NodeStore};

/// All four store contracts over one connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct IdentityRow {
    id: Uuid,
    local_part: String,
    domain: String,
    public_key: String,
    public_key_fingerprint: String,
    is_local: bool,
    avatar_url: Option<String>,
    status_message: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    refreshed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<IdentityRow> for Identity {
    fn from(r: IdentityRow) -> Self {
        Self {
            id: r.id,
            local_part: r.local_part,
            domain: r.domain,
            public_key: r.public_key,
            public_key_fingerprint: r.public_key_fingerprint,
            is_local: r.is_local,
            avatar_url: r.avatar_url,
            status_message: r.status_message,
            last_seen: r.last_seen,
            refreshed_at: r.refreshed_at,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    sender_id: Option<Uuid>,
    recipient_id: Option<Uuid>,
    group_id: Option<Uuid>,
    ciphertext: String,
    size_bytes: i64,
    content_type: String,
    sender_handle: String,
    recipient_handle: Option<String>,
    origin_node: String,
    status: MessageStatus,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = HeraldError;

    fn try_from(r: MessageRow) -> Result<Self, Self::Error> {
        // The schema's XOR check constraint guarantees exactly one of the
        // two columns; a violation here means external tampering.
        let target = match (r.recipient_id, r.group_id) {
            (Some(id), None) => Target::Direct(id),
            (None, Some(id)) => Target::Group(id),
            _ => {
                return Err(HeraldError::Internal(anyhow::anyhow!(
                    "message {} has an invalid recipient/group combination",
                    r.id
                )));
            }
        };
        Ok(Self {
            id: r.id,
            sender_id: r.sender_id,
            target,
            ciphertext: r.ciphertext,
            size_bytes: r.size_bytes,
            content_type: r.content_type,
            sender_handle: r.sender_handle,
            recipient_handle: r.recipient_handle,
            origin_node: r.origin_node,
            status: r.status,
            created_at: r.created_at,
            delivered_at: r.delivered_at,
            read_at: r.read_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    domain: String,
    federation_url: String,
    server_version: Option<String>,
    public_key: Option<String>,
    status: NodeStatus,
    last_seen: Option<DateTime<Utc>>,
    avg_latency_ms: Option<i64>,
    user_count: i64,
    auto_discovered: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<NodeRow> for Node {
    fn from(r: NodeRow) -> Self {
        Self {
            domain: r.domain,
            federation_url: r.federation_url,
            server_version: r.server_version,
            public_key: r.public_key,
            status: r.status,
            last_seen: r.last_seen,
            avg_latency_ms: r.avg_latency_ms,
            user_count: r.user_count,
            auto_discovered: r.auto_discovered,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    message_id: Uuid,
    target_node: String,
    status: TaskStatus,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<TaskRow> for DeliveryTask {
    fn from(r: TaskRow) -> Self {
        Self {
            id: r.id,
            message_id: r.message_id,
            target_node: r.target_node,
            status: r.status,
            attempts: r.attempts,
            max_attempts: r.max_attempts,
            next_attempt_at: r.next_attempt_at,
            last_error: r.last_error,
            created_at: r.created_at,
        }
    }
}

// ─── IdentityStore ───────────────────────────────────────────────────────────

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_by_id(&self, id: Uuid) -> HeraldResult<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>("SELECT * FROM identities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_handle(
        &self,
        local_part: &str,
        domain: &str,
    ) -> HeraldResult<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM identities WHERE local_part = $1 AND domain = $2",
        )
        .bind(local_part)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert(&self, identity: &Identity) -> HeraldResult<()> {
        sqlx::query(
            r#"
            INSERT INTO identities (
                id, local_part, domain, public_key, public_key_fingerprint,
                is_local, avatar_url, status_message, last_seen, refreshed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (local_part, domain) DO NOTHING
            "#,
        )
        .bind(identity.id)
        .bind(&identity.local_part)
        .bind(&identity.domain)
        .bind(&identity.public_key)
        .bind(&identity.public_key_fingerprint)
        .bind(identity.is_local)
        .bind(&identity.avatar_url)
        .bind(&identity.status_message)
        .bind(identity.last_seen)
        .bind(identity.refreshed_at)
        .bind(identity.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_federated(
        &self,
        id: Uuid,
        public_key: &str,
        fingerprint: &str,
        refreshed_at: DateTime<Utc>,
    ) -> HeraldResult<()> {
        sqlx::query(
            r#"
            UPDATE identities SET
                public_key = $2,
                public_key_fingerprint = $3,
                refreshed_at = $4
            WHERE id = $1 AND is_local = false
            "#,
        )
        .bind(id)
        .bind(public_key)
        .bind(fingerprint)
        .bind(refreshed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_local(&self) -> HeraldResult<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM identities WHERE is_local = true")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

// ─── MessageStore ────────────────────────────────────────────────────────────

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_with_task(
        &self,
        message: &Message,
        task: Option<&DeliveryTask>,
    ) -> HeraldResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (
                id, sender_id, recipient_id, group_id, ciphertext, size_bytes,
                content_type, sender_handle, recipient_handle, origin_node,
                status, created_at, delivered_at, read_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.sender_id)
        .bind(message.target.recipient_id())
        .bind(message.target.group_id())
        .bind(&message.ciphertext)
        .bind(message.size_bytes)
        .bind(&message.content_type)
        .bind(&message.sender_handle)
        .bind(&message.recipient_handle)
        .bind(&message.origin_node)
        .bind(message.status)
        .bind(message.created_at)
        .bind(message.delivered_at)
        .bind(message.read_at)
        .execute(&mut *tx)
        .await?;

        // Redelivered message: keep the original record and do not requeue.
        if inserted.rows_affected() > 0 {
            if let Some(task) = task {
                sqlx::query(
                    r#"
                    INSERT INTO delivery_tasks (
                        id, message_id, target_node, status, attempts,
                        max_attempts, next_attempt_at, last_error, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(task.id)
                .bind(task.message_id)
                .bind(&task.target_node)
                .bind(task.status)
                .bind(task.attempts)
                .bind(task.max_attempts)
                .bind(task.next_attempt_at)
                .bind(&task.last_error)
                .bind(task.created_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> HeraldResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> HeraldResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET status = 'delivered', delivered_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> HeraldResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET status = 'read', read_at = $2
            WHERE id = $1 AND status = 'delivered'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn mark_failed(&self, id: Uuid) -> HeraldResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET status = 'failed'
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn conversation_page(
        &self,
        a: Uuid,
        b: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> HeraldResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE ((sender_id = $1 AND recipient_id = $2)
                OR (sender_id = $2 AND recipient_id = $1))
              AND ($3::timestamptz IS NULL OR created_at < $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

// ─── NodeStore ───────────────────────────────────────────────────────────────

#[async_trait]
impl NodeStore for PgStore {
    async fn find_by_domain(&self, domain: &str) -> HeraldResult<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn insert(&self, node: &Node) -> HeraldResult<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                domain, federation_url, server_version, public_key, status,
                last_seen, avg_latency_ms, user_count, auto_discovered,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (domain) DO NOTHING
            "#,
        )
        .bind(&node.domain)
        .bind(&node.federation_url)
        .bind(&node.server_version)
        .bind(&node.public_key)
        .bind(node.status)
        .bind(node.last_seen)
        .bind(node.avg_latency_ms)
        .bind(node.user_count)
        .bind(node.auto_discovered)
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        domain: &str,
        status: NodeStatus,
        at: DateTime<Utc>,
    ) -> HeraldResult<()> {
        sqlx::query("UPDATE nodes SET status = $2, updated_at = $3 WHERE domain = $1")
            .bind(domain)
            .bind(status)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_success(
        &self,
        domain: &str,
        latency_ms: Option<i64>,
        at: DateTime<Utc>,
    ) -> HeraldResult<()> {
        sqlx::query(
            r#"
            UPDATE nodes SET
                status = CASE WHEN status = 'blocked' THEN status ELSE 'active' END,
                last_seen = $3,
                avg_latency_ms = COALESCE($2, avg_latency_ms),
                updated_at = $3
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .bind(latency_ms)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_active(&self) -> HeraldResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

// ─── DeliveryTaskStore ───────────────────────────────────────────────────────

#[async_trait]
impl DeliveryTaskStore for PgStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> HeraldResult<Option<DeliveryTask>> {
        // SKIP LOCKED keeps concurrent workers off each other's claims; the
        // lease push makes the claim survive the transaction so a crashed
        // worker's task resurfaces once the lease runs out.
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE delivery_tasks SET next_attempt_at = $2
            WHERE id = (
                SELECT id FROM delivery_tasks
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|mut r| {
            // Hand back the pre-lease schedule; the lease is bookkeeping.
            r.next_attempt_at = now;
            r.into()
        }))
    }

    async fn mark_sent(&self, id: Uuid) -> HeraldResult<()> {
        sqlx::query("UPDATE delivery_tasks SET status = 'sent', last_error = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> HeraldResult<()> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks SET
                status = 'failed',
                attempts = LEAST(attempts + 1, max_attempts),
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> HeraldResult<()> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks SET
                attempts = $2,
                next_attempt_at = $3,
                last_error = COALESCE($4, last_error)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_for_message(&self, message_id: Uuid) -> HeraldResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM delivery_tasks WHERE message_id = $1 AND status = 'pending'",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn find_by_message(&self, message_id: Uuid) -> HeraldResult<Vec<DeliveryTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM delivery_tasks WHERE message_id = $1 ORDER BY created_at",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
