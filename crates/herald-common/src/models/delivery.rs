//! Delivery task model — one outstanding obligation to deliver one message
//! to one remote node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Awaiting an attempt (or a retry after backoff).
    Pending,
    /// Remote node acknowledged the hand-off.
    Sent,
    /// Attempt ceiling exhausted. Terminal.
    Failed,
}

/// A queued outbound delivery.
///
/// Exactly one task exists per (message, target node) pair while delivery is
/// outstanding. `attempts` never exceeds `max_attempts`; at the ceiling the
/// task is terminally failed and never retried automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub message_id: Uuid,
    /// Domain of the node this delivery targets.
    pub target_node: String,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// The task is not claimable before this instant. Doubles as the claim
    /// lease: claiming pushes it forward so no second worker picks it up.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryTask {
    /// Build a fresh task for a message headed to `target_node`.
    pub fn new(message_id: Uuid, target_node: &str, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            target_node: target_node.to_owned(),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts as i32,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        }
    }

    /// Whether the next failure would exhaust the ceiling.
    pub fn on_final_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }
}
