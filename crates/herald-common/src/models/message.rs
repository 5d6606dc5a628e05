//! Message model and its lifecycle states.
//!
//! The server never sees plaintext: `ciphertext` is encrypted by the sending
//! client and treated as an opaque byte sequence end to end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Delivery lifecycle state of a message.
///
/// ```text
/// pending ──► delivered ──► read
///    │
///    └──────► failed
/// ```
///
/// `read` and `failed` are terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created; delivery not yet confirmed.
    Pending,
    /// Handed to the recipient (locally, or acknowledged by the remote node).
    Delivered,
    /// Acknowledged by the recipient.
    Read,
    /// All delivery attempts exhausted, or the recipient was unresolvable.
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }
}

/// Where a message is going: exactly one direct recipient or one group.
///
/// The original schema expressed this as two nullable foreign keys with an
/// XOR check constraint; the enum makes the exclusivity unrepresentable
/// instead of merely checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Direct(Uuid),
    Group(Uuid),
}

impl Target {
    pub fn recipient_id(&self) -> Option<Uuid> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<Uuid> {
        match self {
            Self::Direct(_) => None,
            Self::Group(id) => Some(*id),
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,

    /// `None` once the sending account has been deleted.
    pub sender_id: Option<Uuid>,

    pub target: Target,

    /// Client-encrypted payload. Opaque.
    pub ciphertext: String,

    pub size_bytes: i64,

    /// Declared content type: text, image, file.
    pub content_type: String,

    /// Handle snapshots captured at send time for audit purposes. These may
    /// diverge from the live identity records; routing never uses them.
    pub sender_handle: String,
    pub recipient_handle: Option<String>,

    /// Domain of the node the message originated on.
    pub origin_node: String,

    pub status: MessageStatus,

    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

// ─── Request / response DTOs ─────────────────────────────────────────────────

/// Send-message request body.
///
/// Exactly one of `recipient_handle` / `group_id` must be set; the lifecycle
/// manager rejects anything else with `InvalidTarget` before creating records.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SendMessageRequest {
    pub recipient_handle: Option<String>,
    pub group_id: Option<Uuid>,

    /// Client-encrypted payload.
    #[validate(length(min = 1, message = "Message body must not be empty"))]
    pub ciphertext: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text".to_owned()
}

/// Message representation for API responses.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub sender_handle: String,
    pub recipient_handle: Option<String>,
    pub group_id: Option<Uuid>,
    pub ciphertext: String,
    pub content_type: String,
    pub status: MessageStatus,
    pub origin_node: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            sender_handle: m.sender_handle,
            recipient_handle: m.recipient_handle,
            group_id: m.target.group_id(),
            ciphertext: m.ciphertext,
            content_type: m.content_type,
            status: m.status,
            origin_node: m.origin_node,
            created_at: m.created_at,
            delivered_at: m.delivered_at,
            read_at: m.read_at,
        }
    }
}

/// One page of a conversation, newest first.
#[derive(Debug, Serialize)]
pub struct ConversationPage {
    pub messages: Vec<MessageResponse>,
    pub has_more: bool,
    /// Oldest timestamp in this page when more results exist; pass back as
    /// the next request's `before` bound.
    pub next_cursor: Option<DateTime<Utc>>,
}
