//! Data models shared across Herald crates.

pub mod delivery;
pub mod identity;
pub mod message;
pub mod node;

pub use delivery::{DeliveryTask, TaskStatus};
pub use identity::Identity;
pub use message::{Message, MessageStatus, Target};
pub use node::{Node, NodeStatus};
