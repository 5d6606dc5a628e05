//! # herald-messaging
//!
//! The message-handling core of a Herald node:
//!
//! - **Identity resolver** (`resolver.rs`) — turns a `local-part@domain`
//!   handle into a routable identity, deciding local vs. federated routing
//!   and maintaining the federated identity cache.
//! - **Message lifecycle** (`lifecycle.rs`) — the per-message state machine
//!   (`pending -> delivered -> read`, `pending -> failed`), send semantics,
//!   read acknowledgement, and conversation pagination.
//! - **Queue scheduling** (`queue.rs`) — the retry/backoff policy for
//!   outbound delivery tasks.
//! - **Delivery worker** (`worker.rs`) — background loop that drains the
//!   delivery queue, invokes the outbound transport, and feeds outcomes back
//!   into the lifecycle and the node registry.

pub mod lifecycle;
pub mod queue;
pub mod resolver;
pub mod worker;

pub use lifecycle::MessageLifecycle;
pub use resolver::{IdentityResolver, RecipientResolution};
pub use worker::DeliveryWorker;
