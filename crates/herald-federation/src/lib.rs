//! # herald-federation
//!
//! Server-to-server federation layer for Herald.
//!
//! ## Architecture
//!
//! Federation lets independently operated Herald nodes exchange encrypted
//! messages on behalf of their local identities. The server never sees
//! plaintext; it brokers opaque envelopes between nodes and keeps track of
//! who is reachable.
//!
//! ```text
//!  herald.example.com            herald.other.tld
//!       │                              │
//!       ├── GET /.well-known/herald-node ──►  (discovery probe)
//!       ├── GET  {fed}/identities/{handle} ─► (identity lookup)
//!       ├── POST {fed}/messages ──────────►   (message hand-off)
//!       │                              │
//! ```
//!
//! ## Key concepts
//!
//! - **Discovery** (`discovery.rs`): resolves a bare domain to its federation
//!   endpoint and capability document via the well-known convention, and
//!   fetches remote identity key material.
//! - **Outbound transport** (`transport.rs`): hands a sealed delivery
//!   envelope to a remote node, reporting latency on success.
//! - **Node registry** (`registry.rs`): the reachability ledger — tracks
//!   known peers, flips them offline after repeated failures, and enforces
//!   administrative blocks.

pub mod discovery;
pub mod error;
pub mod registry;
pub mod transport;
pub mod types;

pub use discovery::{HttpDiscovery, RemoteDiscovery};
pub use error::FederationError;
pub use registry::NodeRegistry;
pub use transport::{DeliveryOutcome, HttpTransport, OutboundTransport};
pub use types::{DeliveryEnvelope, DeliveryReceipt, NodeDiscoveryDocument, RemoteIdentity};
