//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! The loaded [`AppConfig`] is passed explicitly into each component at
//! construction. Nothing in Herald reads configuration ambiently.

use serde::Deserialize;

/// Load the application configuration from the environment.
///
/// Should be called once at startup; the result is shared via `Arc` from there.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("server.domain", "localhost")?
        .set_default("server.federation_enabled", true)?
        .set_default("server.registration_open", true)?
        .set_default("server.max_users", 500)?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("auth.jwt_secret", "")?
        .set_default("limits.max_message_size_bytes", 10_485_760)? // 10MB
        .set_default("limits.max_conversation_page", 100)?
        .set_default("federation.max_attempts", 5)?
        .set_default("federation.backoff_base_secs", 30)?
        .set_default("federation.backoff_cap_secs", 3600)?
        .set_default("federation.claim_lease_secs", 60)?
        .set_default("federation.offline_threshold", 3)?
        .set_default("federation.identity_freshness_secs", 86_400)? // 24h
        .set_default("federation.discovery_timeout_secs", 5)?
        .set_default("federation.transport_timeout_secs", 30)?
        .set_default("federation.worker_poll_interval_secs", 5)?
        .set_default("federation.worker_count", 1)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HERALD_SERVER__DOMAIN, HERALD_DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("HERALD")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub federation: FederationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public domain of this node (e.g. "herald.example.com"). Forms the
    /// right-hand side of every local handle.
    pub domain: String,
    pub host: String,
    pub port: u16,
    /// Whether this node exchanges messages with remote nodes at all.
    pub federation_enabled: bool,
    /// Advertised in the discovery document; registration itself is handled
    /// by the account subsystem, not this server.
    pub registration_open: bool,
    pub max_users: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL — optional; omit for in-memory lite mode.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT verification secret (HS256), shared with the account subsystem
    /// that issues tokens.
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Ceiling on the encrypted payload size. Oversized sends are rejected
    /// before any record is created.
    pub max_message_size_bytes: u64,
    /// Hard cap on conversation page size.
    pub max_conversation_page: u32,
}

/// Tuning for federated delivery: retry ceilings, backoff, cache freshness.
#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    /// Attempt ceiling per delivery task. Once reached the task (and, with no
    /// other outstanding task, the message) is terminally failed.
    pub max_attempts: u32,
    /// First retry delay; doubles each attempt.
    pub backoff_base_secs: u64,
    /// Upper bound on the retry delay.
    pub backoff_cap_secs: u64,
    /// Visibility lease taken when a worker claims a task. A crashed worker's
    /// claim expires after this long and the task becomes claimable again.
    pub claim_lease_secs: u64,
    /// Consecutive delivery failures before a node is marked offline.
    pub offline_threshold: u32,
    /// How long a cached federated identity is considered fresh.
    pub identity_freshness_secs: u64,
    pub discovery_timeout_secs: u64,
    pub transport_timeout_secs: u64,
    /// How long an idle worker sleeps before polling the queue again.
    pub worker_poll_interval_secs: u64,
    pub worker_count: u32,
}

impl FederationConfig {
    pub fn identity_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.identity_freshness_secs as i64)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }
}
