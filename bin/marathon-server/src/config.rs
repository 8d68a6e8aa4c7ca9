//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for marathon-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Engine command-queue capacity.
    pub queue_capacity: usize,

    /// How long terminal tasks (and their checkpoints) are retained before
    /// the background sweeper removes them.
    pub retention_secs: u64,

    /// Interval between retention sweeps.
    pub gc_interval_secs: u64,

    /// Comma-separated CORS origin allowlist; unset means wildcard.
    pub cors_allowed_origins: Option<String>,

    /// Serve the Swagger UI and OpenAPI spec. Disable in production to avoid
    /// exposing the API structure.
    pub enable_swagger: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("MARATHON_BIND", "0.0.0.0:3000"),
            log_level: env_or("MARATHON_LOG", "info"),
            log_json: std::env::var("MARATHON_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            queue_capacity: parse_env("MARATHON_QUEUE_CAPACITY", 64),
            retention_secs: parse_env("MARATHON_RETENTION_SECS", 86_400),
            gc_interval_secs: parse_env("MARATHON_GC_INTERVAL_SECS", 300),
            cors_allowed_origins: std::env::var("MARATHON_CORS_ORIGINS").ok(),
            enable_swagger: std::env::var("MARATHON_ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
