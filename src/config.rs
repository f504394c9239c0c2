//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address, e.g. `127.0.0.1:8000`.
    pub bind_http: String,
    /// Relays used for publishing, fetching and subscriptions.
    pub relays: Vec<String>,
    /// JSON file describing trusted modules.
    pub modules_file: PathBuf,
    /// Directory holding one checkpoint file per subscription handler.
    pub checkpoint_root: PathBuf,
    /// Module whose key anchors internal transactions.
    pub ledger_module: String,
    /// Module whose key makes a `bolt11` tag mandatory.
    pub external_payment_module: String,
    /// Optional Tor SOCKS proxy (host:port) for relay connections.
    pub tor_socks: Option<String>,
    /// Connect timeout for passthrough requests.
    pub passthrough_connect_timeout: Duration,
    /// Total timeout for passthrough requests.
    pub passthrough_timeout: Duration,
    /// How long publish and fetch wait on each relay.
    pub relay_timeout: Duration,
    /// Default tracing directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP must be set")?;
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let modules_file =
            PathBuf::from(env::var("MODULES_FILE").context("MODULES_FILE must be set")?);
        let checkpoint_root =
            PathBuf::from(env::var("CHECKPOINT_ROOT").context("CHECKPOINT_ROOT must be set")?);
        let ledger_module = env::var("LEDGER_MODULE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "ledger".into());
        let external_payment_module = env::var("EXTERNAL_PAYMENT_MODULE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "urlx".into());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        Ok(Self {
            bind_http,
            relays,
            modules_file,
            checkpoint_root,
            ledger_module,
            external_payment_module,
            tor_socks,
            passthrough_connect_timeout: secs_var("PASSTHROUGH_CONNECT_TIMEOUT_SECS", 5),
            passthrough_timeout: secs_var("PASSTHROUGH_TIMEOUT_SECS", 30),
            relay_timeout: secs_var("RELAY_TIMEOUT_SECS", 10),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        })
    }
}

/// Parse a seconds value, falling back to `default` when unset or invalid.
fn secs_var(key: &str, default: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
