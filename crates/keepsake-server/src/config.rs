//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use keepsake_shared::constants::{DEFAULT_HTTP_PORT, FREE_TIER_CAPSULE_LIMIT, MAX_UPLOAD_SIZE};

const DEV_MASTER_KEY: &str = "keepsake-development-master-key";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./keepsake.db`
    pub database_path: PathBuf,

    /// Filesystem path where encrypted blobs are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Prefix used when handing out blob URLs.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:8080`
    pub public_base_url: String,

    /// Master key material for file payload encryption.
    /// Env: `CAPSULE_MASTER_KEY`
    /// Default: a fixed development key (a warning is logged).
    pub master_key: String,

    /// Ed25519 public key of the payment gateway (hex-encoded, 64 chars).
    /// Env: `PAYMENT_SERVER_PUBKEY`
    /// Default: all-zeros, which rejects every token.
    pub payment_server_pubkey: [u8; 32],

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Seconds between background unlock sweeps, 0 disables the task.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `60`
    pub sweep_interval_secs: u64,

    /// Maximum plaintext upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 10 MiB
    pub max_upload_size: usize,

    /// Capsules a user may own without an entitlement.
    /// Env: `FREE_TIER_CAPSULE_LIMIT`
    /// Default: `2`
    pub free_tier_capsule_limit: u32,

    /// Whether the free-tier cap is enforced at all.
    /// Self-hosted admins can disable this to grant full access to all users.
    /// Env: `ENTITLEMENT_REQUIRED` (true/false)
    /// Default: `true`
    pub entitlement_required: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./keepsake.db"),
            blob_storage_path: PathBuf::from("./blobs"),
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            master_key: DEV_MASTER_KEY.to_string(),
            payment_server_pubkey: [0u8; 32],
            admin_token: None,
            sweep_interval_secs: 60,
            max_upload_size: MAX_UPLOAD_SIZE,
            free_tier_capsule_limit: FREE_TIER_CAPSULE_LIMIT,
            entitlement_required: true,
        }
    }
}

// Secrets stay out of `info!(?config)`.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("blob_storage_path", &self.blob_storage_path)
            .field("public_base_url", &self.public_base_url)
            .field("master_key", &"<redacted>")
            .field("payment_server_pubkey", &hex::encode(self.payment_server_pubkey))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("max_upload_size", &self.max_upload_size)
            .field("free_tier_capsule_limit", &self.free_tier_capsule_limit)
            .field("entitlement_required", &self.entitlement_required)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = var("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(url) = var("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        match var("CAPSULE_MASTER_KEY").filter(|k| !k.is_empty()) {
            Some(key) => config.master_key = key,
            None => tracing::warn!(
                "CAPSULE_MASTER_KEY not set, using the development key (never do this in production)"
            ),
        }

        if let Some(hex_key) = var("PAYMENT_SERVER_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.payment_server_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid PAYMENT_SERVER_PUBKEY, using default (rejects all tokens)"
                    );
                }
            }
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = var("SWEEP_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(n) => config.sweep_interval_secs = n,
                Err(_) => tracing::warn!(value = %val, "Invalid SWEEP_INTERVAL_SECS, using default"),
            }
        }

        if let Some(val) = var("MAX_UPLOAD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(val) = var("FREE_TIER_CAPSULE_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) => config.free_tier_capsule_limit = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid FREE_TIER_CAPSULE_LIMIT, using default")
                }
            }
        }

        if let Some(val) = var("ENTITLEMENT_REQUIRED") {
            config.entitlement_required = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(value: &str) -> Result<[u8; 32], String> {
    let value = value.trim();
    if value.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", value.len()));
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(value, &mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = from_pairs(&[]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.payment_server_pubkey, [0u8; 32]);
        assert_eq!(config.master_key, DEV_MASTER_KEY);
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.free_tier_capsule_limit, 2);
        assert!(config.entitlement_required);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let pubkey = "ab".repeat(32);
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("PUBLIC_BASE_URL", "https://capsules.example/"),
            ("CAPSULE_MASTER_KEY", "prod-key"),
            ("ADMIN_TOKEN", "s3cret"),
            ("SWEEP_INTERVAL_SECS", "0"),
            ("ENTITLEMENT_REQUIRED", "false"),
            ("PAYMENT_SERVER_PUBKEY", pubkey.as_str()),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.public_base_url, "https://capsules.example");
        assert_eq!(config.master_key, "prod-key");
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.sweep_interval_secs, 0);
        assert!(!config.entitlement_required);
        assert_eq!(config.payment_server_pubkey, [0xab; 32]);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("MAX_UPLOAD_SIZE", "0"),
            ("PAYMENT_SERVER_PUBKEY", "abcd"),
        ]);
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.max_upload_size, MAX_UPLOAD_SIZE);
        assert_eq!(config.payment_server_pubkey, [0u8; 32]);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = from_pairs(&[("CAPSULE_MASTER_KEY", "top-secret"), ("ADMIN_TOKEN", "hunter2")]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("top-secret"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_parse_hex_pubkey() {
        assert_eq!(parse_hex_pubkey(&"ab".repeat(32)).unwrap(), [0xab; 32]);
        assert!(parse_hex_pubkey("abcd").is_err());
        assert!(parse_hex_pubkey(&"zz".repeat(32)).is_err());
    }
}
