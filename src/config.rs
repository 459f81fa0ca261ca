use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix every route is nested under, e.g. "/api/mfs"
    #[serde(default)]
    pub path_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Verify tokens with the fixed HS256 test secret instead of the remote key set
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub key_url: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default)]
    pub issuer: String,
    /// Scope every token must carry; empty disables the check
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
    #[serde(default = "default_role_claim")]
    pub role_claim: String,
    /// Role every caller must hold; empty disables the check
    #[serde(default)]
    pub required_role: String,
    #[serde(default = "default_jwks_cache_secs")]
    pub jwks_cache_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "data/mfs.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_admin_role() -> String {
    "admin".to_string()
}

fn default_role_claim() -> String {
    "role".to_string()
}

fn default_jwks_cache_secs() -> u64 {
    300
}

fn default_chunk_size() -> usize {
    255 * 1024
}

fn default_max_upload_size() -> u64 {
    30 * 1024 * 1024
}

fn default_op_timeout() -> u64 {
    10
}

fn default_pending_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path_prefix: String::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            key_url: String::new(),
            audience: String::new(),
            issuer: String::new(),
            scope: String::new(),
            admin_role: default_admin_role(),
            role_claim: default_role_claim(),
            required_role: String::new(),
            jwks_cache_secs: default_jwks_cache_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_upload_size: default_max_upload_size(),
            op_timeout_secs: default_op_timeout(),
            pending_ttl_secs: default_pending_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Parse an override, failing on values that do not fit the field
fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value {:?} for {}: {}", val, key, e)),
        None => Ok(None),
    }
}

fn parse_bool(key: &str, val: &str) -> anyhow::Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("invalid value {:?} for {}: expected a boolean", val, key),
    }
}

impl StorageConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        config.ensure_directories()?;
        Ok(config)
    }

    /// Load configuration from config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: MFS_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        // Server overrides
        if let Some(val) = lookup("MFS_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(port) = parse_var(&lookup, "MFS_CONF_SERVER_PORT")? {
            self.server.port = port;
        }
        if let Some(val) = lookup("MFS_CONF_SERVER_PATH_PREFIX") {
            self.server.path_prefix = val;
        }

        // Database overrides
        if let Some(val) = lookup("MFS_CONF_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Some(n) = parse_var(&lookup, "MFS_CONF_DATABASE_MAX_CONNECTIONS")? {
            self.database.max_connections = n;
        }

        // Auth overrides
        if let Some(val) = lookup("MFS_CONF_AUTH_TEST_MODE") {
            self.auth.test_mode = parse_bool("MFS_CONF_AUTH_TEST_MODE", &val)?;
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_KEY_URL") {
            self.auth.key_url = val;
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_AUDIENCE") {
            self.auth.audience = val;
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_ISSUER") {
            self.auth.issuer = val;
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_SCOPE") {
            self.auth.scope = val;
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_ADMIN_ROLE") {
            if !val.trim().is_empty() {
                self.auth.admin_role = val;
            }
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_ROLE_CLAIM") {
            if !val.trim().is_empty() {
                self.auth.role_claim = val;
            }
        }
        if let Some(val) = lookup("MFS_CONF_AUTH_REQUIRED_ROLE") {
            self.auth.required_role = val;
        }
        if let Some(secs) = parse_var(&lookup, "MFS_CONF_AUTH_JWKS_CACHE_SECS")? {
            self.auth.jwks_cache_secs = secs;
        }

        // Storage overrides
        if let Some(size) = parse_var(&lookup, "MFS_CONF_STORAGE_CHUNK_SIZE")? {
            self.storage.chunk_size = size;
        }
        if let Some(size) = parse_var(&lookup, "MFS_CONF_STORAGE_MAX_UPLOAD_SIZE")? {
            self.storage.max_upload_size = size;
        }
        if let Some(secs) = parse_var(&lookup, "MFS_CONF_STORAGE_OP_TIMEOUT_SECS")? {
            self.storage.op_timeout_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "MFS_CONF_STORAGE_PENDING_TTL_SECS")? {
            self.storage.pending_ttl_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "MFS_CONF_STORAGE_SWEEP_INTERVAL_SECS")? {
            self.storage.sweep_interval_secs = secs;
        }
        Ok(())
    }

    /// Trim values whose surrounding whitespace would change routing or matching
    fn normalize(&mut self) {
        let prefix = self.server.path_prefix.trim().trim_end_matches('/');
        self.server.path_prefix = if prefix.is_empty() || prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        };
        self.auth.scope = self.auth.scope.trim().to_string();
        self.auth.required_role = self.auth.required_role.trim().to_string();
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.storage.chunk_size == 0 {
            anyhow::bail!("storage.chunk_size must be positive");
        }
        if self.storage.max_upload_size == 0 {
            anyhow::bail!("storage.max_upload_size must be positive");
        }
        if self.storage.op_timeout_secs == 0 {
            anyhow::bail!("storage.op_timeout_secs must be positive");
        }
        if self.storage.pending_ttl_secs < self.storage.sweep_interval_secs.max(1) {
            anyhow::bail!(
                "storage.pending_ttl_secs ({}) must be at least storage.sweep_interval_secs ({})",
                self.storage.pending_ttl_secs,
                self.storage.sweep_interval_secs
            );
        }
        if !self.auth.test_mode {
            if self.auth.key_url.is_empty() {
                anyhow::bail!("auth.key_url is required outside test mode");
            }
            if self.auth.issuer.is_empty() || self.auth.audience.is_empty() {
                anyhow::bail!("auth.issuer and auth.audience are required outside test mode");
            }
        }
        Ok(())
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
