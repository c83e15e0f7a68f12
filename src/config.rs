use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the content-addressed blob files
    #[serde(default = "default_content_root")]
    pub content_root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
    #[serde(default = "default_max_tag_length")]
    pub max_tag_length: usize,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Ceiling in bytes for owners without an explicit quota row, 0 = unlimited
    #[serde(default = "default_ceiling")]
    pub default_ceiling: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Owner ids allowed to administer quotas
    #[serde(default)]
    pub admin_owners: Vec<String>,
}

impl AuthConfig {
    pub fn is_admin(&self, owner_id: &str) -> bool {
        self.admin_owners.iter().any(|admin| admin == owner_id)
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "data/blobvault.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_content_root() -> String {
    "data/blobs".to_string()
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_max_name_length() -> usize {
    255
}

fn default_max_tag_length() -> usize {
    50
}

fn default_max_tags() -> usize {
    32
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_ceiling() -> i64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            content_root: default_content_root(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            max_name_length: default_max_name_length(),
            max_tag_length: default_max_tag_length(),
            max_tags: default_max_tags(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_ceiling: default_ceiling(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl UploadConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        tracing::info!(
            "Storage config: database={}, content_root={}, max_file_size_mb={}",
            config.database.path,
            config.storage.content_root,
            config.upload.max_file_size_mb
        );
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
    /// Format: BV_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("BV_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("BV_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        // Database overrides
        if let Ok(val) = env::var("BV_CONF_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = env::var("BV_CONF_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                self.database.max_connections = n;
            }
        }

        // Storage overrides
        if let Ok(val) = env::var("BV_CONF_STORAGE_CONTENT_ROOT") {
            self.storage.content_root = val;
        }

        // Upload overrides
        if let Ok(val) = env::var("BV_CONF_UPLOAD_MAX_FILE_SIZE_MB") {
            if let Ok(mb) = val.parse() {
                self.upload.max_file_size_mb = mb;
            }
        }

        // Auth overrides, comma separated
        if let Ok(val) = env::var("BV_CONF_AUTH_ADMIN_OWNERS") {
            self.auth.admin_owners = val
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Quota overrides
        if let Ok(val) = env::var("BV_CONF_QUOTA_DEFAULT_CEILING") {
            if let Ok(bytes) = val.parse() {
                self.quota.default_ceiling = bytes;
            }
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        fs::create_dir_all(&self.storage.content_root)?;

        Ok(())
    }
}
