//! Configuration management for mnemo.
//!
//! Loads configuration from environment variables (with `.env` support):
//! - Store location, resolved against the project root
//! - Delegation worker pool size and default timeout
//! - Agent provider registry file
//! - Log output format

use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Default directory name of the store under the project root.
pub const DEFAULT_STORE_DIR: &str = ".mnemo";

/// Default number of delegation jobs allowed to run at once.
pub const DEFAULT_DELEGATION_CONCURRENCY: usize = 2;

/// Default delegation timeout (30 minutes).
pub const DEFAULT_DELEGATION_TIMEOUT_SECS: u64 = 1800;

/// Default number of ancestor directories searched for `.env` files.
pub const DEFAULT_ENV_SEARCH_DEPTH: usize = 5;

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Initialize configuration (call once at startup)
pub fn init() -> &'static Config {
    config()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreSettings,
    pub delegation: DelegationSettings,
    pub agents: AgentSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Explicit project root; resolved from the working directory when unset
    pub project_root: Option<PathBuf>,
    /// Store directory name (or absolute path) relative to the project root
    pub dir: String,
}

#[derive(Debug, Clone)]
pub struct DelegationSettings {
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub env_search_depth: usize,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// TOML file listing agent providers
    pub registry_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            store: StoreSettings {
                project_root: env::var("MNEMO_PROJECT_ROOT").ok().map(PathBuf::from),
                dir: env_or("MNEMO_DIR", DEFAULT_STORE_DIR),
            },
            delegation: DelegationSettings {
                concurrency: env_or("MNEMO_DELEGATION_CONCURRENCY", "2")
                    .parse()
                    .ok()
                    .filter(|n: &usize| *n > 0)
                    .unwrap_or(DEFAULT_DELEGATION_CONCURRENCY),
                timeout_secs: env_or("MNEMO_DELEGATION_TIMEOUT_SECS", "1800")
                    .parse()
                    .unwrap_or(DEFAULT_DELEGATION_TIMEOUT_SECS),
                env_search_depth: env_or("MNEMO_ENV_SEARCH_DEPTH", "5")
                    .parse()
                    .unwrap_or(DEFAULT_ENV_SEARCH_DEPTH),
            },
            agents: AgentSettings {
                registry_file: env::var("MNEMO_AGENTS_FILE").ok().map(PathBuf::from),
            },
            logging: LoggingConfig {
                format: match env_or("MNEMO_LOG_FORMAT", "pretty").to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    _ => LogFormat::Pretty,
                },
            },
        }
    }

    /// Build the service configuration for a resolved project root.
    pub fn store_config(&self, project_root: &Path) -> StoreConfig {
        StoreConfig {
            base_dir: project_root.join(&self.store.dir),
            project_root: Some(project_root.display().to_string()),
            delegation_concurrency: self.delegation.concurrency,
            delegation_timeout: Duration::from_secs(self.delegation.timeout_secs),
            env_search_depth: self.delegation.env_search_depth,
        }
    }
}

/// Configuration handed to the store and delegation services.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the record layout
    pub base_dir: PathBuf,
    /// Stamped into new records that do not name one
    pub project_root: Option<String>,
    pub delegation_concurrency: usize,
    pub delegation_timeout: Duration,
    pub env_search_depth: usize,
}

impl StoreConfig {
    /// Configuration with defaults for a store at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            project_root: None,
            delegation_concurrency: DEFAULT_DELEGATION_CONCURRENCY,
            delegation_timeout: Duration::from_secs(DEFAULT_DELEGATION_TIMEOUT_SECS),
            env_search_depth: DEFAULT_ENV_SEARCH_DEPTH,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.delegation_concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.delegation_timeout = timeout;
        self
    }

    pub fn with_project_root(mut self, project_root: impl Into<String>) -> Self {
        self.project_root = Some(project_root.into());
        self
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
