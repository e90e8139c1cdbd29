//! Runtime configuration for realtime-page-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Page sizing, the default sort for HTTP queries and demo seeding live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::query::{SortDirection, SortSpec};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "realtime-page-cache",
    about = "Cursor-paginated query cache over a live collection"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address. Overrides `server.listen` from the config file.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Page cache settings.
    pub cache: CacheConfig,

    /// Sort applied to HTTP queries.
    pub query: QueryConfig,

    /// Demo collection seeding.
    pub seed: SeedConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Capacity of the update broadcast feeding SSE clients.
    pub update_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            update_buffer: 256,
        }
    }
}

/// Page cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Items per page when the caller does not say.
    pub page_size: usize,

    /// Largest page size a caller may ask for. Each distinct size gets its
    /// own page manager, so this also bounds how many can be created.
    pub max_page_size: usize,

    /// Bound of each manager's command and delivery queues.
    pub queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            max_page_size: 100,
            queue_capacity: 64,
        }
    }
}

/// Sort used for every query issued over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub sort_field: String,
    pub direction: SortDirection,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            sort_field: "id".to_string(),
            direction: SortDirection::Desc,
        }
    }
}

impl QueryConfig {
    pub fn sort(&self) -> SortSpec {
        SortSpec::new(self.sort_field.clone(), self.direction)
    }
}

/// Demo collection seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Number of generated members (0 = start empty).
    pub items: usize,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self { items: 100 }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.cache.page_size > 0, "cache.page_size must be positive");
        anyhow::ensure!(
            self.cache.page_size <= self.cache.max_page_size,
            "cache.page_size {} exceeds cache.max_page_size {}",
            self.cache.page_size,
            self.cache.max_page_size
        );
        anyhow::ensure!(
            self.cache.queue_capacity > 0,
            "cache.queue_capacity must be positive"
        );
        anyhow::ensure!(
            !self.query.sort_field.is_empty(),
            "query.sort_field must not be empty"
        );
        Ok(())
    }
}
