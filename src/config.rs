// ABOUTME: Sync task configuration loaded from TOML
// ABOUTME: Endpoints, stage, scope, intervals and tuning knobs with validation

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::store::{Stage, TableRef};

/// Connection details for one MySQL-protocol endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Table name; required in table scope, ignored in database scope.
    #[serde(default)]
    pub table: Option<String>,
}

impl Endpoint {
    pub fn table_ref(&self, table: &str) -> TableRef {
        TableRef::new(&self.database, table)
    }
}

// Renders without the password so endpoints can be logged.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Where diff artifacts are staged between source and destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Named stage, rendered as `stage://<name>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Direct location such as `file:///tmp/stage`.
    #[serde(default)]
    pub url: Option<String>,
}

impl StageConfig {
    pub fn to_stage(&self) -> Result<Stage> {
        match (&self.name, &self.url) {
            (Some(name), None) if !name.is_empty() => Ok(Stage::Named(name.clone())),
            (None, Some(url)) if !url.is_empty() => Ok(Stage::Url(url.trim_end_matches('/').to_string())),
            (Some(_), Some(_)) => bail!("stage must set either `name` or `url`, not both"),
            _ => bail!("stage requires a non-empty `name` or `url`"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Table,
    Database,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Table => "table",
            Scope::Database => "database",
        }
    }
}

/// Scheduling, retention and verification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub scope: Scope,
    /// Seconds between sync cycles
    pub interval_secs: u64,
    /// Full verification every N successful cycles (0 disables)
    pub verify_interval: u64,
    /// Fast verification every N successful cycles (0 disables)
    pub fast_verify_every: u64,
    /// Watermarks retained per task
    pub max_watermarks: usize,
    pub lock_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub verify_retries: u32,
    pub verify_retry_delay_secs: u64,
    /// Sample-verify the newest watermark before resuming from it
    pub verify_watermark_on_resume: bool,
    /// Upper bound on reference points probed during archeology
    pub archeology_candidates: usize,
    /// Create a synthetic index on keyless destination tables
    pub auto_index: bool,
    /// Commit a fresh watermark even when an incremental diff is empty
    pub advance_watermark_on_noop: bool,
    /// Columns hashed by fast verification when sampling is not possible
    pub fast_verify_columns: Vec<String>,
    /// Tables at or above this size (bytes) are sampled by fast verification
    pub large_table_bytes: u64,
    /// Row-count threshold used when size is unavailable
    pub large_table_rows: u64,
    /// Hash buckets for sampled verification; one bucket is checked
    pub sample_buckets: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            scope: Scope::Table,
            interval_secs: 60,
            verify_interval: 50,
            fast_verify_every: 5,
            max_watermarks: 4,
            lock_timeout_secs: 30,
            heartbeat_secs: 10,
            verify_retries: 3,
            verify_retry_delay_secs: 2,
            verify_watermark_on_resume: true,
            archeology_candidates: 8,
            auto_index: true,
            advance_watermark_on_noop: false,
            fast_verify_columns: Vec::new(),
            large_table_bytes: 1 << 30,
            large_table_rows: 1_000_000,
            sample_buckets: 100,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn verify_retry_delay(&self) -> Duration {
        Duration::from_secs(self.verify_retry_delay_secs)
    }
}

/// Complete configuration of one sync task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub stage: StageConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

fn default_port() -> u16 {
    6001
}

impl SyncConfig {
    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(text).context("Failed to parse sync config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync config from {:?}", path))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid sync config {:?}", path))
    }

    /// Reject configurations that cannot run or would damage the source.
    pub fn validate(&self) -> Result<()> {
        for (side, endpoint) in [("source", &self.source), ("destination", &self.destination)] {
            if endpoint.host.trim().is_empty() {
                bail!("{} host must not be empty", side);
            }
            if endpoint.user.trim().is_empty() {
                bail!("{} user must not be empty", side);
            }
            if endpoint.database.trim().is_empty() {
                bail!("{} database must not be empty", side);
            }
            if self.sync.scope == Scope::Table
                && endpoint.table.as_deref().map_or(true, |t| t.trim().is_empty())
            {
                bail!("{} table is required in table scope", side);
            }
        }

        self.stage.to_stage()?;

        if self.sync.interval_secs == 0 {
            bail!("interval_secs must be at least 1");
        }
        if self.sync.max_watermarks == 0 {
            bail!("max_watermarks must be at least 1");
        }
        if self.sync.heartbeat_secs == 0 || self.sync.heartbeat_secs >= self.sync.lock_timeout_secs {
            bail!(
                "heartbeat_secs ({}) must be non-zero and below lock_timeout_secs ({})",
                self.sync.heartbeat_secs,
                self.sync.lock_timeout_secs
            );
        }
        if self.sync.sample_buckets == 0 {
            bail!("sample_buckets must be at least 1");
        }

        // CRITICAL: replicating onto the source itself would truncate it on FULL sync
        let same_target = self.source.host.eq_ignore_ascii_case(&self.destination.host)
            && self.source.port == self.destination.port
            && self.source.database == self.destination.database
            && (self.sync.scope == Scope::Database || self.source.table == self.destination.table);
        if same_target {
            bail!(
                "Source and destination resolve to the same {} ({}); refusing to sync onto the source",
                self.sync.scope.as_str(),
                self.source
            );
        }

        Ok(())
    }

    pub fn stage(&self) -> Result<Stage> {
        self.stage.to_stage()
    }
}
