// ABOUTME: Deterministic task identity and per-table reference point naming
// ABOUTME: Keys watermark history, lease rows and snapshot name prefixes

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::{Endpoint, Scope, SyncConfig};
use crate::store::TableRef;

/// Identity of a configured sync task.
///
/// Derived only from endpoint coordinates and scope, so restarting the process
/// with the same configuration resumes the same watermark history and lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    id: String,
    scope: Scope,
}

impl TaskKey {
    /// Derive the task key from a configuration.
    ///
    /// Format: `<host>_<port>_<db>_<table>_to_<host>_<port>_<db>_<table>`, where
    /// database scope uses `*` for both tables. Dots and colons become `_`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use branch_replicator::config::SyncConfig;
    /// # use branch_replicator::task::TaskKey;
    /// let config = SyncConfig::from_toml_str(r#"
    /// [source]
    /// host = "10.0.0.1"
    /// user = "u"
    /// database = "db1"
    /// table = "t1"
    /// [destination]
    /// host = "10.0.0.2"
    /// user = "u"
    /// database = "db2"
    /// table = "t2"
    /// [stage]
    /// name = "s1"
    /// "#).unwrap();
    /// assert_eq!(
    ///     TaskKey::derive(&config).id(),
    ///     "10_0_0_1_6001_db1_t1_to_10_0_0_2_6001_db2_t2"
    /// );
    /// ```
    pub fn derive(config: &SyncConfig) -> Self {
        let scope = config.sync.scope;
        let id = format!(
            "{}_to_{}",
            endpoint_part(&config.source, scope),
            endpoint_part(&config.destination, scope)
        );
        Self {
            id: id.replace(['.', ':'], "_"),
            scope,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Per-table task used for watermarks and reference points.
    ///
    /// In table scope the key is the task id itself; in database scope each
    /// table gets `<task id>/<table>` under the shared lease.
    pub fn for_table(&self, source: TableRef, destination: TableRef) -> TableTask {
        let key = match self.scope {
            Scope::Table => self.id.clone(),
            Scope::Database => format!("{}/{}", self.id, source.table),
        };
        TableTask {
            key,
            source,
            destination,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

fn endpoint_part(endpoint: &Endpoint, scope: Scope) -> String {
    let table = match scope {
        Scope::Table => endpoint.table.as_deref().unwrap_or("*"),
        Scope::Database => "*",
    };
    format!(
        "{}_{}_{}_{}",
        endpoint.host, endpoint.port, endpoint.database, table
    )
}

/// One source table paired with its destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTask {
    pub key: String,
    pub source: TableRef,
    pub destination: TableRef,
}

impl TableTask {
    /// Name prefix shared by every reference point this table task creates.
    pub fn snapshot_prefix(&self) -> String {
        let digest = Sha256::digest(self.key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("cdc_{}_", &hex[..12])
    }

    /// Time-ordered reference point name for the given instant.
    pub fn snapshot_name_at(&self, now: DateTime<Utc>) -> String {
        format!("{}{}", self.snapshot_prefix(), now.format("%y%m%d%H%M%S%3f"))
    }

    /// Whether a reference point name belongs to this table task.
    pub fn owns_snapshot(&self, name: &str) -> bool {
        name.strip_prefix(&self.snapshot_prefix())
            .is_some_and(|suffix| suffix.len() == 15 && suffix.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Staging table shaped like the source but empty; the FULL diff base.
    pub fn zero_table(&self) -> TableRef {
        self.source.with_table(&format!("{}_sync_zero", self.source.table))
    }

    /// Staging table materialising the prior reference point.
    pub fn prev_table(&self) -> TableRef {
        self.source.with_table(&format!("{}_sync_prev", self.source.table))
    }
}

/// Whether a table name is one of the staging tables created during diffs.
pub fn is_staging_table(name: &str) -> bool {
    name.ends_with("_sync_zero") || name.ends_with("_sync_prev")
}
