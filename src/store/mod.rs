// ABOUTME: Collaborator contract for source and destination SQL endpoints
// ABOUTME: Async traits for introspection, snapshots, diffs, bulk loads and meta state

pub mod matrixone;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::utils::quote_mysql_ident;
use crate::verify::ChecksumQuery;

pub use matrixone::MatrixOneConnector;

/// Database-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
        }
    }

    /// Quoted `` `db`.`table` `` form for embedding in SQL.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            quote_mysql_ident(&self.database),
            quote_mysql_ident(&self.table)
        )
    }

    /// Same database, different table.
    pub fn with_table(&self, table: &str) -> TableRef {
        TableRef::new(&self.database, table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Location diff artifacts are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Named(String),
    Url(String),
}

impl Stage {
    pub fn location(&self) -> String {
        match self {
            Stage::Named(name) => format!("stage://{}", name),
            Stage::Url(url) => url.clone(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Lower-cased column type as reported by the catalog, e.g. `bigint`, `vecf32(3)`
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnInfo {
    pub fn is_integer(&self) -> bool {
        let base = self
            .data_type
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or("");
        matches!(
            base,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }

    pub fn is_vector(&self) -> bool {
        self.data_type.starts_with("vecf32") || self.data_type.starts_with("vecf64")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub primary: bool,
    pub unique: bool,
}

/// Approximate table size; either part may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSize {
    pub bytes: Option<u64>,
    pub rows: Option<u64>,
}

/// Row count plus order-independent content hash. An empty set hashes to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Checksum {
    pub count: u64,
    pub hash: Option<u64>,
}

/// One persisted checkpoint for a table task; newest first when listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub token: String,
    pub created_at: Option<String>,
}

/// Catalog and checksum access shared by both sides.
#[async_trait]
pub trait TableStore: Send {
    /// Loggable endpoint description (never includes credentials).
    fn endpoint(&self) -> String;

    async fn table_exists(&mut self, table: &TableRef) -> Result<bool>;

    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>>;

    async fn indexes(&mut self, table: &TableRef) -> Result<Vec<IndexInfo>>;

    async fn row_count(&mut self, table: &TableRef) -> Result<u64>;

    async fn approximate_size(&mut self, table: &TableRef) -> Result<TableSize>;

    /// `(distinct, total)` for one column; performs a full scan.
    async fn column_cardinality(&mut self, table: &TableRef, column: &str) -> Result<(u64, u64)>;

    async fn checksum(&mut self, query: &ChecksumQuery) -> Result<Checksum>;
}

/// Upstream side: reference points, diffs and staged artifacts.
#[async_trait]
pub trait SourceStore: TableStore {
    /// Base tables of a database.
    async fn list_tables(&mut self, database: &str) -> Result<Vec<String>>;

    async fn show_create_table(&mut self, table: &TableRef) -> Result<String>;

    async fn snapshot_exists(&mut self, name: &str) -> Result<bool>;

    async fn create_snapshot(&mut self, name: &str, table: &TableRef) -> Result<()>;

    /// Drops the reference point if it exists.
    async fn drop_snapshot(&mut self, name: &str) -> Result<()>;

    /// Reference points whose name starts with `prefix`, newest first.
    async fn list_snapshots(&mut self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Recreate `target` as an empty table shaped like `like`.
    async fn create_empty_like(&mut self, target: &TableRef, like: &TableRef) -> Result<()>;

    /// Recreate `target` as a copy of `from` at reference point `snapshot`.
    async fn clone_at_snapshot(
        &mut self,
        target: &TableRef,
        from: &TableRef,
        snapshot: &str,
    ) -> Result<()>;

    /// Drops the table if it exists.
    async fn drop_table(&mut self, table: &TableRef) -> Result<()>;

    /// Diff `table` at `snapshot` against `base`, writing artifacts to `stage`.
    ///
    /// Returns artifact paths. An empty `base` yields row exports; otherwise
    /// the artifacts are SQL changesets addressed to `base`.
    async fn diff(
        &mut self,
        table: &TableRef,
        snapshot: &str,
        base: &TableRef,
        stage: &Stage,
    ) -> Result<Vec<String>>;

    async fn read_artifact(&mut self, path: &str) -> Result<String>;

    /// Delete a consumed artifact, local file or staged object alike.
    async fn remove_artifact(&mut self, path: &str) -> Result<()>;
}

/// Downstream side: data, transactions and the persisted meta state.
#[async_trait]
pub trait DestinationStore: TableStore {
    async fn ensure_database(&mut self, database: &str) -> Result<()>;

    async fn create_table(&mut self, ddl: &str) -> Result<()>;

    async fn create_index(&mut self, table: &TableRef, name: &str, columns: &[String]) -> Result<()>;

    /// Create the meta database with its watermark and lease tables.
    async fn ensure_meta_schema(&mut self) -> Result<()>;

    /// Claim the lease when unowned, owned by `owner`, or older than `timeout_secs`.
    ///
    /// Returns `None` on success, otherwise the current holder.
    async fn acquire_lease(
        &mut self,
        task_id: &str,
        owner: &str,
        timeout_secs: u64,
    ) -> Result<Option<String>>;

    /// Refresh the lease timestamp; `false` if `owner` no longer holds it.
    async fn renew_lease(&mut self, task_id: &str, owner: &str) -> Result<bool>;

    async fn release_lease(&mut self, task_id: &str, owner: &str) -> Result<()>;

    /// Watermarks of `key`, most recently recorded first.
    async fn list_watermarks(&mut self, key: &str) -> Result<Vec<Watermark>>;

    async fn insert_watermark(&mut self, key: &str, token: &str) -> Result<()>;

    async fn delete_watermark(&mut self, key: &str, token: &str) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Remove every row; transactional, unlike `TRUNCATE`.
    async fn clear_table(&mut self, table: &TableRef) -> Result<u64>;

    /// Bulk-load one delimited export artifact.
    async fn load_artifact(&mut self, path: &str, table: &TableRef) -> Result<u64>;

    /// Execute one statement and return the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64>;
}

/// Opens connections to both endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn source(&self) -> Result<Box<dyn SourceStore>>;

    async fn destination(&self) -> Result<Box<dyn DestinationStore>>;
}
