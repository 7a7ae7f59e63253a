// ABOUTME: MatrixOne implementation of the store contract over the MySQL protocol
// ABOUTME: Snapshots, data branch diffs, stage artifacts, bulk loads and meta tables

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Row};

use super::{
    Checksum, ColumnInfo, Connector, DestinationStore, IndexInfo, SourceStore, Stage, TableRef,
    TableSize, TableStore, Watermark,
};
use crate::config::Endpoint;
use crate::utils::{quote_mysql_ident, quote_mysql_literal};
use crate::verify::ChecksumQuery;

/// Database holding watermark history and lease rows on the destination.
pub const META_DB: &str = "cdc_by_data_branch_db";
const WATERMARK_TABLE: &str = "watermarks";
const LEASE_TABLE: &str = "leases";

/// One connection to a MatrixOne endpoint.
pub struct MatrixOneStore {
    conn: Conn,
    endpoint: String,
}

impl MatrixOneStore {
    /// Open a connection without selecting a default database.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(endpoint.user.clone()))
            .pass(Some(endpoint.password.clone()));

        let conn = Conn::new(opts)
            .await
            .with_context(|| format!("Failed to connect to {}", endpoint))?;

        tracing::debug!("Connected to {}", endpoint);
        Ok(Self {
            conn,
            endpoint: endpoint.to_string(),
        })
    }

    async fn run(&mut self, sql: &str) -> Result<u64> {
        tracing::trace!("[{}] {}", self.endpoint, sql);
        self.conn
            .query_drop(sql)
            .await
            .with_context(|| format!("Statement failed on {}: {}", self.endpoint, truncate(sql)))?;
        Ok(self.conn.affected_rows())
    }

    async fn first_row(&mut self, sql: &str) -> Result<Option<Row>> {
        tracing::trace!("[{}] {}", self.endpoint, sql);
        self.conn
            .query_first(sql)
            .await
            .with_context(|| format!("Query failed on {}: {}", self.endpoint, truncate(sql)))
    }

    async fn rows(&mut self, sql: &str) -> Result<Vec<Row>> {
        tracing::trace!("[{}] {}", self.endpoint, sql);
        self.conn
            .query(sql)
            .await
            .with_context(|| format!("Query failed on {}: {}", self.endpoint, truncate(sql)))
    }

    async fn lease_owner(&mut self, task_id: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT lock_owner FROM {}.{} WHERE task_id = ?",
            META_DB, LEASE_TABLE
        );
        let row: Option<Row> = self
            .conn
            .exec_first(sql, (task_id,))
            .await
            .context("Failed to read lease owner")?;
        match row {
            Some(row) => column::<Option<String>>(&row, 0, "lock_owner"),
            None => Ok(None),
        }
    }
}

fn column<T: FromValue>(row: &Row, idx: usize, what: &str) -> Result<T> {
    match row.get_opt::<T, usize>(idx) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => bail!("Failed to decode {}: {:?}", what, e),
        None => bail!("Missing {} in result row", what),
    }
}

fn named<T: FromValue>(row: &Row, name: &str) -> Result<T> {
    match row.get_opt::<T, &str>(name) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => bail!("Failed to decode {}: {:?}", name, e),
        None => bail!("Missing {} in result row", name),
    }
}

fn truncate(sql: &str) -> &str {
    match sql.char_indices().nth(200) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

/// Newest first by insertion time; the name breaks ties within one second.
fn list_watermarks_sql() -> String {
    format!(
        "SELECT watermark, CAST(created_at AS VARCHAR) FROM {}.{} \
         WHERE task_id = ? ORDER BY created_at DESC, watermark DESC",
        META_DB, WATERMARK_TABLE
    )
}

fn remove_statement(path: &str) -> String {
    format!("REMOVE {}", quote_mysql_literal(path))
}

fn snapshot_clause(snapshot: &str) -> String {
    format!("{{snapshot = {}}}", quote_mysql_literal(snapshot))
}

#[async_trait]
impl TableStore for MatrixOneStore {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn table_exists(&mut self, table: &TableRef) -> Result<bool> {
        let row: Option<Row> = self
            .conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                (table.database.as_str(), table.table.as_str()),
            )
            .await
            .with_context(|| format!("Failed to check existence of {}", table))?;
        match row {
            Some(row) => Ok(column::<u64>(&row, 0, "count")? > 0),
            None => Ok(false),
        }
    }

    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .rows(&format!("SHOW COLUMNS FROM {}", table.qualified()))
            .await
            .with_context(|| format!("Failed to list columns of {}", table))?;

        rows.iter()
            .map(|row| {
                let null: String = named(row, "Null")?;
                let key: Option<String> = named(row, "Key")?;
                Ok(ColumnInfo {
                    name: named(row, "Field")?,
                    data_type: named::<String>(row, "Type")?.to_lowercase(),
                    nullable: null.eq_ignore_ascii_case("YES"),
                    primary_key: key.as_deref() == Some("PRI"),
                })
            })
            .collect()
    }

    async fn indexes(&mut self, table: &TableRef) -> Result<Vec<IndexInfo>> {
        let rows = self
            .rows(&format!("SHOW INDEX FROM {}", table.qualified()))
            .await
            .with_context(|| format!("Failed to list indexes of {}", table))?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &rows {
            let name: String = named(row, "Key_name")?;
            let column_name: String = named(row, "Column_name")?;
            let non_unique: i64 = named(row, "Non_unique")?;
            match indexes.iter_mut().find(|i| i.name == name) {
                Some(index) => index.columns.push(column_name),
                None => indexes.push(IndexInfo {
                    primary: name.eq_ignore_ascii_case("PRIMARY"),
                    unique: non_unique == 0,
                    name,
                    columns: vec![column_name],
                }),
            }
        }
        Ok(indexes)
    }

    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        let row = self
            .first_row(&format!("SELECT COUNT(*) FROM {}", table.qualified()))
            .await?
            .with_context(|| format!("COUNT(*) on {} returned no row", table))?;
        column(&row, 0, "count")
    }

    async fn approximate_size(&mut self, table: &TableRef) -> Result<TableSize> {
        let sql = format!(
            "SELECT mo_table_size({db}, {t}), mo_table_rows({db}, {t})",
            db = quote_mysql_literal(&table.database),
            t = quote_mysql_literal(&table.table)
        );
        match self.first_row(&sql).await {
            Ok(Some(row)) => Ok(TableSize {
                bytes: column::<Option<u64>>(&row, 0, "size").unwrap_or(None),
                rows: column::<Option<u64>>(&row, 1, "rows").unwrap_or(None),
            }),
            Ok(None) => Ok(TableSize::default()),
            Err(e) => {
                tracing::debug!("Table size unavailable for {}: {}", table, e);
                Ok(TableSize::default())
            }
        }
    }

    async fn column_cardinality(&mut self, table: &TableRef, column_name: &str) -> Result<(u64, u64)> {
        let sql = format!(
            "SELECT COUNT(DISTINCT {col}), COUNT(*) FROM {t}",
            col = quote_mysql_ident(column_name),
            t = table.qualified()
        );
        let row = self
            .first_row(&sql)
            .await?
            .with_context(|| format!("Cardinality query on {} returned no row", table))?;
        Ok((column(&row, 0, "distinct")?, column(&row, 1, "total")?))
    }

    async fn checksum(&mut self, query: &ChecksumQuery) -> Result<Checksum> {
        let row = self
            .first_row(&query.to_sql())
            .await?
            .with_context(|| format!("Checksum on {} returned no row", query.table))?;
        Ok(Checksum {
            count: column(&row, 0, "count")?,
            hash: column(&row, 1, "hash")?,
        })
    }
}

#[async_trait]
impl SourceStore for MatrixOneStore {
    async fn list_tables(&mut self, database: &str) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .conn
            .exec(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY table_name",
                (database,),
            )
            .await
            .with_context(|| format!("Failed to list tables of {}", database))?;
        Ok(names)
    }

    async fn show_create_table(&mut self, table: &TableRef) -> Result<String> {
        let row = self
            .first_row(&format!("SHOW CREATE TABLE {}", table.qualified()))
            .await?
            .with_context(|| format!("SHOW CREATE TABLE {} returned no row", table))?;
        column(&row, 1, "Create Table")
    }

    async fn snapshot_exists(&mut self, name: &str) -> Result<bool> {
        let row: Option<Row> = self
            .conn
            .exec_first("SELECT sname FROM mo_catalog.mo_snapshots WHERE sname = ?", (name,))
            .await
            .with_context(|| format!("Failed to look up snapshot {}", name))?;
        Ok(row.is_some())
    }

    async fn create_snapshot(&mut self, name: &str, table: &TableRef) -> Result<()> {
        self.run(&format!(
            "CREATE SNAPSHOT {} FOR TABLE {} {}",
            quote_mysql_ident(name),
            quote_mysql_ident(&table.database),
            quote_mysql_ident(&table.table)
        ))
        .await?;
        Ok(())
    }

    async fn drop_snapshot(&mut self, name: &str) -> Result<()> {
        self.run(&format!("DROP SNAPSHOT IF EXISTS {}", quote_mysql_ident(name)))
            .await?;
        Ok(())
    }

    async fn list_snapshots(&mut self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        // `_` is a LIKE wildcard, so the prefix is re-checked exactly below
        let pattern = format!("{}%", prefix);
        let names: Vec<String> = self
            .conn
            .exec(
                "SELECT sname FROM mo_catalog.mo_snapshots WHERE sname LIKE ? ORDER BY ts DESC",
                (pattern,),
            )
            .await
            .context("Failed to list snapshots")?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .take(limit)
            .collect())
    }

    async fn create_empty_like(&mut self, target: &TableRef, like: &TableRef) -> Result<()> {
        self.drop_table(target).await?;
        self.run(&format!(
            "CREATE TABLE {} LIKE {}",
            target.qualified(),
            like.qualified()
        ))
        .await?;
        Ok(())
    }

    async fn clone_at_snapshot(
        &mut self,
        target: &TableRef,
        from: &TableRef,
        snapshot: &str,
    ) -> Result<()> {
        self.drop_table(target).await?;
        self.run(&format!(
            "data branch create table {} from {}{}",
            target.qualified(),
            from.qualified(),
            snapshot_clause(snapshot)
        ))
        .await?;
        Ok(())
    }

    async fn drop_table(&mut self, table: &TableRef) -> Result<()> {
        self.run(&format!("DROP TABLE IF EXISTS {}", table.qualified()))
            .await?;
        Ok(())
    }

    async fn diff(
        &mut self,
        table: &TableRef,
        snapshot: &str,
        base: &TableRef,
        stage: &Stage,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "data branch diff {}{} against {} output file {}",
            table.qualified(),
            snapshot_clause(snapshot),
            base.qualified(),
            quote_mysql_literal(&stage.location())
        );
        let rows = self.rows(&sql).await?;
        rows.iter()
            .map(|row| column::<String>(row, 0, "artifact path"))
            .collect()
    }

    async fn read_artifact(&mut self, path: &str) -> Result<String> {
        let sql = format!(
            "SELECT load_file(CAST({} AS DATALINK))",
            quote_mysql_literal(path)
        );
        let row = self
            .first_row(&sql)
            .await?
            .with_context(|| format!("load_file returned no row for {}", path))?;
        let bytes: Option<Vec<u8>> = column(&row, 0, "artifact content")?;
        let bytes = bytes.with_context(|| format!("Artifact {} is empty or unreadable", path))?;
        String::from_utf8(bytes).with_context(|| format!("Artifact {} is not valid UTF-8", path))
    }

    async fn remove_artifact(&mut self, path: &str) -> Result<()> {
        match path.strip_prefix("file://") {
            Some(local) => tokio::fs::remove_file(local)
                .await
                .with_context(|| format!("Failed to remove artifact {}", path)),
            None => {
                self.run(&remove_statement(path))
                    .await
                    .with_context(|| format!("Failed to remove staged artifact {}", path))?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DestinationStore for MatrixOneStore {
    async fn ensure_database(&mut self, database: &str) -> Result<()> {
        self.run(&format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_mysql_ident(database)
        ))
        .await?;
        Ok(())
    }

    async fn create_table(&mut self, ddl: &str) -> Result<()> {
        self.run(ddl).await?;
        Ok(())
    }

    async fn create_index(&mut self, table: &TableRef, name: &str, columns: &[String]) -> Result<()> {
        let cols: Vec<String> = columns.iter().map(|c| quote_mysql_ident(c)).collect();
        self.run(&format!(
            "CREATE INDEX {} ON {} ({})",
            quote_mysql_ident(name),
            table.qualified(),
            cols.join(", ")
        ))
        .await?;
        Ok(())
    }

    async fn ensure_meta_schema(&mut self) -> Result<()> {
        self.ensure_database(META_DB).await?;
        self.run(&format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\
             task_id VARCHAR(512) NOT NULL, \
             watermark VARCHAR(255) NOT NULL, \
             created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
             PRIMARY KEY (task_id, watermark))",
            META_DB, WATERMARK_TABLE
        ))
        .await?;
        self.run(&format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\
             task_id VARCHAR(512) NOT NULL PRIMARY KEY, \
             lock_owner VARCHAR(255), \
             lock_time TIMESTAMP NULL)",
            META_DB, LEASE_TABLE
        ))
        .await?;
        Ok(())
    }

    async fn acquire_lease(
        &mut self,
        task_id: &str,
        owner: &str,
        timeout_secs: u64,
    ) -> Result<Option<String>> {
        let exists: Option<Row> = self
            .conn
            .exec_first(
                format!("SELECT 1 FROM {}.{} WHERE task_id = ?", META_DB, LEASE_TABLE),
                (task_id,),
            )
            .await
            .context("Failed to read lease row")?;
        if exists.is_none() {
            // Two instances may race here; the loser's duplicate-key error is harmless
            if let Err(e) = self
                .conn
                .exec_drop(
                    format!("INSERT INTO {}.{} (task_id) VALUES (?)", META_DB, LEASE_TABLE),
                    (task_id,),
                )
                .await
            {
                tracing::debug!("Lease row for {} created concurrently: {}", task_id, e);
            }
        }

        let sql = format!(
            "UPDATE {}.{} SET lock_owner = ?, lock_time = NOW() WHERE task_id = ? \
             AND (lock_owner IS NULL OR lock_owner = ? OR lock_time < NOW() - INTERVAL {} SECOND)",
            META_DB, LEASE_TABLE, timeout_secs
        );
        self.conn
            .exec_drop(sql, (owner, task_id, owner))
            .await
            .context("Failed to claim lease")?;

        match self.lease_owner(task_id).await? {
            Some(current) if current == owner => Ok(None),
            Some(current) => Ok(Some(current)),
            None => Ok(Some("<unknown>".to_string())),
        }
    }

    async fn renew_lease(&mut self, task_id: &str, owner: &str) -> Result<bool> {
        self.conn
            .exec_drop(
                format!(
                    "UPDATE {}.{} SET lock_time = NOW() WHERE task_id = ? AND lock_owner = ?",
                    META_DB, LEASE_TABLE
                ),
                (task_id, owner),
            )
            .await
            .context("Failed to renew lease")?;
        Ok(self.lease_owner(task_id).await?.as_deref() == Some(owner))
    }

    async fn release_lease(&mut self, task_id: &str, owner: &str) -> Result<()> {
        self.conn
            .exec_drop(
                format!(
                    "UPDATE {}.{} SET lock_owner = NULL, lock_time = NULL \
                     WHERE task_id = ? AND lock_owner = ?",
                    META_DB, LEASE_TABLE
                ),
                (task_id, owner),
            )
            .await
            .context("Failed to release lease")?;
        Ok(())
    }

    async fn list_watermarks(&mut self, key: &str) -> Result<Vec<Watermark>> {
        let rows: Vec<(String, Option<String>)> = self
            .conn
            .exec(list_watermarks_sql(), (key,))
            .await
            .context("Failed to list watermarks")?;
        Ok(rows
            .into_iter()
            .map(|(token, created_at)| Watermark { token, created_at })
            .collect())
    }

    async fn insert_watermark(&mut self, key: &str, token: &str) -> Result<()> {
        self.conn
            .exec_drop(
                format!(
                    "INSERT INTO {}.{} (task_id, watermark) VALUES (?, ?)",
                    META_DB, WATERMARK_TABLE
                ),
                (key, token),
            )
            .await
            .context("Failed to record watermark")?;
        Ok(())
    }

    async fn delete_watermark(&mut self, key: &str, token: &str) -> Result<()> {
        self.conn
            .exec_drop(
                format!(
                    "DELETE FROM {}.{} WHERE task_id = ? AND watermark = ?",
                    META_DB, WATERMARK_TABLE
                ),
                (key, token),
            )
            .await
            .context("Failed to delete watermark")?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.run("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.run("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run("ROLLBACK").await?;
        Ok(())
    }

    async fn clear_table(&mut self, table: &TableRef) -> Result<u64> {
        self.run(&format!("DELETE FROM {}", table.qualified())).await
    }

    async fn load_artifact(&mut self, path: &str, table: &TableRef) -> Result<u64> {
        let sql = format!(
            "LOAD DATA INFILE {} INTO TABLE {} \
             FIELDS TERMINATED BY ',' OPTIONALLY ENCLOSED BY '\"' ESCAPED BY '\\\\' \
             LINES TERMINATED BY '\\n' PARALLEL 'TRUE'",
            quote_mysql_literal(path),
            table.qualified()
        );
        self.run(&sql).await
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.run(sql).await
    }
}

/// Opens fresh MatrixOne connections for each cycle and for the heartbeat.
#[derive(Clone)]
pub struct MatrixOneConnector {
    source: Endpoint,
    destination: Endpoint,
}

impl MatrixOneConnector {
    pub fn new(source: Endpoint, destination: Endpoint) -> Self {
        Self {
            source,
            destination,
        }
    }
}

#[async_trait]
impl Connector for MatrixOneConnector {
    async fn source(&self) -> Result<Box<dyn SourceStore>> {
        Ok(Box::new(MatrixOneStore::connect(&self.source).await?))
    }

    async fn destination(&self) -> Result<Box<dyn DestinationStore>> {
        Ok(Box::new(MatrixOneStore::connect(&self.destination).await?))
    }
}
