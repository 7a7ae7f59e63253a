// ABOUTME: Destination schema bootstrap from source DDL plus synthetic indexing
// ABOUTME: Keyless tables get an index chosen by a pluggable strategy

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::sql::lexer::{tokenize, Token, TokenKind};
use crate::store::{ColumnInfo, DestinationStore, SourceStore, TableRef};
use crate::task::TableTask;

/// Name of the index created on keyless destination tables.
pub const SYNTHETIC_INDEX: &str = "idx_branch_sync";

/// Picks the columns of a synthetic index for a keyless table.
#[async_trait]
pub trait IndexStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Columns to index, in order; empty means no index.
    async fn choose_columns(
        &self,
        source: &mut dyn SourceStore,
        table: &TableRef,
        columns: &[ColumnInfo],
    ) -> Result<Vec<String>>;
}

/// Ranks integer columns by `distinct / total` and indexes the top two.
///
/// Each candidate costs a `COUNT(DISTINCT ...)` scan of the source table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectivityIndex;

#[async_trait]
impl IndexStrategy for SelectivityIndex {
    fn name(&self) -> &'static str {
        "selectivity"
    }

    async fn choose_columns(
        &self,
        source: &mut dyn SourceStore,
        table: &TableRef,
        columns: &[ColumnInfo],
    ) -> Result<Vec<String>> {
        let mut ranked: Vec<(String, f64)> = Vec::new();
        for column in columns.iter().filter(|c| c.is_integer()) {
            let (distinct, total) = source
                .column_cardinality(table, &column.name)
                .await
                .with_context(|| format!("Failed to sample selectivity of {}.{}", table, column.name))?;
            let selectivity = if total == 0 {
                0.0
            } else {
                distinct as f64 / total as f64
            };
            tracing::debug!(
                "Selectivity of {}.{}: {}/{} = {:.4}",
                table,
                column.name,
                distinct,
                total,
                selectivity
            );
            ranked.push((column.name.clone(), selectivity));
        }

        // Stable sort keeps declaration order among equal selectivities
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked.into_iter().take(2).map(|(name, _)| name).collect())
    }
}

/// Never creates an index.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndex;

#[async_trait]
impl IndexStrategy for NoIndex {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn choose_columns(
        &self,
        _source: &mut dyn SourceStore,
        _table: &TableRef,
        _columns: &[ColumnInfo],
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// What bootstrapping changed on the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub created: bool,
    pub index: Option<Vec<String>>,
}

/// Creates destination tables and synthetic indexes.
pub struct Bootstrapper {
    strategy: Box<dyn IndexStrategy>,
}

impl Bootstrapper {
    pub fn new(strategy: Box<dyn IndexStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        if settings.auto_index {
            Self::new(Box::new(SelectivityIndex))
        } else {
            Self::new(Box::new(NoIndex))
        }
    }

    /// Make sure the destination database and table exist, then index the
    /// table if it has neither a primary key nor a secondary index.
    pub async fn ensure_table(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
    ) -> SyncResult<BootstrapOutcome> {
        let schema_err = |source: anyhow::Error| SyncError::Schema {
            table: task.destination.to_string(),
            source,
        };

        destination
            .ensure_database(&task.destination.database)
            .await
            .map_err(schema_err)?;

        let mut outcome = BootstrapOutcome::default();
        if !destination
            .table_exists(&task.destination)
            .await
            .map_err(schema_err)?
        {
            let ddl = source
                .show_create_table(&task.source)
                .await
                .map_err(schema_err)?;
            let ddl = substitute_table_name(&ddl, &task.destination.qualified())
                .map_err(schema_err)?;
            destination.create_table(&ddl).await.map_err(schema_err)?;
            tracing::info!("Created destination table {} from {}", task.destination, task.source);
            outcome.created = true;
        }

        match self.ensure_index(source, destination, task).await {
            Ok(index) => outcome.index = index,
            Err(e) => tracing::warn!(
                "Skipping synthetic index on {}: {:#}",
                task.destination,
                e
            ),
        }
        Ok(outcome)
    }

    async fn ensure_index(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
    ) -> Result<Option<Vec<String>>> {
        let columns = destination.columns(&task.destination).await?;
        if columns.iter().any(|c| c.primary_key) {
            return Ok(None);
        }
        let indexes = destination.indexes(&task.destination).await?;
        if indexes.iter().any(|i| !i.primary) {
            return Ok(None);
        }

        let source_columns = source.columns(&task.source).await?;
        let chosen = self
            .strategy
            .choose_columns(source, &task.source, &source_columns)
            .await?;
        if chosen.is_empty() {
            tracing::debug!(
                "No index candidates for keyless table {} (strategy {})",
                task.destination,
                self.strategy.name()
            );
            return Ok(None);
        }

        destination
            .create_index(&task.destination, SYNTHETIC_INDEX, &chosen)
            .await?;
        tracing::info!(
            "Created index {} on keyless table {} ({})",
            SYNTHETIC_INDEX,
            task.destination,
            chosen.join(", ")
        );
        Ok(Some(chosen))
    }
}

/// Replace the table name in a `CREATE TABLE` statement with `target`.
///
/// Only the identifier right after `CREATE [TEMPORARY] TABLE [IF NOT EXISTS]`
/// changes; column names, comments and literals are untouched.
pub fn substitute_table_name(ddl: &str, target: &str) -> Result<String> {
    let tokens: Vec<Token> = tokenize(ddl)
        .context("Source DDL could not be tokenized")?
        .into_iter()
        .filter(|t| !t.is_trivia())
        .collect();

    let mut idx = 0;
    let mut expect = |kw: &str, optional: bool| -> Result<bool> {
        match tokens.get(idx) {
            Some(t) if t.is_keyword(ddl, kw) => {
                idx += 1;
                Ok(true)
            }
            _ if optional => Ok(false),
            _ => anyhow::bail!("Source DDL does not start with CREATE TABLE"),
        }
    };
    expect("CREATE", false)?;
    expect("TEMPORARY", true)?;
    expect("TABLE", false)?;
    if expect("IF", true)? {
        expect("NOT", false)?;
        expect("EXISTS", false)?;
    }

    let is_name = |t: &Token| matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent);
    let first = tokens
        .get(idx)
        .filter(|t| is_name(t))
        .context("Source DDL has no table name")?;
    let mut end = first.end;
    if let (Some(dot), Some(name)) = (tokens.get(idx + 1), tokens.get(idx + 2)) {
        if dot.is_punct(ddl, b'.') && is_name(name) {
            end = name.end;
        }
    }
    Ok(format!("{}{}{}", &ddl[..first.start], target, &ddl[end..]))
}
