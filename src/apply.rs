// ABOUTME: Apply engine loading full exports or replaying changesets transactionally
// ABOUTME: Leaves the destination transaction open so the watermark commits with the data

use anyhow::{Context, Result};

use crate::diff::{DiffArtifacts, DiffKind};
use crate::error::{SyncError, SyncResult};
use crate::sql::{prepare_changeset, ChangeStatement, ChangesetStats};
use crate::store::{DestinationStore, SourceStore};
use crate::task::TableTask;

/// Work done by one apply; counts are for observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub files: usize,
    pub rows_cleared: u64,
    pub rows_loaded: u64,
    pub changes: ChangesetStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Changes are applied inside an open destination transaction that the
    /// caller must commit or roll back.
    Applied(ApplyStats),
    /// The incremental changeset was empty; nothing is pending.
    Noop,
}

/// Applies staged diff artifacts to the destination table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyEngine;

impl ApplyEngine {
    pub fn new() -> Self {
        Self
    }

    pub async fn apply(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        artifacts: &DiffArtifacts,
    ) -> SyncResult<ApplyOutcome> {
        match artifacts.kind {
            DiffKind::Full => self.apply_full(destination, task, artifacts).await,
            DiffKind::Incremental => self.apply_incremental(source, destination, task, artifacts).await,
        }
    }

    /// Clear the destination and bulk-load every export in one transaction.
    async fn apply_full(
        &self,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        artifacts: &DiffArtifacts,
    ) -> SyncResult<ApplyOutcome> {
        let apply_err = |source: anyhow::Error| SyncError::Apply {
            table: task.destination.to_string(),
            source,
        };

        destination.begin().await.map_err(apply_err)?;

        let mut stats = ApplyStats {
            files: artifacts.files.len(),
            ..Default::default()
        };
        let loaded: Result<()> = async {
            stats.rows_cleared = destination
                .clear_table(&task.destination)
                .await
                .with_context(|| format!("Failed to clear {}", task.destination))?;
            for file in &artifacts.files {
                stats.rows_loaded += destination
                    .load_artifact(file, &task.destination)
                    .await
                    .with_context(|| format!("Failed to load {}", file))?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = loaded {
            rollback_quietly(destination).await;
            return Err(apply_err(e));
        }

        tracing::info!(
            "Loaded {} row(s) from {} file(s) into {} (replacing {} row(s))",
            stats.rows_loaded,
            stats.files,
            task.destination,
            stats.rows_cleared
        );
        Ok(ApplyOutcome::Applied(stats))
    }

    /// Replay changesets in one transaction; an empty changeset is a NOOP.
    async fn apply_incremental(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        artifacts: &DiffArtifacts,
    ) -> SyncResult<ApplyOutcome> {
        let target = task.destination.qualified();

        // Read and split everything up front so a malformed artifact never
        // leaves a partially replayed changeset behind.
        let mut statements: Vec<ChangeStatement> = Vec::new();
        for file in &artifacts.files {
            let text = source.read_artifact(file).await.map_err(|source| SyncError::Apply {
                table: task.destination.to_string(),
                source: source.context(format!("Failed to read changeset {}", file)),
            })?;
            let prepared = prepare_changeset(&text, &target).map_err(|source| SyncError::Lex {
                artifact: file.clone(),
                source,
            })?;
            statements.extend(prepared);
        }

        if statements.is_empty() {
            tracing::info!("Changeset for {} is empty (NOOP)", task.destination);
            return Ok(ApplyOutcome::Noop);
        }

        let apply_err = |source: anyhow::Error| SyncError::Apply {
            table: task.destination.to_string(),
            source,
        };
        destination.begin().await.map_err(apply_err)?;

        let mut stats = ApplyStats {
            files: artifacts.files.len(),
            ..Default::default()
        };
        for stmt in &statements {
            if let Err(e) = destination.execute(&stmt.sql).await {
                rollback_quietly(destination).await;
                return Err(apply_err(e.context(format!(
                    "Changeset statement {} of {} failed",
                    stats.changes.statements + 1,
                    statements.len()
                ))));
            }
            stats.changes.record(stmt);
        }

        tracing::info!(
            "Replayed {} statement(s) into {}: {} insert(s) covering {} tuple(s), {} delete(s) covering {} tuple(s)",
            stats.changes.statements,
            task.destination,
            stats.changes.inserts,
            stats.changes.insert_tuples,
            stats.changes.deletes,
            stats.changes.delete_tuples
        );
        Ok(ApplyOutcome::Applied(stats))
    }
}

/// Roll back, logging rather than propagating a failure to do so.
pub async fn rollback_quietly(destination: &mut dyn DestinationStore) {
    if let Err(e) = destination.rollback().await {
        tracing::warn!("Rollback on {} failed: {:#}", destination.endpoint(), e);
    }
}
