// ABOUTME: Snapshot diff driver producing staged full exports or incremental changesets
// ABOUTME: Reports a lost prior reference point as a typed fallback, not an error

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::store::{SourceStore, Stage, TableRef};
use crate::task::TableTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Row exports of the whole table, bulk-loaded into a cleared destination
    Full,
    /// SQL changesets relative to the prior reference point
    Incremental,
}

/// Artifacts of one diff computation, consumed once by the apply engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffArtifacts {
    pub snapshot: String,
    pub kind: DiffKind,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Staged(DiffArtifacts),
    /// The prior reference point is gone; the cycle should restart as FULL.
    Fallback { reason: String },
}

/// Computes diffs on the source and stages their artifacts.
#[derive(Debug, Clone)]
pub struct DiffDriver {
    stage: Stage,
}

impl DiffDriver {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Pick a fresh, unused reference point name for this table task.
    pub async fn reserve_snapshot(&self, source: &mut dyn SourceStore, task: &TableTask) -> Result<String> {
        for _ in 0..5 {
            let name = task.snapshot_name_at(Utc::now());
            if !source.snapshot_exists(&name).await? {
                return Ok(name);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        anyhow::bail!("Could not find an unused snapshot name for {}", task.source)
    }

    /// Diff the whole table at a new reference point against an empty copy.
    pub async fn full(
        &self,
        source: &mut dyn SourceStore,
        task: &TableTask,
        snapshot: &str,
    ) -> SyncResult<DiffArtifacts> {
        let zero = task.zero_table();
        let result = self.full_inner(source, task, &zero, snapshot).await;
        drop_staging_table(source, &zero).await;

        match result {
            Ok(files) => {
                tracing::info!(
                    "Full diff of {} at {} staged {} file(s) in {}",
                    task.source,
                    snapshot,
                    files.len(),
                    self.stage
                );
                Ok(DiffArtifacts {
                    snapshot: snapshot.to_string(),
                    kind: DiffKind::Full,
                    files,
                })
            }
            Err(e) => {
                drop_snapshot_quietly(source, snapshot).await;
                Err(SyncError::Other(e))
            }
        }
    }

    async fn full_inner(
        &self,
        source: &mut dyn SourceStore,
        task: &TableTask,
        zero: &TableRef,
        snapshot: &str,
    ) -> Result<Vec<String>> {
        source
            .create_empty_like(zero, &task.source)
            .await
            .with_context(|| format!("Failed to create empty base table {}", zero))?;
        source
            .create_snapshot(snapshot, &task.source)
            .await
            .with_context(|| format!("Failed to create snapshot {}", snapshot))?;
        source
            .diff(&task.source, snapshot, zero, &self.stage)
            .await
            .with_context(|| format!("Full diff of {} at {} failed", task.source, snapshot))
    }

    /// Diff a new reference point against the prior one.
    ///
    /// When the prior reference point has disappeared (before or during the
    /// computation) the result is [`DiffOutcome::Fallback`].
    pub async fn incremental(
        &self,
        source: &mut dyn SourceStore,
        task: &TableTask,
        prior: &str,
        snapshot: &str,
    ) -> SyncResult<DiffOutcome> {
        let lost = || DiffOutcome::Fallback {
            reason: format!("reference point {} no longer exists", prior),
        };

        if !source
            .snapshot_exists(prior)
            .await
            .context("Failed to look up prior snapshot")?
        {
            return Ok(lost());
        }

        let prev = task.prev_table();
        let result = self.incremental_inner(source, task, &prev, prior, snapshot).await;
        drop_staging_table(source, &prev).await;

        match result {
            Ok(files) => {
                tracing::info!(
                    "Incremental diff of {} ({} -> {}) staged {} file(s)",
                    task.source,
                    prior,
                    snapshot,
                    files.len()
                );
                Ok(DiffOutcome::Staged(DiffArtifacts {
                    snapshot: snapshot.to_string(),
                    kind: DiffKind::Incremental,
                    files,
                }))
            }
            Err(e) => {
                drop_snapshot_quietly(source, snapshot).await;
                match source.snapshot_exists(prior).await {
                    Ok(false) => {
                        tracing::warn!("Prior snapshot {} vanished during diff: {:#}", prior, e);
                        Ok(lost())
                    }
                    _ => Err(SyncError::Other(e)),
                }
            }
        }
    }

    async fn incremental_inner(
        &self,
        source: &mut dyn SourceStore,
        task: &TableTask,
        prev: &TableRef,
        prior: &str,
        snapshot: &str,
    ) -> Result<Vec<String>> {
        source
            .clone_at_snapshot(prev, &task.source, prior)
            .await
            .with_context(|| format!("Failed to materialize {} at {}", task.source, prior))?;
        source
            .create_snapshot(snapshot, &task.source)
            .await
            .with_context(|| format!("Failed to create snapshot {}", snapshot))?;
        source
            .diff(&task.source, snapshot, prev, &self.stage)
            .await
            .with_context(|| format!("Incremental diff of {} against {} failed", task.source, prior))
    }
}

async fn drop_staging_table(source: &mut dyn SourceStore, table: &TableRef) {
    if let Err(e) = source.drop_table(table).await {
        tracing::warn!("Failed to drop staging table {}: {:#}", table, e);
    }
}

/// Best-effort reference point removal.
pub async fn drop_snapshot_quietly(source: &mut dyn SourceStore, snapshot: &str) {
    if let Err(e) = source.drop_snapshot(snapshot).await {
        tracing::warn!("Failed to drop snapshot {}: {:#}", snapshot, e);
    }
}

/// Best-effort removal of consumed artifacts.
pub async fn remove_artifacts(source: &mut dyn SourceStore, files: &[String]) {
    for file in files {
        if let Err(e) = source.remove_artifact(file).await {
            tracing::warn!("Failed to remove artifact {}: {:#}", file, e);
        }
    }
}
