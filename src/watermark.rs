// ABOUTME: Watermark state machine deciding between FULL and INCREMENTAL sync
// ABOUTME: Validates the newest checkpoint, records new ones and prunes old ones

use anyhow::{Context, Result};

use crate::diff::drop_snapshot_quietly;
use crate::error::SyncResult;
use crate::store::{DestinationStore, SourceStore, Watermark};
use crate::task::TableTask;
use crate::verify::{Verdict, Verifier, VerifyMode};

/// What is known about the newest watermark of a table task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkState {
    None,
    /// Reference point exists and the destination matched it
    Valid(String),
    /// Reference point no longer exists on the source
    Stale(String),
    /// Reference point exists but has not been checked against the destination
    Unconfirmed(String),
}

/// How the current cycle should proceed for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Diff against this watermark.
    Resume { prior: String },
    /// Start over with a full export.
    Full { reason: String },
    /// No watermark on record; archeology may recover one.
    Missing,
    /// The watermark could not be checked; skip this cycle without changes.
    Abort { reason: String },
}

/// Loads, validates, records and prunes watermarks.
#[derive(Debug, Clone)]
pub struct WatermarkManager {
    max_watermarks: usize,
    verify_on_resume: bool,
}

impl WatermarkManager {
    pub fn new(max_watermarks: usize, verify_on_resume: bool) -> Self {
        Self {
            max_watermarks: max_watermarks.max(1),
            verify_on_resume,
        }
    }

    /// Newest watermark on record, if any.
    pub async fn newest(
        &self,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
    ) -> Result<Option<Watermark>> {
        Ok(destination
            .list_watermarks(&task.key)
            .await
            .with_context(|| format!("Failed to load watermarks for {}", task.key))?
            .into_iter()
            .next())
    }

    /// Classify the newest watermark without verifying it.
    pub async fn inspect(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
    ) -> Result<WatermarkState> {
        let Some(newest) = self.newest(destination, task).await? else {
            return Ok(WatermarkState::None);
        };
        let exists = source
            .snapshot_exists(&newest.token)
            .await
            .with_context(|| format!("Failed to look up snapshot {}", newest.token))?;
        Ok(if exists {
            WatermarkState::Unconfirmed(newest.token)
        } else {
            WatermarkState::Stale(newest.token)
        })
    }

    /// Walk the state machine from the newest watermark to a resolution.
    pub async fn resolve(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        verifier: &Verifier,
        task: &TableTask,
    ) -> SyncResult<Resolution> {
        let mut state = self.inspect(source, destination, task).await?;

        loop {
            state = match state {
                WatermarkState::None => return Ok(Resolution::Missing),
                WatermarkState::Valid(token) => return Ok(Resolution::Resume { prior: token }),
                WatermarkState::Stale(token) => {
                    tracing::warn!(
                        "Watermark {} for {} lost its snapshot; falling back to FULL",
                        token,
                        task.key
                    );
                    self.discard(destination, task, &token).await?;
                    return Ok(Resolution::Full {
                        reason: format!("snapshot {} no longer exists", token),
                    });
                }
                WatermarkState::Unconfirmed(token) if !self.verify_on_resume => {
                    WatermarkState::Valid(token)
                }
                WatermarkState::Unconfirmed(token) => {
                    let report = verifier
                        .verify(
                            source,
                            destination,
                            &task.source,
                            &task.destination,
                            Some(&token),
                            VerifyMode::Fast,
                        )
                        .await;
                    match report.verdict {
                        Verdict::Pass => WatermarkState::Valid(token),
                        Verdict::Fail => {
                            tracing::warn!(
                                "Destination {} does not match watermark {}; falling back to FULL",
                                task.destination,
                                token
                            );
                            self.discard(destination, task, &token).await?;
                            drop_snapshot_quietly(source, &token).await;
                            return Ok(Resolution::Full {
                                reason: format!("watermark {} failed verification", token),
                            });
                        }
                        Verdict::Indeterminate => {
                            return Ok(Resolution::Abort {
                                reason: format!(
                                    "watermark {} could not be verified: {}",
                                    token,
                                    report.detail.unwrap_or_default()
                                ),
                            })
                        }
                    }
                }
            };
        }
    }

    /// Record a watermark; runs inside the caller's transaction when one is open.
    pub async fn record(
        &self,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        token: &str,
    ) -> Result<()> {
        destination
            .insert_watermark(&task.key, token)
            .await
            .with_context(|| format!("Failed to record watermark {} for {}", token, task.key))
    }

    pub async fn discard(
        &self,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        token: &str,
    ) -> Result<()> {
        destination
            .delete_watermark(&task.key, token)
            .await
            .with_context(|| format!("Failed to discard watermark {} for {}", token, task.key))
    }

    /// Keep only the newest `max_watermarks`; older ones lose their meta row
    /// and, best-effort, their snapshot. Returns the pruned tokens.
    pub async fn prune(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
    ) -> Result<Vec<String>> {
        let all = destination.list_watermarks(&task.key).await?;
        let mut pruned = Vec::new();
        for old in all.into_iter().skip(self.max_watermarks) {
            self.discard(destination, task, &old.token).await?;
            drop_snapshot_quietly(source, &old.token).await;
            pruned.push(old.token);
        }
        if !pruned.is_empty() {
            tracing::debug!("Pruned {} watermark(s) for {}", pruned.len(), task.key);
        }
        Ok(pruned)
    }
}
