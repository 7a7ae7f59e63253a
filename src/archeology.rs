// ABOUTME: Recovers a lost watermark from surviving source snapshots
// ABOUTME: Candidates must pass a sampled and then a full verification

use anyhow::{Context, Result};

use crate::store::{DestinationStore, SourceStore};
use crate::task::TableTask;
use crate::verify::{Verdict, Verifier, VerifyMode};
use crate::watermark::WatermarkManager;

/// Probes this task's snapshots, newest first, for one the destination matches.
#[derive(Debug, Clone)]
pub struct Archeology {
    max_candidates: usize,
}

impl Archeology {
    pub fn new(max_candidates: usize) -> Self {
        Self { max_candidates }
    }

    /// Try to recover a watermark for a task with no history.
    ///
    /// Only runs when the destination table already holds rows. The first
    /// candidate passing fast and then full verification is recorded and
    /// returned; `None` means the caller should run a FULL sync.
    pub async fn recover(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        verifier: &Verifier,
        watermarks: &WatermarkManager,
        task: &TableTask,
    ) -> Result<Option<String>> {
        if self.max_candidates == 0 {
            return Ok(None);
        }
        if !destination.table_exists(&task.destination).await? {
            return Ok(None);
        }
        let rows = destination
            .row_count(&task.destination)
            .await
            .with_context(|| format!("Failed to count rows of {}", task.destination))?;
        if rows == 0 {
            return Ok(None);
        }

        let candidates: Vec<String> = source
            .list_snapshots(&task.snapshot_prefix(), self.max_candidates)
            .await
            .context("Failed to list candidate snapshots")?
            .into_iter()
            .filter(|name| task.owns_snapshot(name))
            .collect();

        tracing::info!(
            "No watermark for {} but destination holds {} row(s); probing {} snapshot(s)",
            task.key,
            rows,
            candidates.len()
        );

        for candidate in candidates {
            let fast = verifier
                .verify(
                    source,
                    destination,
                    &task.source,
                    &task.destination,
                    Some(&candidate),
                    VerifyMode::Fast,
                )
                .await;
            if fast.verdict != Verdict::Pass {
                tracing::debug!("Candidate {} rejected by fast verify", candidate);
                continue;
            }

            let full = verifier
                .verify(
                    source,
                    destination,
                    &task.source,
                    &task.destination,
                    Some(&candidate),
                    VerifyMode::Full,
                )
                .await;
            if full.verdict != Verdict::Pass {
                tracing::debug!("Candidate {} rejected by full verify", candidate);
                continue;
            }

            watermarks.record(destination, task, &candidate).await?;
            tracing::info!("Recovered watermark {} for {}", candidate, task.key);
            return Ok(Some(candidate));
        }

        tracing::info!("No snapshot matches {}; a FULL sync is required", task.destination);
        Ok(None)
    }
}
