// ABOUTME: Per-cycle status reporting with phase timings and verification results
// ABOUTME: Emits one structured log line per table and serializes to JSON for the CLI

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::error::{ErrorKind, SyncError};
use crate::sql::ChangesetStats;
use crate::verify::{Verdict, VerifyReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncMode {
    Full,
    Incremental,
    Noop,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "FULL",
            SyncMode::Incremental => "INCREMENTAL",
            SyncMode::Noop => "NOOP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Synced,
    Noop,
    /// Stopped before changing anything, e.g. an unverifiable watermark
    Aborted,
    Failed,
}

/// Milliseconds spent in each phase of one table's cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTimings {
    pub bootstrap_ms: u64,
    pub resolve_ms: u64,
    pub diff_ms: u64,
    pub apply_ms: u64,
    pub commit_ms: u64,
    pub cleanup_ms: u64,
    pub verify_ms: u64,
}

/// Measures one phase: `let t = PhaseTimer::start(); ...; timings.diff_ms += t.ms();`
pub struct PhaseTimer(Instant);

impl PhaseTimer {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for ErrorReport {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: format!("{:#}", err),
        }
    }
}

/// Outcome of one table within a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    pub mode: Option<SyncMode>,
    pub snapshot: Option<String>,
    /// The cycle was restarted as FULL after losing its reference point
    pub fallback: bool,
    /// Watermark recovered by archeology during this cycle
    pub recovered: Option<String>,
    pub files: usize,
    pub rows_loaded: u64,
    pub changes: ChangesetStats,
    pub pruned: usize,
    pub timings: PhaseTimings,
    pub verify: Option<VerifyReport>,
    pub error: Option<ErrorReport>,
}

impl TableReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Aborted,
            mode: None,
            snapshot: None,
            fallback: false,
            recovered: None,
            files: 0,
            rows_loaded: 0,
            changes: ChangesetStats::default(),
            pruned: 0,
            timings: PhaseTimings::default(),
            verify: None,
            error: None,
        }
    }

    pub fn fail(&mut self, err: &SyncError) {
        self.status = TableStatus::Failed;
        self.error = Some(ErrorReport::from(err));
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, TableStatus::Synced | TableStatus::Noop)
    }

    pub fn verification_failed(&self) -> bool {
        self.verify
            .as_ref()
            .is_some_and(|v| v.verdict != Verdict::Pass)
    }

    /// Emit the per-table status line.
    pub fn log(&self, task: &str) {
        let mode = self.mode.map(|m| m.as_str()).unwrap_or("-");
        let snapshot = self.snapshot.as_deref().unwrap_or("-");
        let t = &self.timings;

        match (&self.verify, &self.error) {
            (_, Some(error)) => tracing::error!(
                task,
                table = %self.table,
                status = ?self.status,
                mode,
                snapshot,
                error_kind = ?error.kind,
                bootstrap_ms = t.bootstrap_ms,
                resolve_ms = t.resolve_ms,
                diff_ms = t.diff_ms,
                apply_ms = t.apply_ms,
                "sync failed: {}",
                error.message
            ),
            (Some(v), None) => tracing::info!(
                task,
                table = %self.table,
                status = ?self.status,
                mode,
                snapshot,
                fallback = self.fallback,
                statements = self.changes.statements,
                inserts = self.changes.inserts,
                deletes = self.changes.deletes,
                insert_tuples = self.changes.insert_tuples,
                delete_tuples = self.changes.delete_tuples,
                rows_loaded = self.rows_loaded,
                files = self.files,
                bootstrap_ms = t.bootstrap_ms,
                resolve_ms = t.resolve_ms,
                diff_ms = t.diff_ms,
                apply_ms = t.apply_ms,
                commit_ms = t.commit_ms,
                cleanup_ms = t.cleanup_ms,
                verify_ms = t.verify_ms,
                verify = v.verdict.as_str(),
                verify_mode = v.mode.as_str(),
                src_count = v.source.map(|c| c.count),
                dst_count = v.destination.map(|c| c.count),
                src_hash = v.source.and_then(|c| c.hash),
                dst_hash = v.destination.and_then(|c| c.hash),
                "sync status"
            ),
            (None, None) => tracing::info!(
                task,
                table = %self.table,
                status = ?self.status,
                mode,
                snapshot,
                fallback = self.fallback,
                statements = self.changes.statements,
                inserts = self.changes.inserts,
                deletes = self.changes.deletes,
                insert_tuples = self.changes.insert_tuples,
                delete_tuples = self.changes.delete_tuples,
                rows_loaded = self.rows_loaded,
                files = self.files,
                bootstrap_ms = t.bootstrap_ms,
                resolve_ms = t.resolve_ms,
                diff_ms = t.diff_ms,
                apply_ms = t.apply_ms,
                commit_ms = t.commit_ms,
                cleanup_ms = t.cleanup_ms,
                "sync status"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Another instance holds the lease
    Skipped,
    Failed,
}

/// Everything one sync cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub task: String,
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub tables: Vec<TableReport>,
    pub duration_ms: u64,
    pub error: Option<ErrorReport>,
}

impl CycleReport {
    pub fn new(task: &str, owner: &str) -> Self {
        Self {
            task: task.to_string(),
            owner: owner.to_string(),
            started_at: Utc::now(),
            status: CycleStatus::Completed,
            tables: Vec::new(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn fail(&mut self, err: &SyncError) {
        self.status = CycleStatus::Failed;
        self.error = Some(ErrorReport::from(err));
    }

    /// Completed with every table synced or NOOP.
    pub fn succeeded(&self) -> bool {
        self.status == CycleStatus::Completed && self.tables.iter().all(TableReport::succeeded)
    }

    pub fn verification_failed(&self) -> bool {
        self.tables.iter().any(TableReport::verification_failed)
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }
}
