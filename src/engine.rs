// ABOUTME: SyncEngine orchestrating lease, bootstrap, watermark, diff, apply and commit
// ABOUTME: Runs cycles on an interval with scheduled verification until shutdown

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::apply::{rollback_quietly, ApplyEngine, ApplyOutcome};
use crate::archeology::Archeology;
use crate::bootstrap::{Bootstrapper, IndexStrategy};
use crate::config::{Scope, SyncConfig};
use crate::diff::{drop_snapshot_quietly, remove_artifacts, DiffArtifacts, DiffDriver, DiffKind, DiffOutcome};
use crate::error::{SyncError, SyncResult};
use crate::lease::LeaseManager;
use crate::report::{CycleReport, CycleStatus, PhaseTimer, SyncMode, TableReport, TableStatus};
use crate::store::{Connector, DestinationStore, SourceStore};
use crate::task::{is_staging_table, TableTask, TaskKey};
use crate::utils::{instance_id, retry_with_fixed_delay, sanitize_identifier};
use crate::verify::{Verifier, VerifyMode, VerifyOptions, VerifyReport};
use crate::watermark::{Resolution, WatermarkManager};

const CONNECT_RETRIES: u32 = 2;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Drives sync cycles for one configured task.
///
/// Each cycle runs the phases ACQUIRE_LOCK, BOOTSTRAP, RESOLVE_WATERMARK,
/// DIFF, APPLY, COMMIT and CLEANUP for every table of the task. A reference
/// point lost during DIFF restarts that table once as FULL. Failures end the
/// cycle (or the table) and are reported; [`SyncEngine::run`] keeps going.
pub struct SyncEngine {
    config: SyncConfig,
    key: TaskKey,
    instance_id: String,
    connector: Arc<dyn Connector>,
    lease: LeaseManager,
    bootstrapper: Bootstrapper,
    verifier: Verifier,
    watermarks: WatermarkManager,
    archeology: Archeology,
    diff: DiffDriver,
    apply: ApplyEngine,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let stage = config.stage()?;
        let key = TaskKey::derive(&config);
        let instance_id = instance_id();
        let settings = &config.sync;

        Ok(Self {
            lease: LeaseManager::new(
                key.id(),
                &instance_id,
                settings.lock_timeout(),
                settings.heartbeat(),
            ),
            bootstrapper: Bootstrapper::from_settings(settings),
            verifier: Verifier::new(VerifyOptions::from(settings)),
            watermarks: WatermarkManager::new(
                settings.max_watermarks,
                settings.verify_watermark_on_resume,
            ),
            archeology: Archeology::new(settings.archeology_candidates),
            diff: DiffDriver::new(stage),
            apply: ApplyEngine::new(),
            key,
            instance_id,
            connector,
            config,
        })
    }

    /// Use a fixed lease owner identity instead of the generated one.
    pub fn with_instance_id(mut self, id: &str) -> Self {
        self.instance_id = id.to_string();
        self.lease = LeaseManager::new(
            self.key.id(),
            id,
            self.config.sync.lock_timeout(),
            self.config.sync.heartbeat(),
        );
        self
    }

    pub fn with_index_strategy(mut self, strategy: Box<dyn IndexStrategy>) -> Self {
        self.bootstrapper = Bootstrapper::new(strategy);
        self
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.key
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Verification due after the `nth` successful cycle, if any.
    pub fn scheduled_verify(&self, nth: u64) -> Option<VerifyMode> {
        let every_full = self.config.sync.verify_interval;
        let every_fast = self.config.sync.fast_verify_every;
        if every_full > 0 && nth % every_full == 0 {
            Some(VerifyMode::Full)
        } else if every_fast > 0 && nth % every_fast == 0 {
            Some(VerifyMode::Fast)
        } else {
            None
        }
    }

    async fn connect_source(&self) -> SyncResult<Box<dyn SourceStore>> {
        retry_with_fixed_delay(|| self.connector.source(), CONNECT_RETRIES, CONNECT_RETRY_DELAY)
            .await
            .map_err(|source| SyncError::Connection {
                endpoint: self.config.source.to_string(),
                source,
            })
    }

    async fn connect_destination(&self) -> SyncResult<Box<dyn DestinationStore>> {
        retry_with_fixed_delay(
            || self.connector.destination(),
            CONNECT_RETRIES,
            CONNECT_RETRY_DELAY,
        )
        .await
        .map_err(|source| SyncError::Connection {
            endpoint: self.config.destination.to_string(),
            source,
        })
    }

    /// Source/destination table pairs covered by this task.
    async fn table_tasks(&self, source: &mut dyn SourceStore) -> SyncResult<Vec<TableTask>> {
        let src = &self.config.source;
        let dst = &self.config.destination;
        match self.key.scope() {
            Scope::Table => {
                let src_table = src.table.as_deref().context("source table is not configured")?;
                let dst_table = dst.table.as_deref().context("destination table is not configured")?;
                Ok(vec![self
                    .key
                    .for_table(src.table_ref(src_table), dst.table_ref(dst_table))])
            }
            Scope::Database => {
                let tables = source
                    .list_tables(&src.database)
                    .await
                    .map_err(|source| SyncError::Schema {
                        table: src.database.clone(),
                        source,
                    })?;
                Ok(tables
                    .iter()
                    .filter(|t| !is_staging_table(t))
                    .map(|t| self.key.for_table(src.table_ref(t), dst.table_ref(t)))
                    .collect())
            }
        }
    }

    /// Run one cycle, optionally followed by verification of every synced table.
    ///
    /// Never returns an error: failures are recorded in the report.
    pub async fn run_cycle(&self, verify: Option<VerifyMode>) -> CycleReport {
        let timer = PhaseTimer::start();
        let mut report = CycleReport::new(self.key.id(), &self.instance_id);

        if let Err(e) = self.cycle(&mut report, verify).await {
            match &e {
                SyncError::LockHeld { owner, .. } => {
                    tracing::info!(
                        "Task {} is locked by {}; skipping this cycle",
                        self.key,
                        sanitize_identifier(owner)
                    );
                    report.status = CycleStatus::Skipped;
                }
                _ => {
                    tracing::error!("Sync cycle for {} failed: {:#}", self.key, e);
                    report.fail(&e);
                }
            }
        }

        report.duration_ms = timer.ms();
        report
    }

    async fn cycle(&self, report: &mut CycleReport, verify: Option<VerifyMode>) -> SyncResult<()> {
        // ACQUIRE_LOCK
        let mut destination = self.connect_destination().await?;
        destination
            .ensure_meta_schema()
            .await
            .map_err(|source| SyncError::Schema {
                table: "meta schema".to_string(),
                source,
            })?;
        self.lease.acquire(destination.as_mut()).await?;

        let heartbeat = self.lease.start_heartbeat(self.connector.clone());
        let result = self.locked_cycle(destination.as_mut(), report, verify).await;
        heartbeat.stop().await;
        self.lease.release(destination.as_mut()).await;
        result
    }

    async fn locked_cycle(
        &self,
        destination: &mut dyn DestinationStore,
        report: &mut CycleReport,
        verify: Option<VerifyMode>,
    ) -> SyncResult<()> {
        let mut source = self.connect_source().await?;
        let tasks = self.table_tasks(source.as_mut()).await?;
        if tasks.is_empty() {
            tracing::warn!("Task {} has no tables to sync", self.key);
        }

        for task in &tasks {
            let table_report = self
                .sync_table(source.as_mut(), destination, task, verify)
                .await;
            table_report.log(self.key.id());
            report.tables.push(table_report);
        }
        Ok(())
    }

    async fn sync_table(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        verify: Option<VerifyMode>,
    ) -> TableReport {
        let mut report = TableReport::new(&task.destination.to_string());

        if let Err(e) = self.sync_table_phases(source, destination, task, &mut report).await {
            report.fail(&e);
            return report;
        }

        if let (Some(mode), true) = (verify, report.succeeded()) {
            let timer = PhaseTimer::start();
            let result = self
                .verifier
                .verify(
                    source,
                    destination,
                    &task.source,
                    &task.destination,
                    report.snapshot.as_deref(),
                    mode,
                )
                .await;
            if let Some(mismatch) = result.mismatch() {
                tracing::error!("{}", mismatch);
            }
            report.verify = Some(result);
            report.timings.verify_ms = timer.ms();
        }
        report
    }

    async fn sync_table_phases(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        report: &mut TableReport,
    ) -> SyncResult<()> {
        // BOOTSTRAP
        let timer = PhaseTimer::start();
        self.bootstrapper.ensure_table(source, destination, task).await?;
        if !self.verifier.options().fast_columns.is_empty() {
            source
                .columns(&task.source)
                .await
                .and_then(|columns| self.verifier.check_fast_columns(&task.source, &columns))
                .map_err(|source| SyncError::Schema {
                    table: task.source.to_string(),
                    source,
                })?;
        }
        report.timings.bootstrap_ms = timer.ms();

        let mut force_full = false;
        loop {
            // RESOLVE_WATERMARK
            let timer = PhaseTimer::start();
            let resolution = if force_full {
                Resolution::Full {
                    reason: "reference point lost during diff".to_string(),
                }
            } else {
                self.watermarks
                    .resolve(source, destination, &self.verifier, task)
                    .await?
            };
            let prior = match resolution {
                Resolution::Resume { prior } => Some(prior),
                Resolution::Full { reason } => {
                    tracing::info!("FULL sync of {} -> {}: {}", task.source, task.destination, reason);
                    None
                }
                Resolution::Missing => {
                    let recovered = self
                        .archeology
                        .recover(source, destination, &self.verifier, &self.watermarks, task)
                        .await?;
                    report.recovered = recovered.clone();
                    if recovered.is_none() {
                        tracing::info!(
                            "FULL sync of {} -> {}: no watermark on record",
                            task.source,
                            task.destination
                        );
                    }
                    recovered
                }
                Resolution::Abort { reason } => {
                    tracing::warn!("Skipping {} this cycle: {}", task.destination, reason);
                    report.timings.resolve_ms += timer.ms();
                    report.status = TableStatus::Aborted;
                    return Ok(());
                }
            };
            report.timings.resolve_ms += timer.ms();

            // DIFF
            let timer = PhaseTimer::start();
            let snapshot = self.diff.reserve_snapshot(source, task).await?;
            let artifacts = match &prior {
                None => self.diff.full(source, task, &snapshot).await?,
                Some(prior) => match self.diff.incremental(source, task, prior, &snapshot).await? {
                    DiffOutcome::Staged(artifacts) => artifacts,
                    DiffOutcome::Fallback { reason } => {
                        report.timings.diff_ms += timer.ms();
                        if report.fallback {
                            return Err(SyncError::ReferenceLost {
                                snapshot: prior.clone(),
                            });
                        }
                        tracing::warn!("{}; restarting {} as FULL", reason, task.destination);
                        self.watermarks.discard(destination, task, prior).await?;
                        report.fallback = true;
                        force_full = true;
                        continue;
                    }
                },
            };
            report.timings.diff_ms += timer.ms();
            report.files = artifacts.files.len();

            // APPLY + COMMIT
            let result = self
                .apply_and_commit(source, destination, task, &artifacts, prior.as_deref(), report)
                .await;

            // CLEANUP
            let timer = PhaseTimer::start();
            remove_artifacts(source, &artifacts.files).await;
            match self.watermarks.prune(source, destination, task).await {
                Ok(pruned) => report.pruned = pruned.len(),
                Err(e) => tracing::warn!("Failed to prune watermarks for {}: {:#}", task.key, e),
            }
            report.timings.cleanup_ms = timer.ms();
            return result;
        }
    }

    async fn apply_and_commit(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        artifacts: &DiffArtifacts,
        prior: Option<&str>,
        report: &mut TableReport,
    ) -> SyncResult<()> {
        let timer = PhaseTimer::start();
        let outcome = self.apply.apply(source, destination, task, artifacts).await;
        report.timings.apply_ms = timer.ms();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                drop_snapshot_quietly(source, &artifacts.snapshot).await;
                return Err(e);
            }
        };

        // COMMIT
        let timer = PhaseTimer::start();
        match outcome {
            ApplyOutcome::Noop => {
                report.mode = Some(SyncMode::Noop);
                if self.config.sync.advance_watermark_on_noop {
                    if let Err(e) = destination.begin().await {
                        drop_snapshot_quietly(source, &artifacts.snapshot).await;
                        return Err(self.commit_error(task, e));
                    }
                    self.commit_watermark(source, destination, task, &artifacts.snapshot)
                        .await?;
                    report.snapshot = Some(artifacts.snapshot.clone());
                } else {
                    drop_snapshot_quietly(source, &artifacts.snapshot).await;
                    report.snapshot = prior.map(str::to_string);
                }
                report.status = TableStatus::Noop;
            }
            ApplyOutcome::Applied(stats) => {
                report.mode = Some(match artifacts.kind {
                    DiffKind::Full => SyncMode::Full,
                    DiffKind::Incremental => SyncMode::Incremental,
                });
                report.rows_loaded = stats.rows_loaded;
                report.changes = stats.changes;
                self.commit_watermark(source, destination, task, &artifacts.snapshot)
                    .await?;
                report.snapshot = Some(artifacts.snapshot.clone());
                report.status = TableStatus::Synced;
            }
        }
        report.timings.commit_ms = timer.ms();
        Ok(())
    }

    /// Record the watermark inside the open transaction and commit both together.
    async fn commit_watermark(
        &self,
        source: &mut dyn SourceStore,
        destination: &mut dyn DestinationStore,
        task: &TableTask,
        snapshot: &str,
    ) -> SyncResult<()> {
        let committed = match self.watermarks.record(destination, task, snapshot).await {
            Ok(()) => destination.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            rollback_quietly(destination).await;
            drop_snapshot_quietly(source, snapshot).await;
            return Err(self.commit_error(task, e));
        }
        Ok(())
    }

    fn commit_error(&self, task: &TableTask, source: anyhow::Error) -> SyncError {
        SyncError::Apply {
            table: task.destination.to_string(),
            source: source.context("Failed to commit watermark"),
        }
    }

    /// Compare every table with the source at its newest watermark (or live
    /// when there is none).
    pub async fn verify(&self, mode: VerifyMode) -> SyncResult<Vec<VerifyReport>> {
        let mut destination = self.connect_destination().await?;
        let mut source = self.connect_source().await?;
        let tasks = self.table_tasks(source.as_mut()).await?;

        let mut reports = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let snapshot = match self.watermarks.newest(destination.as_mut(), task).await {
                Ok(Some(watermark)) => match source.snapshot_exists(&watermark.token).await {
                    Ok(exists) => exists.then_some(watermark.token),
                    Err(e) => {
                        tracing::warn!(
                            "Could not look up snapshot {} for {}: {:#}",
                            watermark.token,
                            task.key,
                            e
                        );
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    tracing::debug!("No watermark history for {}: {:#}", task.key, e);
                    None
                }
            };
            if snapshot.is_none() {
                tracing::info!("Verifying {} against the live source table", task.destination);
            }
            let report = self
                .verifier
                .verify(
                    source.as_mut(),
                    destination.as_mut(),
                    &task.source,
                    &task.destination,
                    snapshot.as_deref(),
                    mode,
                )
                .await;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Run cycles on the configured interval until a shutdown signal arrives.
    ///
    /// Shutdown is observed between cycles; a running cycle always completes.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.config.sync.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cycles = 0u64;
        let mut successful = 0u64;

        tracing::info!(
            "Starting sync engine for task {} as {} (interval {:?}, scope {})",
            self.key,
            self.instance_id,
            self.config.sync.interval(),
            self.key.scope().as_str()
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping sync engine");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    let verify = self.scheduled_verify(successful + 1);
                    tracing::debug!("Starting sync cycle {} (verify: {:?})", cycles, verify);

                    let report = self.run_cycle(verify).await;
                    if report.succeeded() {
                        successful += 1;
                    }
                    match report.status {
                        CycleStatus::Completed => tracing::info!(
                            "Sync cycle {} completed: {} table(s) in {}ms",
                            cycles,
                            report.tables.len(),
                            report.duration_ms
                        ),
                        CycleStatus::Skipped => tracing::debug!("Sync cycle {} skipped", cycles),
                        CycleStatus::Failed => tracing::warn!(
                            "Sync cycle {} failed; retrying in {:?}",
                            cycles,
                            self.config.sync.interval()
                        ),
                    }
                    if report.verification_failed() {
                        tracing::error!("Sync cycle {} finished with a verification failure", cycles);
                    }
                }
            }
        }

        Ok(())
    }
}
