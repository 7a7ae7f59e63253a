// ABOUTME: Consistency verifier comparing row counts and XOR-combined row hashes
// ABOUTME: Full mode hashes every row; fast mode samples key buckets on large tables

use serde::Serialize;
use std::time::Duration;

use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::store::{Checksum, ColumnInfo, TableRef, TableStore};
use crate::utils::{quote_mysql_ident, quote_mysql_literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    Full,
    Fast,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::Full => "full",
            VerifyMode::Fast => "fast",
        }
    }
}

/// Outcome of one verification. `Indeterminate` never changes watermark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Indeterminate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Indeterminate => "indeterminate",
        }
    }
}

/// Restricts a checksum to one deterministic hash bucket of the key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpec {
    pub key_columns: Vec<ColumnInfo>,
    pub buckets: u32,
}

/// A COUNT/BIT_XOR(CRC32) query over one table, optionally at a reference point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumQuery {
    pub table: TableRef,
    pub snapshot: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub sample: Option<SampleSpec>,
}

/// NULL-safe text form of a column used inside the row hash.
fn normalized(column: &ColumnInfo) -> String {
    let ident = quote_mysql_ident(&column.name);
    if column.is_vector() {
        format!("IFNULL(HEX({}), 'NULL')", ident)
    } else {
        format!("IFNULL(CAST({} AS VARCHAR), 'NULL')", ident)
    }
}

fn concat(columns: &[ColumnInfo]) -> String {
    let parts: Vec<String> = columns.iter().map(normalized).collect();
    format!("CONCAT_WS(',', {})", parts.join(", "))
}

impl ChecksumQuery {
    pub fn to_sql(&self) -> String {
        let mut sql = format!(
            "SELECT COUNT(*), BIT_XOR(CRC32({})) FROM {}",
            concat(&self.columns),
            self.table.qualified()
        );
        if let Some(snapshot) = &self.snapshot {
            sql.push_str(&format!("{{snapshot = {}}}", quote_mysql_literal(snapshot)));
        }
        if let Some(sample) = &self.sample {
            sql.push_str(&format!(
                " WHERE MOD(CRC32({}), {}) = 0",
                concat(&sample.key_columns),
                sample.buckets
            ));
        }
        sql
    }
}

/// Tuning knobs for the verifier, usually taken from [`SyncSettings`].
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub retries: u32,
    pub retry_delay: Duration,
    pub fast_columns: Vec<String>,
    pub large_table_bytes: u64,
    pub large_table_rows: u64,
    pub sample_buckets: u32,
}

impl From<&SyncSettings> for VerifyOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            retries: settings.verify_retries,
            retry_delay: settings.verify_retry_delay(),
            fast_columns: settings.fast_verify_columns.clone(),
            large_table_bytes: settings.large_table_bytes,
            large_table_rows: settings.large_table_rows,
            sample_buckets: settings.sample_buckets,
        }
    }
}

/// Result of comparing one source table with its destination table.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub table: String,
    pub mode: VerifyMode,
    pub verdict: Verdict,
    /// Whether the comparison covered only a key-bucket sample
    pub sampled: bool,
    pub source: Option<Checksum>,
    pub destination: Option<Checksum>,
    pub detail: Option<String>,
}

impl VerifyReport {
    fn missing(table: &TableRef, mode: VerifyMode, detail: String) -> Self {
        Self {
            table: table.to_string(),
            mode,
            verdict: Verdict::Fail,
            sampled: false,
            source: None,
            destination: None,
            detail: Some(detail),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Typed mismatch error for reporting, when both checksums were obtained.
    pub fn mismatch(&self) -> Option<SyncError> {
        match (self.verdict, self.source, self.destination) {
            (Verdict::Fail, Some(src), Some(dst)) => Some(SyncError::VerificationMismatch {
                table: self.table.clone(),
                src_count: src.count,
                src_hash: src.hash,
                dst_count: dst.count,
                dst_hash: dst.hash,
            }),
            _ => None,
        }
    }
}

/// Compares a source table (optionally at a reference point) with a destination table.
#[derive(Debug, Clone)]
pub struct Verifier {
    options: VerifyOptions,
}

impl Verifier {
    pub fn new(options: VerifyOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &VerifyOptions {
        &self.options
    }

    /// Verify `destination_table` against `source_table`.
    ///
    /// Query errors are retried `retries` times with a fixed delay; if every
    /// attempt fails the verdict is [`Verdict::Indeterminate`]. A table missing
    /// on either side is a [`Verdict::Fail`].
    pub async fn verify<S, D>(
        &self,
        source: &mut S,
        destination: &mut D,
        source_table: &TableRef,
        destination_table: &TableRef,
        snapshot: Option<&str>,
        mode: VerifyMode,
    ) -> VerifyReport
    where
        S: TableStore + ?Sized,
        D: TableStore + ?Sized,
    {
        let mut last_error = String::new();

        for attempt in 0..=self.options.retries {
            match self
                .attempt(source, destination, source_table, destination_table, snapshot, mode)
                .await
            {
                Ok(report) => {
                    log_report(&report, snapshot);
                    return report;
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if attempt < self.options.retries {
                        tracing::warn!(
                            "Verify of {} failed (attempt {}/{}), retrying in {:?}: {}",
                            destination_table,
                            attempt + 1,
                            self.options.retries + 1,
                            self.options.retry_delay,
                            last_error
                        );
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
            }
        }

        tracing::error!(
            "Verify of {} is indeterminate after {} attempts: {}",
            destination_table,
            self.options.retries + 1,
            last_error
        );
        VerifyReport {
            table: destination_table.to_string(),
            mode,
            verdict: Verdict::Indeterminate,
            sampled: false,
            source: None,
            destination: None,
            detail: Some(last_error),
        }
    }

    async fn attempt<S, D>(
        &self,
        source: &mut S,
        destination: &mut D,
        source_table: &TableRef,
        destination_table: &TableRef,
        snapshot: Option<&str>,
        mode: VerifyMode,
    ) -> anyhow::Result<VerifyReport>
    where
        S: TableStore + ?Sized,
        D: TableStore + ?Sized,
    {
        if !source.table_exists(source_table).await? {
            return Ok(VerifyReport::missing(
                destination_table,
                mode,
                format!("source table {} does not exist", source_table),
            ));
        }
        if !destination.table_exists(destination_table).await? {
            return Ok(VerifyReport::missing(
                destination_table,
                mode,
                format!("destination table {} does not exist", destination_table),
            ));
        }

        let source_columns = source.columns(source_table).await?;
        let destination_columns = destination.columns(destination_table).await?;

        let (columns, sample) = match mode {
            VerifyMode::Full => (source_columns.clone(), None),
            VerifyMode::Fast => {
                self.plan_fast(source, destination, source_table, destination_table, &source_columns, &destination_columns)
                    .await?
            }
        };

        let source_query = ChecksumQuery {
            table: source_table.clone(),
            snapshot: snapshot.map(str::to_string),
            columns: columns.clone(),
            sample: sample.clone(),
        };
        let destination_query = ChecksumQuery {
            table: destination_table.clone(),
            snapshot: None,
            columns,
            sample: sample.clone(),
        };

        let src = source.checksum(&source_query).await?;
        let dst = destination.checksum(&destination_query).await?;
        let verdict = if src == dst { Verdict::Pass } else { Verdict::Fail };

        Ok(VerifyReport {
            table: destination_table.to_string(),
            mode,
            verdict,
            sampled: sample.is_some(),
            source: Some(src),
            destination: Some(dst),
            detail: None,
        })
    }

    /// Choose the columns and optional sample for fast mode.
    async fn plan_fast<S, D>(
        &self,
        source: &mut S,
        destination: &mut D,
        source_table: &TableRef,
        destination_table: &TableRef,
        source_columns: &[ColumnInfo],
        destination_columns: &[ColumnInfo],
    ) -> anyhow::Result<(Vec<ColumnInfo>, Option<SampleSpec>)>
    where
        S: TableStore + ?Sized,
        D: TableStore + ?Sized,
    {
        let source_pk: Vec<ColumnInfo> = source_columns.iter().filter(|c| c.primary_key).cloned().collect();
        let destination_pk: Vec<&str> = destination_columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let same_pk = !source_pk.is_empty()
            && source_pk.iter().map(|c| c.name.as_str()).eq(destination_pk.iter().copied());

        let sample_keys = if same_pk {
            Some(source_pk.clone())
        } else if source_pk.is_empty() {
            // Keyless tables sample through the synthetic index when one exists
            let indexes = destination.indexes(destination_table).await?;
            indexes
                .iter()
                .find(|i| !i.primary)
                .map(|index| {
                    index
                        .columns
                        .iter()
                        .filter_map(|name| source_columns.iter().find(|c| &c.name == name).cloned())
                        .collect::<Vec<_>>()
                })
                .filter(|cols| !cols.is_empty())
        } else {
            None
        };

        if let Some(keys) = sample_keys {
            if self.is_large(source, source_table).await? {
                let spec = SampleSpec {
                    key_columns: keys,
                    buckets: self.options.sample_buckets,
                };
                return Ok((source_columns.to_vec(), Some(spec)));
            }
        }

        if self.options.fast_columns.is_empty() {
            return Ok((source_columns.to_vec(), None));
        }

        if let Err(e) = self.check_fast_columns(source_table, source_columns) {
            tracing::warn!("{:#}; verifying every column instead", e);
            return Ok((source_columns.to_vec(), None));
        }
        let mut columns: Vec<ColumnInfo> = self
            .options
            .fast_columns
            .iter()
            .filter_map(|name| source_columns.iter().find(|c| &c.name == name).cloned())
            .collect();
        for pk in source_pk {
            if !columns.iter().any(|c| c.name == pk.name) {
                columns.push(pk);
            }
        }
        Ok((columns, None))
    }

    /// Reject configured fast-verify columns that `table` does not have.
    pub fn check_fast_columns(&self, table: &TableRef, columns: &[ColumnInfo]) -> anyhow::Result<()> {
        let unknown: Vec<&str> = self
            .options
            .fast_columns
            .iter()
            .filter(|name| !columns.iter().any(|c| &c.name == *name))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            anyhow::bail!(
                "fast_verify_columns [{}] not found in {}",
                unknown.join(", "),
                table
            );
        }
        Ok(())
    }

    async fn is_large<S>(&self, source: &mut S, table: &TableRef) -> anyhow::Result<bool>
    where
        S: TableStore + ?Sized,
    {
        let size = source.approximate_size(table).await?;
        if let Some(bytes) = size.bytes {
            return Ok(bytes >= self.options.large_table_bytes);
        }
        let rows = match size.rows {
            Some(rows) => rows,
            None => source.row_count(table).await?,
        };
        Ok(rows >= self.options.large_table_rows)
    }
}

fn log_report(report: &VerifyReport, snapshot: Option<&str>) {
    let at = snapshot.unwrap_or("live");
    match (report.verdict, report.source, report.destination) {
        (Verdict::Pass, Some(src), _) => tracing::info!(
            "Verify {} PASSED for {} at {}{} | rows: {} | hash: {:?}",
            report.mode.as_str(),
            report.table,
            at,
            if report.sampled { " (sampled)" } else { "" },
            src.count,
            src.hash
        ),
        (Verdict::Fail, Some(src), Some(dst)) => tracing::error!(
            "Verify {} FAILED for {} at {} | source ({}, {:?}) vs destination ({}, {:?})",
            report.mode.as_str(),
            report.table,
            at,
            src.count,
            src.hash,
            dst.count,
            dst.hash
        ),
        _ => tracing::error!(
            "Verify {} {} for {}: {}",
            report.mode.as_str(),
            report.verdict.as_str(),
            report.table,
            report.detail.as_deref().unwrap_or("no detail")
        ),
    }
}
