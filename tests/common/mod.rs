// ABOUTME: In-memory MatrixOne stand-in implementing the store traits for tests
// ABOUTME: Simulates snapshots, staged diffs, changeset replay, checksums and leases

#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use branch_replicator::config::SyncConfig;
use branch_replicator::sql::lexer::{tokenize, Token, TokenKind};
use branch_replicator::store::{
    Checksum, ColumnInfo, Connector, DestinationStore, IndexInfo, SourceStore, Stage, TableRef,
    TableSize, TableStore, Watermark,
};
use branch_replicator::utils::{quote_mysql_ident, quote_mysql_literal};
use branch_replicator::verify::ChecksumQuery;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub type Row = Vec<Option<String>>;

/// Build a row; the literal `NULL` becomes a SQL NULL.
pub fn row(values: &[&str]) -> Row {
    values
        .iter()
        .map(|v| (*v != "NULL").then(|| v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub rows: Vec<Row>,
}

impl Table {
    fn position(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .with_context(|| format!("unknown column {}", name))
    }

    fn pk_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    fn all_indexes(&self) -> Vec<IndexInfo> {
        let pk: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        let mut all = Vec::new();
        if !pk.is_empty() {
            all.push(IndexInfo {
                name: "PRIMARY".to_string(),
                columns: pk,
                primary: true,
                unique: true,
            });
        }
        all.extend(self.indexes.iter().cloned());
        all
    }

    fn empty_like(&self) -> Table {
        Table {
            columns: self.columns.clone(),
            indexes: self.indexes.clone(),
            rows: Vec::new(),
        }
    }
}

type MetaTables = (BTreeMap<TableRef, Table>, BTreeMap<String, Vec<String>>);

#[derive(Default)]
struct State {
    source: BTreeMap<TableRef, Table>,
    snapshots: BTreeMap<String, (TableRef, Table)>,
    stage: BTreeMap<String, String>,
    removed_artifacts: Vec<String>,
    artifact_seq: u64,
    destination: BTreeMap<TableRef, Table>,
    databases: BTreeSet<String>,
    /// Tokens per task key in the order they were recorded
    watermarks: BTreeMap<String, Vec<String>>,
    leases: BTreeMap<String, (String, Instant)>,
    fail_loads: usize,
    fail_checksums: usize,
    fail_snapshot_lookups: usize,
    vanish_prior_during_diff: bool,
}

fn table<'a>(map: &'a BTreeMap<TableRef, Table>, name: &TableRef) -> Result<&'a Table> {
    map.get(name)
        .with_context(|| format!("table {} does not exist", name))
}

fn table_mut<'a>(map: &'a mut BTreeMap<TableRef, Table>, name: &TableRef) -> Result<&'a mut Table> {
    map.get_mut(name)
        .with_context(|| format!("table {} does not exist", name))
}

/// Shared state of one fake source/destination pair plus its stage.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn create_source_table(&self, name: &TableRef, columns: &[(&str, &str)], primary_key: &[&str]) {
        let columns = columns
            .iter()
            .map(|(column, data_type)| ColumnInfo {
                name: column.to_string(),
                data_type: data_type.to_string(),
                nullable: !primary_key.contains(column),
                primary_key: primary_key.contains(column),
            })
            .collect();
        self.lock().source.insert(
            name.clone(),
            Table {
                columns,
                ..Default::default()
            },
        );
    }

    pub fn insert_source(&self, name: &TableRef, rows: &[Row]) {
        let mut state = self.lock();
        let table = state.source.get_mut(name).unwrap();
        table.rows.extend(rows.iter().cloned());
    }

    pub fn delete_source(&self, name: &TableRef, pred: impl Fn(&Row) -> bool) {
        let mut state = self.lock();
        state.source.get_mut(name).unwrap().rows.retain(|r| !pred(r));
    }

    pub fn update_source(&self, name: &TableRef, mut update: impl FnMut(&mut Row)) {
        let mut state = self.lock();
        state.source.get_mut(name).unwrap().rows.iter_mut().for_each(|r| update(r));
    }

    pub fn source_rows(&self, name: &TableRef) -> Vec<Row> {
        let mut rows = self.lock().source[name].rows.clone();
        rows.sort();
        rows
    }

    pub fn source_tables(&self) -> Vec<TableRef> {
        self.lock().source.keys().cloned().collect()
    }

    pub fn destination_rows(&self, name: &TableRef) -> Option<Vec<Row>> {
        let state = self.lock();
        let mut rows = state.destination.get(name)?.rows.clone();
        rows.sort();
        Some(rows)
    }

    pub fn destination_tables(&self) -> Vec<TableRef> {
        self.lock().destination.keys().cloned().collect()
    }

    pub fn destination_indexes(&self, name: &TableRef) -> Vec<IndexInfo> {
        self.lock().destination[name].indexes.clone()
    }

    pub fn tamper_destination(&self, name: &TableRef, tamper: impl FnOnce(&mut Vec<Row>)) {
        let mut state = self.lock();
        tamper(&mut state.destination.get_mut(name).unwrap().rows);
    }

    pub fn source_snapshots(&self) -> Vec<String> {
        self.lock().snapshots.keys().cloned().collect()
    }

    pub fn drop_source_snapshot(&self, name: &str) {
        self.lock().snapshots.remove(name);
    }

    pub fn watermarks(&self, key: &str) -> Vec<String> {
        self.lock()
            .watermarks
            .get(key)
            .map(|tokens| tokens.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_watermarks(&self) {
        self.lock().watermarks.clear();
    }

    pub fn stage_files(&self) -> Vec<String> {
        self.lock().stage.keys().cloned().collect()
    }

    /// Artifacts the engine asked to remove whose path starts with `<scheme>://`.
    pub fn removed_artifacts(&self, scheme: &str) -> Vec<String> {
        let prefix = format!("{}://", scheme);
        self.lock()
            .removed_artifacts
            .iter()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn lease_owner(&self, task_id: &str) -> Option<String> {
        self.lock().leases.get(task_id).map(|(owner, _)| owner.clone())
    }

    pub fn hold_lease(&self, task_id: &str, owner: &str) {
        self.lock()
            .leases
            .insert(task_id.to_string(), (owner.to_string(), Instant::now()));
    }

    pub fn fail_next_loads(&self, count: usize) {
        self.lock().fail_loads = count;
    }

    pub fn fail_checksums(&self, count: usize) {
        self.lock().fail_checksums = count;
    }

    pub fn fail_snapshot_lookups(&self, count: usize) {
        self.lock().fail_snapshot_lookups = count;
    }

    /// Drop the prior reference point while the next incremental diff
    /// materializes it, as a concurrent cleanup would.
    pub fn vanish_prior_during_diff(&self) {
        self.lock().vanish_prior_during_diff = true;
    }
}

#[async_trait]
impl Connector for FakeCluster {
    async fn source(&self) -> Result<Box<dyn SourceStore>> {
        Ok(Box::new(FakeSource {
            state: self.state.clone(),
        }))
    }

    async fn destination(&self) -> Result<Box<dyn DestinationStore>> {
        Ok(Box::new(FakeDestination {
            state: self.state.clone(),
            tx: None,
        }))
    }
}

fn fnv(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in text.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Hash the fake checksum gives a row projected to `values`, in column order.
pub fn row_hash(values: &[&str]) -> u64 {
    fnv(&values.join(","))
}

/// Whether a row with these key values falls in the sampled bucket.
pub fn in_sample_bucket(key: &[&str], buckets: u64) -> bool {
    fnv(&key.join(",")) % buckets == 0
}

fn project(row: &Row, positions: &[usize]) -> String {
    positions
        .iter()
        .map(|&i| row[i].as_deref().unwrap_or("NULL"))
        .collect::<Vec<_>>()
        .join(",")
}

fn checksum(table: &Table, query: &ChecksumQuery) -> Result<Checksum> {
    let positions = query
        .columns
        .iter()
        .map(|c| table.position(&c.name))
        .collect::<Result<Vec<_>>>()?;
    let sample = match &query.sample {
        Some(spec) => Some((
            spec.key_columns
                .iter()
                .map(|c| table.position(&c.name))
                .collect::<Result<Vec<_>>>()?,
            spec.buckets as u64,
        )),
        None => None,
    };

    let mut count = 0;
    let mut hash = None;
    for row in &table.rows {
        if let Some((keys, buckets)) = &sample {
            if fnv(&project(row, keys)) % buckets != 0 {
                continue;
            }
        }
        count += 1;
        hash = Some(hash.unwrap_or(0) ^ fnv(&project(row, &positions)));
    }
    Ok(Checksum { count, hash })
}

fn cardinality(table: &Table, column: &str) -> Result<(u64, u64)> {
    let pos = table.position(column)?;
    let distinct: BTreeSet<&Option<String>> = table.rows.iter().map(|r| &r[pos]).collect();
    Ok((distinct.len() as u64, table.rows.len() as u64))
}

fn render_ddl(name: &str, table: &Table) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            format!(
                "  {} {}{}",
                quote_mysql_ident(&c.name),
                c.data_type,
                if c.nullable { " DEFAULT NULL" } else { " NOT NULL" }
            )
        })
        .collect();
    let pk: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_mysql_ident(&c.name))
        .collect();
    if !pk.is_empty() {
        lines.push(format!("  PRIMARY KEY ({})", pk.join(",")));
    }
    format!("CREATE TABLE {} (\n{}\n)", quote_mysql_ident(name), lines.join(",\n"))
}

fn sql_value(value: &Option<String>) -> String {
    match value {
        Some(v) => quote_mysql_literal(v),
        None => "NULL".to_string(),
    }
}

fn sql_tuple(values: &[Option<String>]) -> String {
    let parts: Vec<String> = values.iter().map(sql_value).collect();
    format!("({})", parts.join(", "))
}

fn column_list(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| quote_mysql_ident(n)).collect();
    format!("({})", quoted.join(", "))
}

/// SQL changeset turning `prev` into `current`, addressed to `base`.
fn changeset(base: &TableRef, prev: &Table, current: &Table) -> String {
    let target = base.qualified();
    let all: Vec<&str> = current.columns.iter().map(|c| c.name.as_str()).collect();
    let pk = current.pk_positions();

    let mut deletes: Vec<Row> = Vec::new();
    let mut upserts: Vec<Row> = Vec::new();
    let (key_names, verb): (Vec<&str>, &str) = if pk.is_empty() {
        let mut counts: BTreeMap<&Row, (usize, usize)> = BTreeMap::new();
        for r in &prev.rows {
            counts.entry(r).or_default().0 += 1;
        }
        for r in &current.rows {
            counts.entry(r).or_default().1 += 1;
        }
        for (r, (before, after)) in counts {
            if before == after {
                continue;
            }
            if before > 0 {
                deletes.push(r.clone());
            }
            upserts.extend(std::iter::repeat(r.clone()).take(after));
        }
        (all.clone(), "INSERT")
    } else {
        let key = |r: &Row| -> Row { pk.iter().map(|&i| r[i].clone()).collect() };
        let before: BTreeMap<Row, &Row> = prev.rows.iter().map(|r| (key(r), r)).collect();
        let after: BTreeMap<Row, &Row> = current.rows.iter().map(|r| (key(r), r)).collect();
        deletes.extend(before.keys().filter(|k| !after.contains_key(*k)).cloned());
        for (k, r) in &after {
            if before.get(k) != Some(r) {
                upserts.push((*r).clone());
            }
        }
        (pk.iter().map(|&i| all[i]).collect(), "REPLACE")
    };

    let mut out = String::from("BEGIN;\n");
    if !deletes.is_empty() {
        let tuples: Vec<String> = deletes.iter().map(|r| sql_tuple(r)).collect();
        out.push_str(&format!(
            "DELETE FROM {} WHERE {} IN ({});\n",
            target,
            column_list(&key_names),
            tuples.join(", ")
        ));
    }
    if !upserts.is_empty() {
        let tuples: Vec<String> = upserts.iter().map(|r| sql_tuple(r)).collect();
        out.push_str(&format!(
            "{} INTO {} {} VALUES {};\n",
            verb,
            target,
            column_list(&all),
            tuples.join(", ")
        ));
    }
    out.push_str("COMMIT;\n");
    out
}

/// Cursor over the non-trivia tokens of one statement.
struct Parser<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(sql: &'a str) -> Result<Self> {
        let tokens = tokenize(sql)?.into_iter().filter(|t| !t.is_trivia()).collect();
        Ok(Self { sql, tokens, pos: 0 })
    }

    fn next(&mut self) -> Result<Token> {
        let token = *self.tokens.get(self.pos).context("unexpected end of statement")?;
        self.pos += 1;
        Ok(token)
    }

    fn keyword(&mut self, keyword: &str) -> bool {
        match self.tokens.get(self.pos) {
            Some(t) if t.is_keyword(self.sql, keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, keyword: &str) -> Result<()> {
        if !self.keyword(keyword) {
            bail!("expected {} in {}", keyword, self.sql);
        }
        Ok(())
    }

    fn punct(&mut self, ch: u8) -> bool {
        match self.tokens.get(self.pos) {
            Some(t) if t.is_punct(self.sql, ch) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_punct(&mut self, ch: u8) -> Result<()> {
        if !self.punct(ch) {
            bail!("expected '{}' in {}", ch as char, self.sql);
        }
        Ok(())
    }

    fn ident(&mut self) -> Result<String> {
        let token = self.next()?;
        let text = token.text(self.sql);
        match token.kind {
            TokenKind::QuotedIdent => Ok(text[1..text.len() - 1].replace("``", "`")),
            TokenKind::Word => Ok(text.to_string()),
            _ => bail!("expected identifier, found {}", text),
        }
    }

    fn table(&mut self) -> Result<TableRef> {
        let database = self.ident()?;
        if !self.punct(b'.') {
            bail!("unqualified table {} in {}", database, self.sql);
        }
        let table = self.ident()?;
        Ok(TableRef::new(&database, &table))
    }

    fn ident_list(&mut self) -> Result<Vec<String>> {
        self.expect_punct(b'(')?;
        let mut names = vec![self.ident()?];
        while self.punct(b',') {
            names.push(self.ident()?);
        }
        self.expect_punct(b')')?;
        Ok(names)
    }

    fn value(&mut self) -> Result<Option<String>> {
        let token = self.next()?;
        let text = token.text(self.sql);
        match token.kind {
            TokenKind::String => Ok(Some(unquote(text))),
            TokenKind::Word if text.eq_ignore_ascii_case("NULL") => Ok(None),
            TokenKind::Word => Ok(Some(text.to_string())),
            _ => bail!("expected value, found {}", text),
        }
    }

    fn tuple(&mut self) -> Result<Row> {
        self.expect_punct(b'(')?;
        let mut values = vec![self.value()?];
        while self.punct(b',') {
            values.push(self.value()?);
        }
        self.expect_punct(b')')?;
        Ok(values)
    }

    fn tuples(&mut self) -> Result<Vec<Row>> {
        let mut tuples = vec![self.tuple()?];
        while self.punct(b',') {
            tuples.push(self.tuple()?);
        }
        Ok(tuples)
    }
}

fn unquote(literal: &str) -> String {
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Execute one retargeted changeset statement against the destination.
fn execute_change(tables: &mut BTreeMap<TableRef, Table>, sql: &str) -> Result<u64> {
    let mut p = Parser::new(sql)?;

    if p.keyword("DELETE") {
        p.expect("FROM")?;
        let name = p.table()?;
        p.expect("WHERE")?;
        let columns = p.ident_list()?;
        p.expect("IN")?;
        p.expect_punct(b'(')?;
        let keys: BTreeSet<Row> = p.tuples()?.into_iter().collect();
        p.expect_punct(b')')?;

        let table = table_mut(tables, &name)?;
        let positions = columns
            .iter()
            .map(|c| table.position(c))
            .collect::<Result<Vec<_>>>()?;
        let before = table.rows.len();
        table
            .rows
            .retain(|r| !keys.contains(&positions.iter().map(|&i| r[i].clone()).collect::<Row>()));
        return Ok((before - table.rows.len()) as u64);
    }

    let replace = if p.keyword("REPLACE") {
        true
    } else if p.keyword("INSERT") {
        false
    } else {
        bail!("unsupported statement: {}", sql);
    };
    p.expect("INTO")?;
    let name = p.table()?;
    let columns = p.ident_list()?;
    p.expect("VALUES")?;
    let tuples = p.tuples()?;

    let table = table_mut(tables, &name)?;
    let positions = columns
        .iter()
        .map(|c| table.position(c))
        .collect::<Result<Vec<_>>>()?;
    let pk = table.pk_positions();
    let mut affected = 0;
    for values in tuples {
        if values.len() != positions.len() {
            bail!("column count mismatch in {}", sql);
        }
        let mut new_row: Row = vec![None; table.columns.len()];
        for (&i, v) in positions.iter().zip(values) {
            new_row[i] = v;
        }
        if !pk.is_empty() {
            let key: Row = pk.iter().map(|&i| new_row[i].clone()).collect();
            let exists = |r: &Row| pk.iter().map(|&i| r[i].clone()).collect::<Row>() == key;
            if table.rows.iter().any(|r| exists(r)) {
                if !replace {
                    bail!("duplicate primary key in {}", name);
                }
                table.rows.retain(|r| !exists(r));
            }
        }
        table.rows.push(new_row);
        affected += 1;
    }
    Ok(affected)
}

/// Parse the `CREATE TABLE` produced by [`render_ddl`] after name substitution.
fn parse_ddl(ddl: &str) -> Result<(TableRef, Table)> {
    let mut p = Parser::new(ddl)?;
    p.expect("CREATE")?;
    p.expect("TABLE")?;
    let name = p.table()?;

    let mut table = Table::default();
    let mut pk: Vec<String> = Vec::new();
    for line in ddl.lines().skip(1) {
        let line = line.trim().trim_end_matches(',');
        if let Some(rest) = line.strip_prefix("PRIMARY KEY") {
            pk = rest
                .trim()
                .trim_matches(|c| c == '(' || c == ')')
                .split(',')
                .map(|c| c.trim().trim_matches('`').to_string())
                .collect();
        } else if let Some(rest) = line.strip_prefix('`') {
            let (column, rest) = rest.split_once('`').context("bad column definition")?;
            let data_type = rest
                .split_whitespace()
                .next()
                .context("missing column type")?
                .to_lowercase();
            table.columns.push(ColumnInfo {
                name: column.to_string(),
                data_type,
                nullable: !rest.contains("NOT NULL"),
                primary_key: false,
            });
        }
    }
    for column in &mut table.columns {
        column.primary_key = pk.contains(&column.name);
    }
    Ok((name, table))
}

pub struct FakeSource {
    state: Arc<Mutex<State>>,
}

impl FakeSource {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl TableStore for FakeSource {
    fn endpoint(&self) -> String {
        "fake-source".to_string()
    }

    async fn table_exists(&mut self, name: &TableRef) -> Result<bool> {
        Ok(self.lock().source.contains_key(name))
    }

    async fn columns(&mut self, name: &TableRef) -> Result<Vec<ColumnInfo>> {
        Ok(table(&self.lock().source, name)?.columns.clone())
    }

    async fn indexes(&mut self, name: &TableRef) -> Result<Vec<IndexInfo>> {
        Ok(table(&self.lock().source, name)?.all_indexes())
    }

    async fn row_count(&mut self, name: &TableRef) -> Result<u64> {
        Ok(table(&self.lock().source, name)?.rows.len() as u64)
    }

    async fn approximate_size(&mut self, name: &TableRef) -> Result<TableSize> {
        let rows = table(&self.lock().source, name)?.rows.len() as u64;
        Ok(TableSize {
            bytes: None,
            rows: Some(rows),
        })
    }

    async fn column_cardinality(&mut self, name: &TableRef, column: &str) -> Result<(u64, u64)> {
        cardinality(table(&self.lock().source, name)?, column)
    }

    async fn checksum(&mut self, query: &ChecksumQuery) -> Result<Checksum> {
        let mut state = self.lock();
        if state.fail_checksums > 0 {
            state.fail_checksums -= 1;
            bail!("injected checksum failure");
        }
        match &query.snapshot {
            Some(snapshot) => {
                let (origin, copy) = state
                    .snapshots
                    .get(snapshot)
                    .with_context(|| format!("snapshot {} does not exist", snapshot))?;
                if origin != &query.table {
                    bail!("snapshot {} does not cover {}", snapshot, query.table);
                }
                checksum(copy, query)
            }
            None => checksum(table(&state.source, &query.table)?, query),
        }
    }
}

#[async_trait]
impl SourceStore for FakeSource {
    async fn list_tables(&mut self, database: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .source
            .keys()
            .filter(|t| t.database == database)
            .map(|t| t.table.clone())
            .collect())
    }

    async fn show_create_table(&mut self, name: &TableRef) -> Result<String> {
        Ok(render_ddl(&name.table, table(&self.lock().source, name)?))
    }

    async fn snapshot_exists(&mut self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        if state.fail_snapshot_lookups > 0 {
            state.fail_snapshot_lookups -= 1;
            bail!("injected snapshot lookup failure");
        }
        Ok(state.snapshots.contains_key(name))
    }

    async fn create_snapshot(&mut self, name: &str, of: &TableRef) -> Result<()> {
        let mut state = self.lock();
        if state.snapshots.contains_key(name) {
            bail!("snapshot {} already exists", name);
        }
        let copy = table(&state.source, of)?.clone();
        state.snapshots.insert(name.to_string(), (of.clone(), copy));
        Ok(())
    }

    async fn drop_snapshot(&mut self, name: &str) -> Result<()> {
        self.lock().snapshots.remove(name);
        Ok(())
    }

    async fn list_snapshots(&mut self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .snapshots
            .keys()
            .rev()
            .filter(|name| name.starts_with(prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_empty_like(&mut self, target: &TableRef, like: &TableRef) -> Result<()> {
        let mut state = self.lock();
        let empty = table(&state.source, like)?.empty_like();
        state.source.insert(target.clone(), empty);
        Ok(())
    }

    async fn clone_at_snapshot(&mut self, target: &TableRef, from: &TableRef, snapshot: &str) -> Result<()> {
        let mut state = self.lock();
        if state.vanish_prior_during_diff {
            state.vanish_prior_during_diff = false;
            state.snapshots.remove(snapshot);
        }
        let (origin, copy) = state
            .snapshots
            .get(snapshot)
            .with_context(|| format!("snapshot {} does not exist", snapshot))?;
        if origin != from {
            bail!("snapshot {} does not cover {}", snapshot, from);
        }
        let copy = copy.clone();
        state.source.insert(target.clone(), copy);
        Ok(())
    }

    async fn drop_table(&mut self, name: &TableRef) -> Result<()> {
        self.lock().source.remove(name);
        Ok(())
    }

    async fn diff(
        &mut self,
        name: &TableRef,
        snapshot: &str,
        base: &TableRef,
        stage: &Stage,
    ) -> Result<Vec<String>> {
        let mut state = self.lock();
        let (origin, current) = state
            .snapshots
            .get(snapshot)
            .with_context(|| format!("snapshot {} does not exist", snapshot))?;
        if origin != name {
            bail!("snapshot {} does not cover {}", snapshot, name);
        }
        let current = current.clone();
        let base_table = table(&state.source, base)?.clone();

        let mut contents = Vec::new();
        if base.table.ends_with("_sync_zero") {
            for chunk in current.rows.chunks(2) {
                let lines: Vec<String> = chunk
                    .iter()
                    .map(|r| serde_json::to_string(r))
                    .collect::<Result<_, _>>()?;
                contents.push(("csv", lines.join("\n")));
            }
        } else {
            contents.push(("sql", changeset(base, &base_table, &current)));
        }

        let mut files = Vec::new();
        for (ext, content) in contents {
            state.artifact_seq += 1;
            let path = format!("{}/{}_{}.{}", stage.location(), snapshot, state.artifact_seq, ext);
            state.stage.insert(path.clone(), content);
            files.push(path);
        }
        Ok(files)
    }

    async fn read_artifact(&mut self, path: &str) -> Result<String> {
        self.lock()
            .stage
            .get(path)
            .cloned()
            .with_context(|| format!("artifact {} does not exist", path))
    }

    async fn remove_artifact(&mut self, path: &str) -> Result<()> {
        let mut state = self.lock();
        state.removed_artifacts.push(path.to_string());
        state.stage.remove(path);
        Ok(())
    }
}

pub struct FakeDestination {
    state: Arc<Mutex<State>>,
    tx: Option<MetaTables>,
}

impl FakeDestination {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl TableStore for FakeDestination {
    fn endpoint(&self) -> String {
        "fake-destination".to_string()
    }

    async fn table_exists(&mut self, name: &TableRef) -> Result<bool> {
        Ok(self.lock().destination.contains_key(name))
    }

    async fn columns(&mut self, name: &TableRef) -> Result<Vec<ColumnInfo>> {
        Ok(table(&self.lock().destination, name)?.columns.clone())
    }

    async fn indexes(&mut self, name: &TableRef) -> Result<Vec<IndexInfo>> {
        Ok(table(&self.lock().destination, name)?.all_indexes())
    }

    async fn row_count(&mut self, name: &TableRef) -> Result<u64> {
        Ok(table(&self.lock().destination, name)?.rows.len() as u64)
    }

    async fn approximate_size(&mut self, name: &TableRef) -> Result<TableSize> {
        let rows = table(&self.lock().destination, name)?.rows.len() as u64;
        Ok(TableSize {
            bytes: None,
            rows: Some(rows),
        })
    }

    async fn column_cardinality(&mut self, name: &TableRef, column: &str) -> Result<(u64, u64)> {
        cardinality(table(&self.lock().destination, name)?, column)
    }

    async fn checksum(&mut self, query: &ChecksumQuery) -> Result<Checksum> {
        let mut state = self.lock();
        if state.fail_checksums > 0 {
            state.fail_checksums -= 1;
            bail!("injected checksum failure");
        }
        if query.snapshot.is_some() {
            bail!("destination checksums never read reference points");
        }
        checksum(table(&state.destination, &query.table)?, query)
    }
}

#[async_trait]
impl DestinationStore for FakeDestination {
    async fn ensure_database(&mut self, database: &str) -> Result<()> {
        self.lock().databases.insert(database.to_string());
        Ok(())
    }

    async fn create_table(&mut self, ddl: &str) -> Result<()> {
        let (name, table) = parse_ddl(ddl)?;
        let mut state = self.lock();
        if !state.databases.contains(&name.database) {
            bail!("database {} does not exist", name.database);
        }
        if state.destination.contains_key(&name) {
            bail!("table {} already exists", name);
        }
        state.destination.insert(name, table);
        Ok(())
    }

    async fn create_index(&mut self, name: &TableRef, index: &str, columns: &[String]) -> Result<()> {
        let mut state = self.lock();
        let table = table_mut(&mut state.destination, name)?;
        if table.indexes.iter().any(|i| i.name == index) {
            bail!("index {} already exists on {}", index, name);
        }
        table.indexes.push(IndexInfo {
            name: index.to_string(),
            columns: columns.to_vec(),
            primary: false,
            unique: false,
        });
        Ok(())
    }

    async fn ensure_meta_schema(&mut self) -> Result<()> {
        Ok(())
    }

    async fn acquire_lease(&mut self, task_id: &str, owner: &str, timeout_secs: u64) -> Result<Option<String>> {
        let mut state = self.lock();
        if let Some((holder, at)) = state.leases.get(task_id) {
            if holder != owner && at.elapsed() < Duration::from_secs(timeout_secs) {
                return Ok(Some(holder.clone()));
            }
        }
        state
            .leases
            .insert(task_id.to_string(), (owner.to_string(), Instant::now()));
        Ok(None)
    }

    async fn renew_lease(&mut self, task_id: &str, owner: &str) -> Result<bool> {
        let mut state = self.lock();
        match state.leases.get_mut(task_id) {
            Some((holder, at)) if holder == owner => {
                *at = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&mut self, task_id: &str, owner: &str) -> Result<()> {
        let mut state = self.lock();
        if state.leases.get(task_id).is_some_and(|(holder, _)| holder == owner) {
            state.leases.remove(task_id);
        }
        Ok(())
    }

    async fn list_watermarks(&mut self, key: &str) -> Result<Vec<Watermark>> {
        Ok(self
            .lock()
            .watermarks
            .get(key)
            .map(|tokens| {
                tokens
                    .iter()
                    .rev()
                    .map(|t| Watermark {
                        token: t.clone(),
                        created_at: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_watermark(&mut self, key: &str, token: &str) -> Result<()> {
        let mut state = self.lock();
        let tokens = state.watermarks.entry(key.to_string()).or_default();
        if tokens.iter().any(|t| t == token) {
            bail!("duplicate watermark {} for {}", token, key);
        }
        tokens.push(token.to_string());
        Ok(())
    }

    async fn delete_watermark(&mut self, key: &str, token: &str) -> Result<()> {
        if let Some(tokens) = self.lock().watermarks.get_mut(key) {
            tokens.retain(|t| t != token);
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            bail!("transaction already open");
        }
        let state = self.lock();
        let saved = (state.destination.clone(), state.watermarks.clone());
        drop(state);
        self.tx = Some(saved);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some((tables, watermarks)) = self.tx.take() {
            let mut state = self.lock();
            state.destination = tables;
            state.watermarks = watermarks;
        }
        Ok(())
    }

    async fn clear_table(&mut self, name: &TableRef) -> Result<u64> {
        let mut state = self.lock();
        let table = table_mut(&mut state.destination, name)?;
        let cleared = table.rows.len() as u64;
        table.rows.clear();
        Ok(cleared)
    }

    async fn load_artifact(&mut self, path: &str, name: &TableRef) -> Result<u64> {
        let mut state = self.lock();
        if state.fail_loads > 0 {
            state.fail_loads -= 1;
            bail!("injected load failure for {}", path);
        }
        let content = state
            .stage
            .get(path)
            .cloned()
            .with_context(|| format!("artifact {} does not exist", path))?;
        let table = table_mut(&mut state.destination, name)?;
        let mut loaded = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let r: Row = serde_json::from_str(line)?;
            if r.len() != table.columns.len() {
                bail!("row width {} does not match {}", r.len(), name);
            }
            table.rows.push(r);
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        execute_change(&mut self.lock().destination, sql)
    }
}

pub fn source_table(table: &str) -> TableRef {
    TableRef::new("src", table)
}

pub fn destination_table(table: &str) -> TableRef {
    TableRef::new("dst", table)
}

/// Table-scope task `src.orders -> dst.orders` with verification retries off.
pub fn table_config(extra: &str) -> SyncConfig {
    SyncConfig::from_toml_str(&format!(
        r#"
[source]
host = "source.local"
user = "sync"
database = "src"
table = "orders"

[destination]
host = "destination.local"
user = "sync"
database = "dst"
table = "orders"

[stage]
name = "s1"

[sync]
verify_retries = 0
verify_retry_delay_secs = 0
{}
"#,
        extra
    ))
    .unwrap()
}

/// Database-scope task `src -> dst` with verification retries off.
pub fn database_config(extra: &str) -> SyncConfig {
    SyncConfig::from_toml_str(&format!(
        r#"
[source]
host = "source.local"
user = "sync"
database = "src"

[destination]
host = "destination.local"
user = "sync"
database = "dst"

[stage]
name = "s1"

[sync]
scope = "database"
verify_retries = 0
verify_retry_delay_secs = 0
{}
"#,
        extra
    ))
    .unwrap()
}

/// `orders(id bigint PK, item varchar(64), qty int)`
pub fn create_orders(cluster: &FakeCluster, rows: &[Row]) -> TableRef {
    let name = source_table("orders");
    cluster.create_source_table(
        &name,
        &[("id", "bigint"), ("item", "varchar(64)"), ("qty", "int")],
        &["id"],
    );
    cluster.insert_source(&name, rows);
    name
}
