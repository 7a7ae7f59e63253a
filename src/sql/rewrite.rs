// ABOUTME: Prepares diff changesets for replay against the destination table
// ABOUTME: Drops transaction control, retargets DML statements, counts affected tuples

use super::lexer::{find_matching_paren, split_statements, LexError, Token, TokenKind, Tokenizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Replace,
    Update,
    Delete,
    /// Any statement the rewriter does not recognise; executed unchanged.
    Other,
}

/// A single statement ready to execute against the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeStatement {
    pub sql: String,
    pub kind: StatementKind,
    /// Number of row tuples the statement addresses, for logging only.
    pub tuples: usize,
}

/// Summary counts over a prepared changeset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChangesetStats {
    pub statements: usize,
    pub inserts: usize,
    pub deletes: usize,
    pub insert_tuples: usize,
    pub delete_tuples: usize,
}

impl ChangesetStats {
    pub fn record(&mut self, stmt: &ChangeStatement) {
        self.statements += 1;
        match stmt.kind {
            StatementKind::Insert | StatementKind::Replace => {
                self.inserts += 1;
                self.insert_tuples += stmt.tuples;
            }
            StatementKind::Delete => {
                self.deletes += 1;
                self.delete_tuples += stmt.tuples;
            }
            StatementKind::Update | StatementKind::Other => {}
        }
    }

    pub fn merge(&mut self, other: &ChangesetStats) {
        self.statements += other.statements;
        self.inserts += other.inserts;
        self.deletes += other.deletes;
        self.insert_tuples += other.insert_tuples;
        self.delete_tuples += other.delete_tuples;
    }
}

const TRANSACTION_CONTROL: &[&str] = &["BEGIN", "COMMIT", "ROLLBACK", "START"];

/// Turn the raw text of an incremental diff artifact into executable statements.
///
/// The text is split with the lexer first; every later step works inside one
/// statement. Transaction-control statements are dropped wherever they appear
/// because the apply engine owns the destination transaction. The table named
/// by `INSERT`/`REPLACE`/`UPDATE`/`DELETE` (qualified or not) is replaced by
/// `target`, which must already be a quoted, qualified identifier.
pub fn prepare_changeset(text: &str, target: &str) -> Result<Vec<ChangeStatement>, LexError> {
    let mut prepared = Vec::new();
    for statement in split_statements(text)? {
        let tokens: Vec<Token> = Tokenizer::new(&statement)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|t| !t.is_trivia())
            .collect();

        let Some(head) = tokens.first() else {
            continue;
        };
        if TRANSACTION_CONTROL
            .iter()
            .any(|kw| head.is_keyword(&statement, kw))
        {
            continue;
        }

        let (kind, table_pos) = classify(&statement, &tokens);
        let sql = match table_pos {
            Some(pos) => retarget(&statement, &tokens, pos, target),
            None => statement.clone(),
        };
        let tuples = count_tuples(&sql, kind);
        prepared.push(ChangeStatement { sql, kind, tuples });
    }
    Ok(prepared)
}

/// Identify the statement kind and the index (into the non-trivia tokens) of
/// the table reference that follows the DML keywords.
fn classify(sql: &str, tokens: &[Token]) -> (StatementKind, Option<usize>) {
    let head = &tokens[0];
    let (kind, modifiers, connector): (StatementKind, &[&str], Option<&str>) =
        if head.is_keyword(sql, "INSERT") {
            (
                StatementKind::Insert,
                &["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE"],
                Some("INTO"),
            )
        } else if head.is_keyword(sql, "REPLACE") {
            (
                StatementKind::Replace,
                &["LOW_PRIORITY", "DELAYED"],
                Some("INTO"),
            )
        } else if head.is_keyword(sql, "UPDATE") {
            (StatementKind::Update, &["LOW_PRIORITY", "IGNORE"], None)
        } else if head.is_keyword(sql, "DELETE") {
            (
                StatementKind::Delete,
                &["LOW_PRIORITY", "QUICK", "IGNORE"],
                Some("FROM"),
            )
        } else {
            return (StatementKind::Other, None);
        };

    let mut idx = 1;
    while idx < tokens.len() && modifiers.iter().any(|m| tokens[idx].is_keyword(sql, m)) {
        idx += 1;
    }
    if let Some(connector) = connector {
        if idx < tokens.len() && tokens[idx].is_keyword(sql, connector) {
            idx += 1;
        } else if kind == StatementKind::Delete {
            // DELETE always names its table after FROM
            return (kind, None);
        }
    }

    match tokens.get(idx) {
        Some(t) if is_identifier(t) => (kind, Some(idx)),
        _ => (kind, None),
    }
}

fn is_identifier(token: &Token) -> bool {
    matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent)
}

/// Replace the (possibly `db.`-qualified) table reference at `pos` with `target`.
fn retarget(sql: &str, tokens: &[Token], pos: usize, target: &str) -> String {
    let start = tokens[pos].start;
    let mut end = tokens[pos].end;
    if let (Some(dot), Some(name)) = (tokens.get(pos + 1), tokens.get(pos + 2)) {
        if dot.is_punct(sql, b'.') && is_identifier(name) {
            end = name.end;
        }
    }
    format!("{}{}{}", &sql[..start], target, &sql[end..])
}

/// Count the row tuples a statement addresses.
///
/// `INSERT`/`REPLACE ... VALUES (..), (..)` counts value tuples; `DELETE ...
/// IN ((..), (..))` counts the tuples or scalars of the first `IN` list; other
/// DML counts as one.
pub fn count_tuples(sql: &str, kind: StatementKind) -> usize {
    match kind {
        StatementKind::Insert | StatementKind::Replace => count_values_tuples(sql),
        StatementKind::Delete => count_in_list(sql).unwrap_or(1),
        StatementKind::Update => 1,
        StatementKind::Other => 0,
    }
}

fn count_values_tuples(sql: &str) -> usize {
    let mut tokens = Tokenizer::new(sql).filter_map(Result::ok);
    if !tokens.any(|t| t.is_keyword(sql, "VALUES") || t.is_keyword(sql, "VALUE")) {
        return 0;
    }
    let Some(after_values) = tokens.next() else {
        return 0;
    };

    let mut count = 0;
    let mut pos = after_values.start;
    loop {
        let next = Tokenizer::starting_at(sql, pos)
            .filter_map(Result::ok)
            .find(|t| !t.is_trivia() && !t.is_punct(sql, b','));
        match next {
            Some(t) if t.is_punct(sql, b'(') => match find_matching_paren(sql, t.start) {
                Some(close) => {
                    count += 1;
                    pos = close + 1;
                }
                None => break,
            },
            _ => break,
        }
    }
    count
}

fn count_in_list(sql: &str) -> Option<usize> {
    let tokens: Vec<Token> = Tokenizer::new(sql)
        .filter_map(Result::ok)
        .filter(|t| !t.is_trivia())
        .collect();
    let in_pos = tokens.iter().position(|t| t.is_keyword(sql, "IN"))?;
    let open = tokens.get(in_pos + 1).filter(|t| t.is_punct(sql, b'('))?;
    let close = find_matching_paren(sql, open.start)?;

    let mut depth = 0usize;
    let mut groups = 0usize;
    let mut commas = 0usize;
    let mut any = false;
    for t in Tokenizer::starting_at(sql, open.start + 1).filter_map(Result::ok) {
        if t.start >= close {
            break;
        }
        if t.is_trivia() {
            continue;
        }
        any = true;
        if t.is_punct(sql, b'(') {
            if depth == 0 {
                groups += 1;
            }
            depth += 1;
        } else if t.is_punct(sql, b')') {
            depth = depth.saturating_sub(1);
        } else if t.is_punct(sql, b',') && depth == 0 {
            commas += 1;
        }
    }

    if groups > 0 {
        Some(groups)
    } else if any {
        Some(commas + 1)
    } else {
        Some(0)
    }
}
