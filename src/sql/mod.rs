// ABOUTME: SQL text handling for changeset replay
// ABOUTME: Lexer-bounded statement splitting and destination retargeting

pub mod lexer;
pub mod rewrite;

pub use lexer::{find_matching_paren, split_statements, LexError};
pub use rewrite::{prepare_changeset, ChangeStatement, ChangesetStats, StatementKind};
