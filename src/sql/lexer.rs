// ABOUTME: Quote- and comment-aware tokenizer for MySQL-dialect SQL text
// ABOUTME: Splits multi-statement batches and matches parentheses without breaking literals

use thiserror::Error;

/// Failure to tokenize SQL text.
///
/// Any input that ends inside a literal, quoted identifier or block comment is
/// rejected as a whole: splitting it would risk executing a truncated or merged
/// statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unterminated {kind} starting at byte {offset}")]
    Unterminated { kind: &'static str, offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    /// `-- ...` (dash-dash followed by whitespace) or `# ...`, up to the newline.
    LineComment,
    /// `/* ... */`, not nested.
    BlockComment,
    /// Single- or double-quoted string literal, quotes included.
    String,
    /// Backtick-quoted identifier, backticks included.
    QuotedIdent,
    /// Run of identifier, keyword or number characters.
    Word,
    /// Any other single ASCII character: operators, parentheses, `;`, `.`, `,`.
    Punct,
}

/// A byte range of the input together with its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.start..self.end]
    }

    /// Whitespace and comments carry no meaning for statement structure.
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    pub fn is_punct(&self, sql: &str, ch: u8) -> bool {
        self.kind == TokenKind::Punct && sql.as_bytes()[self.start] == ch
    }

    /// Case-insensitive keyword comparison for `Word` tokens.
    pub fn is_keyword(&self, sql: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text(sql).eq_ignore_ascii_case(keyword)
    }
}

/// Streaming tokenizer over SQL text.
///
/// Yields every byte of the input exactly once, so concatenating token texts
/// reproduces the input. Stops after the first error.
pub struct Tokenizer<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self::starting_at(sql, 0)
    }

    /// Start tokenizing at `pos`, which must lie outside any literal or comment.
    pub fn starting_at(sql: &'a str, pos: usize) -> Self {
        Self {
            bytes: sql.as_bytes(),
            pos: pos.min(sql.len()),
            failed: false,
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn scan_quoted(&self, start: usize, quote: u8, backslash_escapes: bool) -> Option<usize> {
        let mut i = start + 1;
        while i < self.bytes.len() {
            let b = self.bytes[i];
            if backslash_escapes && b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                // A doubled quote is an escaped quote, not the end of the literal.
                if self.bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                    continue;
                }
                return Some(i + 1);
            }
            i += 1;
        }
        None
    }

    fn scan_while(&self, start: usize, pred: impl Fn(u8) -> bool) -> usize {
        let mut i = start;
        while i < self.bytes.len() && pred(self.bytes[i]) {
            i += 1;
        }
        i
    }

    fn line_end(&self, start: usize) -> usize {
        self.scan_while(start, |b| b != b'\n')
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

// Bytes >= 0x80 belong to multi-byte UTF-8 characters; treating them as word
// bytes keeps every token boundary on a char boundary.
fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

impl Iterator for Tokenizer<'_> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }

        let start = self.pos;
        let b = self.bytes[start];
        let (kind, end) = match b {
            b if is_space(b) => (TokenKind::Whitespace, self.scan_while(start, is_space)),
            b'#' => (TokenKind::LineComment, self.line_end(start)),
            b'-' if self.peek(1) == Some(b'-') && self.peek(2).map_or(true, is_space) => {
                (TokenKind::LineComment, self.line_end(start))
            }
            b'/' if self.peek(1) == Some(b'*') => {
                let close = self.bytes[start + 2..]
                    .windows(2)
                    .position(|w| w == b"*/");
                match close {
                    Some(idx) => (TokenKind::BlockComment, start + 2 + idx + 2),
                    None => {
                        self.failed = true;
                        return Some(Err(LexError::Unterminated {
                            kind: "block comment",
                            offset: start,
                        }));
                    }
                }
            }
            b'\'' | b'"' => match self.scan_quoted(start, b, true) {
                Some(end) => (TokenKind::String, end),
                None => {
                    self.failed = true;
                    return Some(Err(LexError::Unterminated {
                        kind: "string literal",
                        offset: start,
                    }));
                }
            },
            b'`' => match self.scan_quoted(start, b, false) {
                Some(end) => (TokenKind::QuotedIdent, end),
                None => {
                    self.failed = true;
                    return Some(Err(LexError::Unterminated {
                        kind: "quoted identifier",
                        offset: start,
                    }));
                }
            },
            b if is_word_byte(b) => (TokenKind::Word, self.scan_while(start, is_word_byte)),
            _ => (TokenKind::Punct, start + 1),
        };

        self.pos = end;
        Some(Ok(Token { kind, start, end }))
    }
}

/// Collect all tokens of `sql`, failing on the first lexical error.
pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    Tokenizer::new(sql).collect()
}

/// Split a multi-statement batch at top-level `;` boundaries.
///
/// Semicolons inside string literals, quoted identifiers and comments are not
/// boundaries. Each returned statement spans from its first to its last
/// non-comment token, so leading/trailing whitespace and comments are dropped,
/// and fragments containing only whitespace or comments are skipped.
///
/// Terminating each returned statement with `;` and splitting the
/// concatenation again yields the same list.
///
/// # Examples
///
/// ```
/// use branch_replicator::sql::lexer::split_statements;
/// let stmts = split_statements("INSERT INTO t VALUES ('a;b'); -- done;\nDELETE FROM t").unwrap();
/// assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a;b')", "DELETE FROM t"]);
/// ```
pub fn split_statements(sql: &str) -> Result<Vec<String>, LexError> {
    let mut statements = Vec::new();
    let mut first: Option<usize> = None;
    let mut last_end = 0;

    for token in Tokenizer::new(sql) {
        let token = token?;
        if token.is_punct(sql, b';') {
            if let Some(start) = first.take() {
                statements.push(sql[start..last_end].to_string());
            }
            continue;
        }
        if token.is_trivia() {
            continue;
        }
        if first.is_none() {
            first = Some(token.start);
        }
        last_end = token.end;
    }

    if let Some(start) = first {
        statements.push(sql[start..last_end].to_string());
    }

    Ok(statements)
}

/// Find the `)` matching the `(` at byte offset `open`.
///
/// `open` must point at a `(` outside any literal or comment. Parentheses inside
/// literals, quoted identifiers and comments are ignored. Returns `None` when
/// `open` is not a `(`, the parenthesis is unbalanced, or the text fails to lex.
pub fn find_matching_paren(sql: &str, open: usize) -> Option<usize> {
    if sql.as_bytes().get(open) != Some(&b'(') {
        return None;
    }

    let mut depth = 0usize;
    for token in Tokenizer::starting_at(sql, open) {
        let token = token.ok()?;
        if token.is_punct(sql, b'(') {
            depth += 1;
        } else if token.is_punct(sql, b')') {
            depth -= 1;
            if depth == 0 {
                return Some(token.start);
            }
        }
    }
    None
}
