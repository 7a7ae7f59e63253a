// ABOUTME: Utility functions for SQL quoting, retries and process identity
// ABOUTME: Shared by the store implementation and the sync components

use anyhow::Result;
use std::time::Duration;

/// Quote a MySQL identifier (database, table, column)
///
/// MySQL uses backticks for identifier quoting. Escapes embedded backticks
/// by doubling them.
///
/// # Examples
///
/// ```
/// use branch_replicator::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("users"), "`users`");
/// assert_eq!(quote_mysql_ident("user`name"), "`user``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Quote a MySQL string literal
///
/// Escapes backslashes and single quotes, since MySQL treats backslash as an
/// escape character inside literals by default.
///
/// # Examples
///
/// ```
/// use branch_replicator::utils::quote_mysql_literal;
/// assert_eq!(quote_mysql_literal("stage://s1"), "'stage://s1'");
/// assert_eq!(quote_mysql_literal("it's"), "'it''s'");
/// assert_eq!(quote_mysql_literal(r"a\b"), r"'a\\b'");
/// ```
pub fn quote_mysql_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length so names taken from remote
/// catalogs cannot inject lines into the log.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Retry an async operation a fixed number of times with a fixed delay
///
/// Returns the successful result or the last error after `max_retries`
/// additional attempts.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use branch_replicator::utils::retry_with_fixed_delay;
/// # async fn example() -> Result<()> {
/// let result = retry_with_fixed_delay(
///     || async { Ok("success") },
///     3,
///     Duration::from_secs(2),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_fixed_delay<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Build the identity this process uses as lease owner.
///
/// Format: `<hostname>_<pid>_<6 hex chars>`. The random suffix keeps two
/// engines inside one process distinguishable.
pub fn instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", hostname(), std::process::id(), &suffix[..6])
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).to_string();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        sanitize_identifier(&name)
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
