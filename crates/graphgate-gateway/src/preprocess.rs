//! Query rewriting between validation and execution, plus read/write classification.

use regex::Regex;
use tracing::debug;

use graphgate_core::{GatewayError, GatewayResult};

/// What every schema alias is rewritten to.
pub const SHOW_TABLES_QUERY: &str = "CALL show_tables() RETURN *";

/// Whether a statement may modify the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKind::Read => write!(f, "read"),
            QueryKind::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPreprocessor {
    max_result_rows: Option<usize>,
    alias_re: Regex,
    return_re: Regex,
    limit_re: Regex,
    write_re: Regex,
}

impl QueryPreprocessor {
    pub fn new(max_result_rows: Option<usize>) -> GatewayResult<Self> {
        Ok(Self {
            max_result_rows,
            alias_re: compile(r"(?i)^(?:SHOW\s+TABLES|SHOW\s+DATABASES|CALL\s+SCHEMA)$")?,
            return_re: compile(r"(?i)\bRETURN\b")?,
            limit_re: compile(r"(?i)\bLIMIT\b")?,
            write_re: compile(
                r"(?i)\b(?:CREATE|MERGE|SET|DELETE|DETACH|REMOVE|DROP|ALTER|COPY|INSTALL|LOAD)\b",
            )?,
        })
    }

    /// Rewrite validated text into what the engine runs.
    ///
    /// Trailing `;` and whitespace are dropped, schema aliases become
    /// [`SHOW_TABLES_QUERY`], and a `RETURN` without `LIMIT` gets the
    /// configured row cap appended.
    pub fn prepare(&self, text: &str) -> String {
        let query = text
            .trim()
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace());

        if self.alias_re.is_match(query) {
            debug!(alias = query, "rewrote schema alias");
            return SHOW_TABLES_QUERY.to_string();
        }

        match self.max_result_rows {
            Some(limit) if self.return_re.is_match(query) && !self.limit_re.is_match(query) => {
                debug!(limit, "appended automatic LIMIT");
                format!("{query} LIMIT {limit}")
            }
            _ => query.to_string(),
        }
    }

    /// Classify by keyword. A write keyword anywhere, even inside a string
    /// literal, makes the statement a write.
    pub fn classify(&self, query: &str) -> QueryKind {
        if self.write_re.is_match(query) {
            QueryKind::Write
        } else {
            QueryKind::Read
        }
    }
}

fn compile(pattern: &str) -> GatewayResult<Regex> {
    Regex::new(pattern).map_err(|e| GatewayError::Config(format!("bad preprocessor pattern: {e}")))
}
