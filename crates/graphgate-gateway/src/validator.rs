//! Pre-execution admissibility checks on query text.
//!
//! Rules run in a fixed order and the first failure wins:
//!
//! 1. blank text is rejected
//! 2. text longer than `max_query_length` characters is rejected
//! 3. text containing a deny-listed pattern is rejected (case-insensitive,
//!    runs of whitespace treated as one space)
//! 4. a `SKIP` above `reject_skip_threshold` is rejected; one above
//!    `warn_skip_threshold` is logged and admitted
//!
//! This is a coarse safety net, not a parser. Queries that pass may still
//! be refused by the engine.

use regex::Regex;
use tracing::warn;

use graphgate_core::{GatewayError, GatewayResult, ValidationConfig, ValidationResult};

pub const EMPTY_QUERY_MESSAGE: &str = "Query is empty";
pub const SKIP_TOO_HIGH_MESSAGE: &str = "SKIP value too high";

#[derive(Debug, Clone)]
pub struct QueryValidator {
    config: ValidationConfig,
    /// `(pattern as configured, normalized form)` pairs.
    denied: Vec<(String, String)>,
    skip_re: Regex,
    string_filter_re: Regex,
    and_re: Regex,
    in_list_re: Regex,
}

impl QueryValidator {
    pub fn new(config: ValidationConfig) -> GatewayResult<Self> {
        config.validate()?;
        let denied = config
            .denied_patterns
            .iter()
            .map(|p| (p.trim().to_string(), normalize(p)))
            .collect();

        Ok(Self {
            denied,
            skip_re: compile(r"(?i)\bSKIP\s+(\d+)")?,
            string_filter_re: compile(r#"(?is)\bWHERE\b.*\b\w+\.\w+\s*=\s*['"]"#)?,
            and_re: compile(r"(?i)\bAND\b")?,
            in_list_re: compile(r"(?i)\bIN\s*\(")?,
            config,
        })
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Decide whether `text` may be sent to the engine.
    pub fn validate(&self, text: &str) -> ValidationResult {
        if text.trim().is_empty() {
            return ValidationResult::reject(EMPTY_QUERY_MESSAGE);
        }

        let length = text.chars().count();
        if length > self.config.max_query_length {
            return ValidationResult::reject(format!(
                "Query is too long ({length} characters, max {})",
                self.config.max_query_length
            ));
        }

        let normalized = normalize(text);
        if let Some((pattern, _)) = self
            .denied
            .iter()
            .find(|(_, needle)| normalized.contains(needle.as_str()))
        {
            return ValidationResult::reject(format!(
                "Query contains potentially dangerous pattern: {pattern}"
            ));
        }

        if let Some(skip) = self.max_skip(text) {
            if skip > self.config.reject_skip_threshold {
                return ValidationResult::reject(SKIP_TOO_HIGH_MESSAGE);
            }
            if skip > self.config.warn_skip_threshold {
                warn!(
                    skip,
                    threshold = self.config.warn_skip_threshold,
                    "high SKIP value may be slow"
                );
            }
        }

        for problem in self.problem_patterns(text) {
            warn!(problem, "query contains a potentially slow pattern");
        }

        ValidationResult::ok()
    }

    /// Largest `SKIP` offset in `text`. Offsets too large for `u64` count as `u64::MAX`.
    pub fn max_skip(&self, text: &str) -> Option<u64> {
        self.skip_re
            .captures_iter(text)
            .map(|caps| caps[1].parse::<u64>().unwrap_or(u64::MAX))
            .max()
    }

    /// Shapes known to be slow on the engine. Advisory only.
    pub fn problem_patterns(&self, text: &str) -> Vec<&'static str> {
        let mut problems = Vec::new();
        if self.string_filter_re.is_match(text) {
            problems.push("string equality filter in WHERE clause");
        }
        if self.and_re.find_iter(text).count() >= 3 {
            problems.push("three or more AND conditions");
        }
        if self.in_list_re.is_match(text) {
            problems.push("IN list or subquery");
        }
        problems
    }
}

fn compile(pattern: &str) -> GatewayResult<Regex> {
    Regex::new(pattern).map_err(|e| GatewayError::Config(format!("bad validator pattern: {e}")))
}

/// Lowercase and collapse whitespace runs to a single space.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
