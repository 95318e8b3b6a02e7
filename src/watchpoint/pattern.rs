//! Node-name patterns.
//!
//! Patterns use glob syntax over `/`-separated node names: `*` and `?` stay
//! within one scope, `**` spans any number of scopes.

use glob::{MatchOptions, Pattern};

use crate::{AppError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled set of node-name patterns; matches when any member matches.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compile `patterns`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParam` if the list is empty or a pattern is
    /// not valid glob syntax.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(AppError::InvalidParam(
                "watchpoint needs at least one pattern".into(),
            ));
        }
        let patterns = patterns
            .iter()
            .map(|raw| {
                Pattern::new(raw)
                    .map_err(|e| AppError::InvalidParam(format!("invalid pattern {raw:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether `node_name` matches any pattern.
    #[must_use]
    pub fn matches(&self, node_name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(node_name, MATCH_OPTIONS))
    }
}
