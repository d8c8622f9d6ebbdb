//! Token bookkeeping for change-driven redeploys.
//!
//! Every change source reports an opaque [`Token`] describing its current
//! upstream state. This crate tracks, per source name:
//!
//! - **Observed token**: what the most recent poll returned.
//! - **Applied token**: what the artifacts currently in use were built from.
//!
//! A source is *changed* when the two differ. The applied token advances only
//! through [`SourceStates::commit`], which the update loop calls right after a
//! source's rebuild succeeded.
//!
//! # Invariants
//!
//! - A never-seen source has an empty applied token, so a source whose first
//!   observation is also empty is not considered changed.
//! - `commit` copies observed into applied for exactly one source; other
//!   sources are untouched, which keeps partial progress of a failed pass.
//! - Nothing here performs I/O; all decisions are deterministic given the
//!   sequence of `observe`/`commit` calls.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Commit requested for a source that was never observed.
    #[error("source not observed: {0}")]
    UnknownSource(String),
}

/// Opaque, comparable identity of a source's upstream state.
///
/// Typically a commit hash, an archive timestamp, or a composite of both.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(String);

impl Token {
    /// Create a token from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build a composite token from a base revision and a dependent identity.
    ///
    /// An empty `extra` yields the base unchanged so that enabling an empty
    /// patch set does not force a rebuild.
    pub fn composite(base: &str, extra: &str) -> Self {
        if extra.is_empty() {
            Self(base.to_string())
        } else {
            Self(format!("{base}/{extra}"))
        }
    }

    /// Get the token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty token.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Applied/observed pair for a single source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceState {
    /// Token the artifacts in use were built from.
    pub applied: Token,

    /// Token returned by the most recent poll.
    pub observed: Token,
}

impl SourceState {
    /// Returns true if a rebuild is due for this source.
    pub fn is_changed(&self) -> bool {
        self.applied != self.observed
    }
}

/// A detected difference between applied and observed tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Source name.
    pub source: String,

    /// Previously applied token.
    pub from: Token,

    /// Newly observed token.
    pub to: Token,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} changed {} -> {}", self.source, self.from, self.to)
    }
}

/// Per-source token state, keyed by unique source name.
#[derive(Debug, Clone, Default)]
pub struct SourceStates {
    states: BTreeMap<String, SourceState>,
}

impl SourceStates {
    /// Create an empty state table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly polled token for a source.
    pub fn observe(&mut self, source: &str, token: Token) {
        self.states.entry(source.to_string()).or_default().observed = token;
    }

    /// Get the state of a source, if it was ever observed.
    pub fn get(&self, source: &str) -> Option<&SourceState> {
        self.states.get(source)
    }

    /// Returns true if the source's observed token differs from its applied one.
    pub fn is_changed(&self, source: &str) -> bool {
        self.states.get(source).is_some_and(SourceState::is_changed)
    }

    /// List changes for the given sources, preserving the caller's order.
    pub fn changes<'a, I>(&self, order: I) -> Vec<Change>
    where
        I: IntoIterator<Item = &'a str>,
    {
        order
            .into_iter()
            .filter_map(|name| {
                let state = self.states.get(name)?;
                state.is_changed().then(|| Change {
                    source: name.to_string(),
                    from: state.applied.clone(),
                    to: state.observed.clone(),
                })
            })
            .collect()
    }

    /// Returns true if any tracked source is changed.
    pub fn any_changed(&self) -> bool {
        self.states.values().any(SourceState::is_changed)
    }

    /// Advance a source's applied token to its observed token.
    ///
    /// Call only after the source's rebuild succeeded.
    pub fn commit(&mut self, source: &str) -> Result<(), ReconcileError> {
        let state = self
            .states
            .get_mut(source)
            .ok_or_else(|| ReconcileError::UnknownSource(source.to_string()))?;
        state.applied = state.observed.clone();
        Ok(())
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no source was observed yet.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("abc123", "", "abc123")]
    #[case("abc123", "p7", "abc123/p7")]
    #[case("", "p7", "/p7")]
    fn test_composite_token(#[case] base: &str, #[case] extra: &str, #[case] expected: &str) {
        assert_eq!(Token::composite(base, extra).as_str(), expected);
    }

    #[test]
    fn test_empty_first_observation_is_not_a_change() {
        let mut states = SourceStates::new();
        states.observe("dashboard", Token::default());
        assert!(!states.is_changed("dashboard"));
        assert!(!states.any_changed());
    }

    #[test]
    fn test_commit_advances_applied() {
        let mut states = SourceStates::new();
        states.observe("kernel", Token::new("abc123"));
        assert!(states.is_changed("kernel"));

        states.commit("kernel").unwrap();
        assert!(!states.is_changed("kernel"));
        assert_eq!(states.get("kernel").unwrap().applied.as_str(), "abc123");
    }

    #[test]
    fn test_commit_unknown_source() {
        let mut states = SourceStates::new();
        assert_eq!(
            states.commit("nope"),
            Err(ReconcileError::UnknownSource("nope".to_string()))
        );
    }

    #[test]
    fn test_partial_commit_keeps_other_sources_stale() {
        let mut states = SourceStates::new();
        states.observe("syzkaller", Token::new("s1"));
        states.observe("kernel", Token::new("k1"));

        states.commit("syzkaller").unwrap();

        let changes = states.changes(["syzkaller", "kernel"]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].source, "kernel");
        assert_eq!(changes[0].from, Token::default());
        assert_eq!(changes[0].to, Token::new("k1"));
    }

    #[test]
    fn test_changes_follow_caller_order() {
        let mut states = SourceStates::new();
        states.observe("b", Token::new("1"));
        states.observe("a", Token::new("1"));

        let names: Vec<_> = states
            .changes(["b", "a"])
            .into_iter()
            .map(|c| c.source)
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_patch_set_change_alone_triggers() {
        let mut states = SourceStates::new();
        states.observe("kernel", Token::composite("abc123", ""));
        states.commit("kernel").unwrap();

        states.observe("kernel", Token::composite("abc123", "p7"));
        let changes = states.changes(["kernel"]);
        assert_eq!(changes[0].to_string(), "kernel changed abc123 -> abc123/p7");
    }

    proptest! {
        #[test]
        fn prop_commit_touches_only_named_source(
            tokens in proptest::collection::vec("[a-f0-9]{0,8}", 1..6),
            pick in 0usize..6,
        ) {
            let names: Vec<String> = (0..tokens.len()).map(|i| format!("src{i}")).collect();
            let mut states = SourceStates::new();
            for (name, token) in names.iter().zip(&tokens) {
                states.observe(name, Token::new(token.clone()));
            }
            let before = states.clone();
            let target = &names[pick % names.len()];

            states.commit(target).unwrap();

            prop_assert!(!states.is_changed(target));
            for name in names.iter().filter(|n| *n != target) {
                prop_assert_eq!(states.get(name), before.get(name));
            }
        }

        #[test]
        fn prop_observing_committed_token_is_stable(token in "[a-z0-9/]{0,16}") {
            let mut states = SourceStates::new();
            states.observe("s", Token::new(token.clone()));
            states.commit("s").unwrap();
            states.observe("s", Token::new(token));
            prop_assert!(!states.any_changed());
        }
    }
}
