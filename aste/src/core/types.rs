//! Shared deterministic types for classification and build status.
//!
//! These types carry no I/O and compare structurally, so sessions produced
//! from the same text and rules are equal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::rules::MatchSource;

/// One raw regex match before filtering.
///
/// `groups[i]` holds capture group `i + 1`; unmatched optional groups are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub text: String,
    pub groups: Vec<Option<String>>,
}

impl RawMatch {
    /// Group `0` is the whole match, `n >= 1` is capture group `n`.
    pub fn group(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return Some(&self.text);
        }
        self.groups.get(index - 1).and_then(|g| g.as_deref())
    }

    /// Value handed to the formatter chain.
    ///
    /// No capture groups: the whole match. One group: that group. Several
    /// groups: all of them, unmatched ones as empty strings.
    pub fn value(&self) -> MatchValue {
        match self.groups.as_slice() {
            [] => MatchValue::Text(self.text.clone()),
            [only] => MatchValue::Text(only.clone().unwrap_or_default()),
            many => MatchValue::Tuple(
                many.iter()
                    .map(|g| g.clone().unwrap_or_default())
                    .collect(),
            ),
        }
    }
}

/// A formatted finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MatchValue {
    Text(String),
    Integer(i64),
    Tuple(Vec<String>),
}

impl MatchValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MatchValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for MatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchValue::Text(text) => f.write_str(text),
            MatchValue::Integer(n) => write!(f, "{n}"),
            MatchValue::Tuple(items) => write!(f, "({})", items.join(", ")),
        }
    }
}

impl From<&str> for MatchValue {
    fn from(value: &str) -> Self {
        MatchValue::Text(value.to_string())
    }
}

/// Who is to blame for an escalated finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The code under build.
    #[default]
    Fatal,
    /// The build machine (locked files, I/O failures of the tools).
    Infrastructure,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => f.write_str("fatal"),
            Severity::Infrastructure => f.write_str("infrastructure"),
        }
    }
}

/// A fatal-error record produced by a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub severity: Severity,
    pub message: String,
}

impl Escalation {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// Verdict of one filter over one raw match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Accept,
    Reject,
    Escalate(Escalation),
}

/// An accepted finding and the group that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub group: String,
    pub value: MatchValue,
    /// What the producing rule was matched against.
    pub source: MatchSource,
}

/// Result of one classification call. Never reused across commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationSession {
    pub accepted: Vec<Finding>,
    pub fatal_errors: Vec<Escalation>,
}

impl ClassificationSession {
    pub fn is_fatal(&self) -> bool {
        !self.fatal_errors.is_empty()
    }

    pub fn has_infrastructure_errors(&self) -> bool {
        self.fatal_errors
            .iter()
            .any(|e| e.severity == Severity::Infrastructure)
    }

    /// Accepted values in discovery order.
    pub fn values(&self) -> Vec<&MatchValue> {
        self.accepted.iter().map(|f| &f.value).collect()
    }

    /// Accepted values rendered as strings, in discovery order.
    pub fn lines(&self) -> Vec<String> {
        self.accepted.iter().map(|f| f.value.to_string()).collect()
    }

    /// Rendered values found in the command output (not the return code).
    pub fn output_lines(&self) -> Vec<String> {
        self.accepted
            .iter()
            .filter(|f| f.source == MatchSource::Output)
            .map(|f| f.value.to_string())
            .collect()
    }

    /// Rendered values accepted by any of `groups`, in discovery order.
    pub fn lines_in(&self, groups: &[String]) -> Vec<String> {
        self.accepted
            .iter()
            .filter(|f| groups.iter().any(|g| g == &f.group))
            .map(|f| f.value.to_string())
            .collect()
    }
}

/// Revision identifiers reported by a checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub revision: String,
    pub last_changed_revision: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str, groups: &[Option<&str>]) -> RawMatch {
        RawMatch {
            text: text.to_string(),
            groups: groups.iter().map(|g| g.map(str::to_string)).collect(),
        }
    }

    #[test]
    fn value_follows_group_count() {
        assert_eq!(raw("warning X: y", &[]).value(), "warning X: y".into());
        assert_eq!(raw("2 Error(s)", &[Some("2")]).value(), "2".into());
        assert_eq!(
            raw("2 error(s),", &[Some("2 error(s)"), Some("2"), None]).value(),
            MatchValue::Tuple(vec!["2 error(s)".into(), "2".into(), String::new()])
        );
    }

    #[test]
    fn group_zero_is_whole_match() {
        let m = raw("OK: foo", &[Some("foo")]);
        assert_eq!(m.group(0), Some("OK: foo"));
        assert_eq!(m.group(1), Some("foo"));
        assert_eq!(m.group(2), None);
    }

    #[test]
    fn tuple_display_is_parenthesized() {
        let v = MatchValue::Tuple(vec!["a".into(), "b".into()]);
        assert_eq!(v.to_string(), "(a, b)");
    }
}
