//! Declarative classification rules: patterns, filters, formatters.
//!
//! Rules come from two places: built-in rule sets ([`crate::core::rulesets`])
//! and the `[rulesets]` section of the config file. Both are described by the
//! serde-friendly [`RuleSpec`] and compiled into an immutable [`MatchRule`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{Escalation, FilterOutcome, MatchValue, RawMatch, Severity};

type FilterFn = dyn Fn(&RawMatch) -> FilterOutcome + Send + Sync;
type FormatterFn = dyn Fn(&RawMatch, MatchValue) -> MatchValue + Send + Sync;

fn default_group() -> usize {
    1
}

fn default_severe_words() -> Vec<String> {
    vec!["error".to_string(), "failed".to_string()]
}

/// Filter over one raw match. Returns a tagged [`FilterOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    Accept,
    /// Drop every match. After an escalating filter it keeps the escalated
    /// text out of the accepted findings.
    Reject,
    /// Reject when the selected group is the integer `0`.
    RejectIfZero {
        #[serde(default = "default_group")]
        group: usize,
    },
    /// Escalate when the selected group equals one of `words`, reject otherwise.
    EscalateIfSevere {
        #[serde(default = "default_group")]
        group: usize,
        #[serde(default = "default_severe_words")]
        words: Vec<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Escalate when the selected group is a nonzero integer.
    EscalateIfNonzero {
        #[serde(default = "default_group")]
        group: usize,
        #[serde(default)]
        message: Option<String>,
    },
    /// Escalate every match.
    Escalate {
        #[serde(default)]
        severity: Severity,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(skip)]
    Custom(CustomFilter),
}

impl Filter {
    pub fn custom(
        name: &str,
        f: impl Fn(&RawMatch) -> FilterOutcome + Send + Sync + 'static,
    ) -> Self {
        Filter::Custom(CustomFilter {
            name: name.to_string(),
            func: Arc::new(f),
        })
    }

    pub fn apply(&self, raw: &RawMatch) -> FilterOutcome {
        match self {
            Filter::Accept => FilterOutcome::Accept,
            Filter::Reject => FilterOutcome::Reject,
            Filter::RejectIfZero { group } => match parse_int(raw.group(*group)) {
                Some(0) => FilterOutcome::Reject,
                _ => FilterOutcome::Accept,
            },
            Filter::EscalateIfSevere {
                group,
                words,
                message,
            } => {
                let selected = raw.group(*group).unwrap_or_default();
                if words.iter().any(|w| w == selected) {
                    let text = match message {
                        Some(template) => render_template(template, raw),
                        None => format!("Aborted due to severe match: {selected}"),
                    };
                    FilterOutcome::Escalate(Escalation::new(Severity::Fatal, text))
                } else {
                    FilterOutcome::Reject
                }
            }
            Filter::EscalateIfNonzero { group, message } => match parse_int(raw.group(*group)) {
                Some(n) if n != 0 => FilterOutcome::Escalate(Escalation::new(
                    Severity::Fatal,
                    escalation_text(message.as_deref(), raw),
                )),
                _ => FilterOutcome::Accept,
            },
            Filter::Escalate { severity, message } => FilterOutcome::Escalate(Escalation::new(
                *severity,
                escalation_text(message.as_deref(), raw),
            )),
            Filter::Custom(custom) => (custom.func)(raw),
        }
    }
}

/// Output shaping applied to matches that survived every filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Formatter {
    /// Entire matched text.
    Whole,
    Group {
        index: usize,
    },
    /// `{n}` placeholders replaced with group `n` (`{0}` is the whole match).
    Template {
        text: String,
    },
    Trim,
    /// Parse the current text value as an integer; non-numeric values pass through.
    Integer,
    Prefix {
        text: String,
    },
    #[serde(skip)]
    Custom(CustomFormatter),
}

impl Formatter {
    pub fn custom(
        name: &str,
        f: impl Fn(&RawMatch, MatchValue) -> MatchValue + Send + Sync + 'static,
    ) -> Self {
        Formatter::Custom(CustomFormatter {
            name: name.to_string(),
            func: Arc::new(f),
        })
    }

    pub fn apply(&self, raw: &RawMatch, value: MatchValue) -> MatchValue {
        match self {
            Formatter::Whole => MatchValue::Text(raw.text.clone()),
            Formatter::Group { index } => {
                MatchValue::Text(raw.group(*index).unwrap_or_default().to_string())
            }
            Formatter::Template { text } => MatchValue::Text(render_template(text, raw)),
            Formatter::Trim => match value {
                MatchValue::Text(text) => MatchValue::Text(text.trim().to_string()),
                other => other,
            },
            Formatter::Integer => match value {
                MatchValue::Text(text) => match text.trim().parse::<i64>() {
                    Ok(n) => MatchValue::Integer(n),
                    Err(_) => MatchValue::Text(text),
                },
                other => other,
            },
            Formatter::Prefix { text } => MatchValue::Text(format!("{text}{value}")),
            Formatter::Custom(custom) => (custom.func)(raw, value),
        }
    }
}

#[derive(Clone)]
pub struct CustomFilter {
    name: String,
    func: Arc<FilterFn>,
}

impl fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomFilter({})", self.name)
    }
}

#[derive(Clone)]
pub struct CustomFormatter {
    name: String,
    func: Arc<FormatterFn>,
}

impl fmt::Debug for CustomFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomFormatter({})", self.name)
    }
}

/// What a rule's patterns are matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    /// Captured command output.
    #[default]
    Output,
    /// Synthetic `return code <N>` text built from the exit status.
    ReturnCode,
}

/// Serializable description of a rule, as written in config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    pub patterns: Vec<String>,
    pub filters: Vec<Filter>,
    pub formatters: Vec<Formatter>,
    pub source: MatchSource,
}

impl RuleSpec {
    pub fn compile(&self) -> Result<MatchRule> {
        if self.patterns.is_empty() {
            return Err(anyhow!("rule must have at least one pattern"));
        }
        let patterns = self
            .patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compile pattern {p:?}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(MatchRule {
            patterns,
            filters: self.filters.clone(),
            formatters: self.formatters.clone(),
            source: self.source,
        })
    }
}

/// A compiled, immutable classification rule.
#[derive(Debug, Clone)]
pub struct MatchRule {
    patterns: Vec<Regex>,
    filters: Vec<Filter>,
    formatters: Vec<Formatter>,
    source: MatchSource,
}

impl MatchRule {
    pub fn new(patterns: &[&str], filters: Vec<Filter>, formatters: Vec<Formatter>) -> Result<Self> {
        RuleSpec {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            filters,
            formatters,
            source: MatchSource::Output,
        }
        .compile()
    }

    /// Escalates when the step's return code is nonzero.
    pub fn nonzero_return_code() -> Result<Self> {
        Ok(Self {
            source: MatchSource::ReturnCode,
            ..Self::new(
                &[r"^return code (-?\d+)$"],
                vec![Filter::EscalateIfNonzero {
                    group: 1,
                    message: Some("Command exited with return code {1}".to_string()),
                }],
                Vec::new(),
            )?
        })
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn formatters(&self) -> &[Formatter] {
        &self.formatters
    }

    pub fn source(&self) -> MatchSource {
        self.source
    }
}

/// A named, ordered collection of rules applied together.
#[derive(Debug, Clone)]
pub struct MatchGroup {
    pub name: String,
    pub rules: Vec<MatchRule>,
}

/// Serializable rule set, as written in config files.
///
/// With `extends`, groups are layered over the named rule set: a group with
/// the same name replaces the inherited one, new groups are appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSetSpec {
    pub extends: Option<String>,
    pub default_groups: Vec<String>,
    pub test_failure_groups: Vec<String>,
    pub test_success_groups: Vec<String>,
    pub test_total_groups: Vec<String>,
    pub groups: BTreeMap<String, Vec<RuleSpec>>,
}

/// Groups for one tool, plus which of them a default build step uses.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub name: String,
    pub groups: Vec<MatchGroup>,
    pub default_groups: Vec<String>,
    pub test_failure_groups: Vec<String>,
    pub test_success_groups: Vec<String>,
    /// Groups whose first integer finding is the total number of tests run.
    pub test_total_groups: Vec<String>,
}

impl RuleSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Add or replace a group, keeping the position of a replaced group.
    pub fn with_group(mut self, name: &str, rules: Vec<MatchRule>) -> Self {
        self.set_group(name, rules);
        self
    }

    pub fn with_defaults(mut self, groups: &[&str]) -> Self {
        self.default_groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn set_group(&mut self, name: &str, rules: Vec<MatchRule>) {
        match self.groups.iter_mut().find(|g| g.name == name) {
            Some(existing) => existing.rules = rules,
            None => self.groups.push(MatchGroup {
                name: name.to_string(),
                rules,
            }),
        }
    }

    pub fn group(&self, name: &str) -> Option<&MatchGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Resolve group names in order, failing on the first unknown one.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<&MatchGroup>> {
        names
            .iter()
            .map(|name| {
                self.group(name).ok_or_else(|| {
                    anyhow!("rule set '{}' has no group named '{}'", self.name, name)
                })
            })
            .collect()
    }

    /// Build from a config spec, layering over `base` when the spec extends one.
    pub fn from_spec(name: &str, spec: &RuleSetSpec, base: Option<&RuleSet>) -> Result<Self> {
        let mut set = match base {
            Some(base) => RuleSet {
                name: name.to_string(),
                ..base.clone()
            },
            None => RuleSet::new(name),
        };
        for (group, rules) in &spec.groups {
            let compiled = rules
                .iter()
                .enumerate()
                .map(|(i, rule)| {
                    rule.compile()
                        .with_context(|| format!("rule set '{name}' group '{group}' rule {i}"))
                })
                .collect::<Result<Vec<_>>>()?;
            set.set_group(group, compiled);
        }
        if !spec.default_groups.is_empty() {
            set.default_groups = spec.default_groups.clone();
        }
        if !spec.test_failure_groups.is_empty() {
            set.test_failure_groups = spec.test_failure_groups.clone();
        }
        if !spec.test_success_groups.is_empty() {
            set.test_success_groups = spec.test_success_groups.clone();
        }
        if !spec.test_total_groups.is_empty() {
            set.test_total_groups = spec.test_total_groups.clone();
        }
        set.resolve(&set.default_groups)?;
        set.resolve(&set.test_failure_groups)?;
        set.resolve(&set.test_success_groups)?;
        set.resolve(&set.test_total_groups)?;
        Ok(set)
    }
}

fn parse_int(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse::<i64>().ok())
}

fn escalation_text(template: Option<&str>, raw: &RawMatch) -> String {
    match template {
        Some(template) => render_template(template, raw),
        None => raw.text.clone(),
    }
}

/// Replace `{n}` placeholders with match groups; unknown groups render empty.
pub fn render_template(template: &str, raw: &RawMatch) -> String {
    use std::sync::LazyLock;
    static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\{(\d+)\}").expect("placeholder regex is valid")
    });
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| raw.group(i))
                .unwrap_or_default()
                .to_string()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str, groups: &[&str]) -> RawMatch {
        RawMatch {
            text: text.to_string(),
            groups: groups.iter().map(|g| Some(g.to_string())).collect(),
        }
    }

    #[test]
    fn reject_if_zero_only_rejects_zero() {
        let filter = Filter::RejectIfZero { group: 2 };
        let zero = raw("0 failed,", &["0 failed", "0", "failed"]);
        let two = raw("2 failed,", &["2 failed", "2", "failed"]);
        assert_eq!(filter.apply(&zero), FilterOutcome::Reject);
        assert_eq!(filter.apply(&two), FilterOutcome::Accept);
    }

    #[test]
    fn escalate_if_severe_matches_words_exactly() {
        let filter = Filter::EscalateIfSevere {
            group: 3,
            words: default_severe_words(),
            message: None,
        };
        let error = raw("2 error(s),", &["2 error(s)", "2", "error"]);
        let warning = raw("(3 warning(s))", &["3 warning(s)", "3", "warning"]);
        assert_eq!(
            filter.apply(&error),
            FilterOutcome::Escalate(Escalation::new(
                Severity::Fatal,
                "Aborted due to severe match: error"
            ))
        );
        assert_eq!(filter.apply(&warning), FilterOutcome::Reject);
    }

    #[test]
    fn escalate_if_nonzero_uses_whole_match_by_default() {
        let filter = Filter::EscalateIfNonzero {
            group: 1,
            message: None,
        };
        assert_eq!(
            filter.apply(&raw("2 Error(s)", &["2"])),
            FilterOutcome::Escalate(Escalation::new(Severity::Fatal, "2 Error(s)"))
        );
        assert_eq!(filter.apply(&raw("0 Error(s)", &["0"])), FilterOutcome::Accept);
    }

    #[test]
    fn template_formatter_substitutes_groups() {
        let m = raw("2 error(s),", &["2 error(s)", "2", "error"]);
        let f = Formatter::Template {
            text: "{2} {3}".to_string(),
        };
        assert_eq!(f.apply(&m, m.value()), "2 error".into());
    }

    #[test]
    fn integer_formatter_parses_text() {
        let m = raw("7", &[]);
        assert_eq!(
            Formatter::Integer.apply(&m, m.value()),
            MatchValue::Integer(7)
        );
    }

    #[test]
    fn filter_specs_deserialize_from_toml() {
        let spec: RuleSpec = toml::from_str(
            r#"
patterns = ['(\d+) Error\(s\)']
filters = [{ kind = "reject_if_zero" }, { kind = "escalate", severity = "infrastructure" }]
formatters = [{ kind = "template", text = "{1} errors" }]
"#,
        )
        .expect("parse");
        assert!(matches!(spec.filters[0], Filter::RejectIfZero { group: 1 }));
        assert!(matches!(
            spec.filters[1],
            Filter::Escalate {
                severity: Severity::Infrastructure,
                ..
            }
        ));
        spec.compile().expect("compile");
    }

    #[test]
    fn compile_rejects_bad_patterns() {
        let spec = RuleSpec {
            patterns: vec!["(unclosed".to_string()],
            ..RuleSpec::default()
        };
        assert!(spec.compile().is_err());
    }

    #[test]
    fn extending_replaces_named_groups() {
        let base = RuleSet::new("base")
            .with_group(
                "general",
                vec![MatchRule::new(&["warning"], vec![], vec![]).expect("rule")],
            )
            .with_defaults(&["general"]);
        let spec: RuleSetSpec = toml::from_str(
            r#"
[[groups.general]]
patterns = ["note"]

[[groups.extra]]
patterns = ["hint"]
"#,
        )
        .expect("parse");
        let set = RuleSet::from_spec("custom", &spec, Some(&base)).expect("set");
        assert_eq!(set.groups.len(), 2);
        assert_eq!(set.groups[0].rules[0].patterns()[0].as_str(), "note");
        assert_eq!(set.default_groups, vec!["general".to_string()]);
    }

    #[test]
    fn unknown_default_group_is_rejected() {
        let spec = RuleSetSpec {
            default_groups: vec!["missing".to_string()],
            ..RuleSetSpec::default()
        };
        assert!(RuleSet::from_spec("x", &spec, None).is_err());
    }
}
