//! Output classification: runs rule groups over text and collects findings.

use anyhow::Result;

use crate::core::rules::{MatchRule, MatchSource, RuleSet};
use crate::core::types::{ClassificationSession, FilterOutcome, Finding, RawMatch};

/// Synthetic text that `return_code` rules are matched against.
pub fn return_code_text(code: i32) -> String {
    format!("return code {code}")
}

/// Classify `text` with the named groups of `rules`, in the given order.
///
/// Unknown group names fail before anything is classified.
pub fn classify(rules: &RuleSet, groups: &[String], text: &str) -> Result<ClassificationSession> {
    classify_with_return_code(rules, groups, text, None)
}

/// Like [`classify`], also feeding `return_code` rules when a code is known.
pub fn classify_with_return_code(
    rules: &RuleSet,
    groups: &[String],
    text: &str,
    return_code: Option<i32>,
) -> Result<ClassificationSession> {
    let resolved = rules.resolve(groups)?;
    let code_text = return_code.map(return_code_text);

    let mut session = ClassificationSession::default();
    for group in resolved {
        for rule in &group.rules {
            let haystack = match rule.source() {
                MatchSource::Output => text,
                MatchSource::ReturnCode => match code_text.as_deref() {
                    Some(code_text) => code_text,
                    None => continue,
                },
            };
            apply_rule(rule, &group.name, haystack, &mut session);
        }
    }
    Ok(session)
}

fn apply_rule(rule: &MatchRule, group: &str, haystack: &str, session: &mut ClassificationSession) {
    for pattern in rule.patterns() {
        for caps in pattern.captures_iter(haystack) {
            let raw = RawMatch {
                text: caps[0].to_string(),
                groups: (1..caps.len())
                    .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
                    .collect(),
            };
            if !run_filters(rule, &raw, session) {
                continue;
            }
            let value = rule
                .formatters()
                .iter()
                .fold(raw.value(), |value, formatter| formatter.apply(&raw, value));
            session.accepted.push(Finding {
                group: group.to_string(),
                value,
                source: rule.source(),
            });
        }
    }
}

/// Returns `false` when a filter rejected the match.
fn run_filters(rule: &MatchRule, raw: &RawMatch, session: &mut ClassificationSession) -> bool {
    for filter in rule.filters() {
        match filter.apply(raw) {
            FilterOutcome::Accept => {}
            FilterOutcome::Reject => return false,
            FilterOutcome::Escalate(escalation) => session.fatal_errors.push(escalation),
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::{Filter, Formatter};
    use crate::core::types::{Escalation, MatchValue, Severity};

    fn names(groups: &[&str]) -> Vec<String> {
        groups.iter().map(|g| g.to_string()).collect()
    }

    fn compile_errors() -> RuleSet {
        RuleSet::new("cl")
            .with_group(
                "primary",
                vec![MatchRule::new(&[r"error C\d+.*"], vec![Filter::Accept], vec![]).expect("rule")],
            )
            .with_group(
                "counting",
                vec![
                    MatchRule::new(
                        &[r"(\d+) Error\(s\)"],
                        vec![
                            Filter::EscalateIfNonzero {
                                group: 1,
                                message: None,
                            },
                            Filter::Reject,
                        ],
                        vec![],
                    )
                    .expect("rule"),
                ],
            )
    }

    #[test]
    fn compiler_output_yields_finding_and_fatal_error() {
        let text = "1>foo.cpp(10): error C2143: syntax error\n2 Error(s), 0 Warning(s)";
        let session =
            classify(&compile_errors(), &names(&["primary", "counting"]), text).expect("classify");
        assert_eq!(session.lines(), vec!["error C2143: syntax error".to_string()]);
        assert_eq!(
            session.fatal_errors,
            vec![Escalation::new(Severity::Fatal, "2 Error(s)")]
        );
    }

    #[test]
    fn empty_filter_chain_accepts_every_match() {
        let rules = RuleSet::new("t").with_group(
            "warnings",
            vec![MatchRule::new(&[r"warning \w+: .*", r"note: .*"], vec![], vec![]).expect("rule")],
        );
        let text = "warning W1: a\nnote: b\nwarning W2: c\n";
        let session = classify(&rules, &names(&["warnings"]), text).expect("classify");
        // Pattern order first, then position.
        assert_eq!(
            session.lines(),
            vec!["warning W1: a", "warning W2: c", "note: b"]
        );
        assert!(session.fatal_errors.is_empty());
    }

    #[test]
    fn rejection_never_records_fatal_errors() {
        let rules = RuleSet::new("t").with_group(
            "counting",
            vec![
                MatchRule::new(
                    &[r"(, (\d+) (failed),)"],
                    vec![
                        Filter::RejectIfZero { group: 2 },
                        Filter::EscalateIfSevere {
                            group: 3,
                            words: vec!["error".into(), "failed".into()],
                            message: None,
                        },
                    ],
                    vec![Formatter::Template {
                        text: "{2} {3}".into(),
                    }],
                )
                .expect("rule"),
            ],
        );
        let ok = classify(&rules, &names(&["counting"]), "Build: 3 succeeded, 0 failed, 0 skipped")
            .expect("classify");
        assert_eq!(ok, ClassificationSession::default());

        let bad = classify(&rules, &names(&["counting"]), "Build: 1 succeeded, 2 failed, 0 skipped")
            .expect("classify");
        assert_eq!(bad.lines(), vec!["2 failed".to_string()]);
        assert_eq!(bad.fatal_errors.len(), 1);
    }

    #[test]
    fn escalated_match_can_still_be_rejected() {
        let rules = RuleSet::new("t").with_group(
            "g",
            vec![
                MatchRule::new(
                    &["boom"],
                    vec![
                        Filter::Escalate {
                            severity: Severity::Infrastructure,
                            message: None,
                        },
                        Filter::custom("drop", |_| FilterOutcome::Reject),
                    ],
                    vec![],
                )
                .expect("rule"),
            ],
        );
        let session = classify(&rules, &names(&["g"]), "boom").expect("classify");
        assert!(session.accepted.is_empty());
        assert!(session.has_infrastructure_errors());
    }

    #[test]
    fn classification_is_repeatable() {
        let rules = compile_errors();
        let groups = names(&["primary", "counting"]);
        let text = "error C1001: internal\n3 Error(s)";
        let first = classify(&rules, &groups, text).expect("first");
        let second = classify(&rules, &groups, text).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_group_fails_before_classifying() {
        let err = classify(&compile_errors(), &names(&["primary", "nope"]), "error C1: x")
            .expect_err("unknown group");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn return_code_rules_only_see_synthetic_text() {
        let rules = RuleSet::new("t").with_group(
            "rc",
            vec![MatchRule::nonzero_return_code().expect("rule")],
        );
        let groups = names(&["rc"]);

        let clean = classify_with_return_code(&rules, &groups, "return code 3", Some(0))
            .expect("classify");
        assert!(clean.fatal_errors.is_empty());

        let failed = classify_with_return_code(&rules, &groups, "", Some(2)).expect("classify");
        assert_eq!(
            failed.fatal_errors,
            vec![Escalation::new(
                Severity::Fatal,
                "Command exited with return code 2"
            )]
        );

        let unknown = classify(&rules, &groups, "return code 9").expect("classify");
        assert!(unknown.fatal_errors.is_empty());
    }

    #[test]
    fn formatters_chain_left_to_right() {
        let rules = RuleSet::new("t").with_group(
            "summary",
            vec![
                MatchRule::new(
                    &[r"SUMMARY: completed (\d+) tests"],
                    vec![],
                    vec![Formatter::Trim, Formatter::Integer],
                )
                .expect("rule"),
            ],
        );
        let session =
            classify(&rules, &names(&["summary"]), "SUMMARY: completed 12 tests successfully.")
                .expect("classify");
        assert_eq!(session.values(), vec![&MatchValue::Integer(12)]);
    }
}
