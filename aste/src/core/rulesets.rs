//! Built-in rule sets for the tools aste drives, and the rule book that
//! merges them with rule sets from the config file.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};

use crate::core::rules::{Filter, Formatter, MatchRule, RuleSet, RuleSetSpec};
use crate::core::types::Severity;

pub const MSBUILD: &str = "msbuild";
pub const SBT: &str = "sbt";
pub const TESTS: &str = "tests";
/// Group of [`tests`] matching `<name> FAILED` lines of alltests runs.
pub const ALLTESTS_GROUP: &str = "alltests";

const FILE_IN_USE: &str =
    "The process cannot access the file because it is being used by another process";

/// MSBuild/devenv messages in the canonical `origin: category code: text` form.
const MSBUILD_FRIENDLY: &str = r"(?imx)
^(
    (?:
        (?:
            ([A-Z]:\\.*?)\((.*?)\)    # absolute path with (line,column)
                |
            (.*?)                     # or any origin
        ):\x20
    )?
    [^:]?                             # subcategory
    (error|warning)\x20               # category
    (\w+)                             # code
    (:\x20.*)?                        # text
)$";

fn infrastructure() -> Filter {
    Filter::Escalate {
        severity: Severity::Infrastructure,
        message: None,
    }
}

/// Rule set for MSBuild, devenv and nmake output.
pub fn msbuild() -> Result<RuleSet> {
    let counting = MatchRule::new(
        &[
            r"((\d+) (error)\(s\)),",
            r"((\d+) (warning)\(s\))",
            r"(, (\d+) (warning)s)",
            r"(-- (\d+) (error)s,)",
            r"(, (\d+) (failed),)",
        ],
        vec![
            Filter::RejectIfZero { group: 2 },
            Filter::EscalateIfSevere {
                group: 3,
                words: vec!["error".to_string(), "failed".to_string()],
                message: None,
            },
        ],
        vec![Formatter::Template {
            text: "{2} {3}".to_string(),
        }],
    )?;

    Ok(RuleSet::new(MSBUILD)
        .with_group(
            "msbuild-friendly",
            vec![MatchRule::new(
                &[MSBUILD_FRIENDLY],
                vec![Filter::Accept],
                vec![Formatter::Group { index: 1 }],
            )?],
        )
        .with_group(
            "envfatals",
            vec![
                MatchRule::new(
                    &[r"\d+>?(ERROR copying)"],
                    vec![infrastructure()],
                    vec![Formatter::Group { index: 1 }],
                )?,
                MatchRule::new(&[FILE_IN_USE], vec![infrastructure()], vec![])?,
            ],
        )
        .with_group(
            "general",
            vec![MatchRule::new(
                &[r"warning \w+: .*", r"NMAKE : fatal error \w+: .*"],
                vec![Filter::Accept],
                vec![],
            )?],
        )
        .with_group("counting", vec![counting])
        .with_defaults(&["msbuild-friendly", "envfatals", "general", "counting"]))
}

/// Rule set for sbt (Scala) builds.
pub fn sbt() -> Result<RuleSet> {
    Ok(RuleSet::new(SBT)
        .with_group(
            "envfatals",
            vec![
                MatchRule::new(&[r"(java.io.IOException: .*)"], vec![infrastructure()], vec![])?,
                MatchRule::new(&[FILE_IN_USE], vec![infrastructure()], vec![])?,
            ],
        )
        .with_group(
            "build",
            vec![
                MatchRule::new(&[r"(\[warn\] .+:\d+: .*)"], vec![Filter::Accept], vec![])?,
                MatchRule::new(
                    &[r"(\[error\] .+:\d+: .*)"],
                    vec![Filter::Escalate {
                        severity: Severity::Fatal,
                        message: Some("Aborted due to error: {1}".to_string()),
                    }],
                    vec![],
                )?,
            ],
        )
        .with_defaults(&["envfatals", "build"]))
}

/// Rule set for test drivers that print one verdict line per test.
pub fn tests() -> Result<RuleSet> {
    let mut set = RuleSet::new(TESTS)
        .with_group(
            "failures",
            vec![MatchRule::new(
                &[r"(?m)^FAIL: (.*?)$", r"(?m)^ERROR: (.*?)$"],
                vec![Filter::Accept],
                vec![],
            )?],
        )
        .with_group(
            "successes",
            vec![MatchRule::new(&[r"(?m)^OK: (.*?)$"], vec![Filter::Accept], vec![])?],
        )
        .with_group(
            "totals",
            vec![MatchRule::new(
                &[
                    r"SUMMARY: completed (\d+) tests successfully\.",
                    r"SUMMARY: \d+ of (\d+) tests failed\.",
                ],
                vec![Filter::Accept],
                vec![Formatter::Integer],
            )?],
        )
        .with_group(
            ALLTESTS_GROUP,
            vec![MatchRule::new(&[r"(.*?) FAILED"], vec![Filter::Accept], vec![])?],
        );
    set.test_failure_groups = vec!["failures".to_string()];
    set.test_success_groups = vec!["successes".to_string()];
    set.test_total_groups = vec!["totals".to_string()];
    set.default_groups = vec![
        "failures".to_string(),
        "successes".to_string(),
        "totals".to_string(),
    ];
    Ok(set)
}

/// All rule sets available to tasks, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    sets: BTreeMap<String, RuleSet>,
}

impl RuleBook {
    pub fn builtin() -> Result<Self> {
        let mut sets = BTreeMap::new();
        for set in [msbuild()?, sbt()?, tests()?] {
            sets.insert(set.name.clone(), set);
        }
        Ok(Self { sets })
    }

    /// Built-in sets plus config sets; a config set with a built-in name replaces it.
    pub fn with_specs(specs: &BTreeMap<String, RuleSetSpec>) -> Result<Self> {
        let mut book = Self::builtin()?;
        for (name, spec) in specs {
            let base = match spec.extends.as_deref() {
                Some(parent) => Some(
                    book.get(parent)
                        .with_context(|| format!("rule set '{name}' extends '{parent}'"))?
                        .clone(),
                ),
                None => None,
            };
            let set = RuleSet::from_spec(name, spec, base.as_ref())?;
            book.sets.insert(name.clone(), set);
        }
        Ok(book)
    }

    pub fn insert(&mut self, set: RuleSet) {
        self.sets.insert(set.name.clone(), set);
    }

    pub fn get(&self, name: &str) -> Result<&RuleSet> {
        self.sets
            .get(name)
            .ok_or_else(|| anyhow!("unknown rule set '{name}'"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }
}
