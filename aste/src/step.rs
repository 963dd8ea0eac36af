//! Running one build step: execute a command, classify its output, decide.
//!
//! The executor never touches project state except where a step mode says so
//! (test steps fill the test lists, alltests runs record timings). Whether a
//! project built successfully is decided by the pipeline in [`crate::task`].

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::classifier::classify_with_return_code;
use crate::core::environment::{Environment, ProjectRecord};
use crate::core::rules::RuleSet;
use crate::core::types::{ClassificationSession, Escalation, MatchValue, Severity};
use crate::error::{BuildError, NonBuildError};
use crate::io::process::{ProcessOutput, ProcessRunner};
use crate::io::run_log::RunLog;

/// Outcome of a classified step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub command: String,
    pub return_code: i32,
    pub raw_output: String,
    pub session: ClassificationSession,
}

/// One entry of an `alltests.txt` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    /// Lower-cased: `use`, `long`, ...
    pub category: String,
}

/// An `alltests.txt` list and how to judge its tests.
#[derive(Debug, Clone, Copy)]
pub struct TestSuite<'a> {
    /// Timing category and summary label.
    pub name: &'a str,
    pub list: &'a Path,
    /// Run `use` tests only, skipping `long` ones.
    pub short_only: bool,
    pub rules: &'a RuleSet,
    pub groups: &'a [String],
}

/// Summary of an alltests run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub executed: usize,
    pub failed: Vec<String>,
}

pub struct StepExecutor<'a> {
    runner: &'a dyn ProcessRunner,
    log: &'a RunLog,
}

impl<'a> StepExecutor<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, log: &'a RunLog) -> Self {
        Self { runner, log }
    }

    /// Run and log `command` without judging the result.
    #[instrument(skip_all)]
    pub fn run(&self, command: &str, workdir: Option<&Path>) -> Result<ProcessOutput> {
        match workdir {
            Some(dir) => self.log.note(&format!("{command} (in {})", dir.display())),
            None => self.log.note(command),
        }
        let output = self
            .runner
            .execute(command, workdir, &mut |line| self.log.output_line(line))?;
        debug!(return_code = output.return_code, "step command finished");
        Ok(output)
    }

    /// Like [`run`](Self::run), but any nonzero return code is a build error.
    pub fn run_safely(&self, command: &str, workdir: Option<&Path>) -> Result<ProcessOutput> {
        let output = self.run(command, workdir)?;
        if output.return_code != 0 {
            return Err(BuildError::new(format!(
                "{command} failed with return code {}",
                output.return_code
            ))
                .with_value("command", command)
                .with_value("returncode", output.return_code)
                .into());
        }
        Ok(output)
    }

    /// Run `command` and classify its output with `groups` of `rules`.
    pub fn run_step(
        &self,
        command: &str,
        workdir: Option<&Path>,
        rules: &RuleSet,
        groups: &[String],
    ) -> Result<StepResult> {
        rules.resolve(groups)?;
        let output = self.run(command, workdir)?;
        let session =
            classify_with_return_code(rules, groups, &output.output, Some(output.return_code))?;
        Ok(StepResult {
            command: command.to_string(),
            return_code: output.return_code,
            raw_output: output.output,
            session,
        })
    }

    /// Classified build step: findings go to the summary, escalations fail it.
    #[instrument(skip_all, fields(ruleset = %rules.name))]
    pub fn run_default_build_step(
        &self,
        command: &str,
        workdir: Option<&Path>,
        rules: &RuleSet,
        groups: &[String],
    ) -> Result<StepResult> {
        let result = self.run_step(command, workdir, rules, groups)?;
        self.log_findings(&result);
        fail_on_escalations(&result.session.fatal_errors, &result.command)?;
        Ok(result)
    }

    /// Test step: failing and passing tests go to `record`.
    #[instrument(skip_all, fields(project = %record.name))]
    pub fn run_test_step(
        &self,
        record: &mut ProjectRecord,
        command: &str,
        workdir: Option<&Path>,
        rules: &RuleSet,
        groups: &[String],
    ) -> Result<StepResult> {
        let result = self.run_step(command, workdir, rules, groups)?;
        let failed = result.session.lines_in(&rules.test_failure_groups);
        let succeeded = result.session.lines_in(&rules.test_success_groups);
        let total = result
            .session
            .accepted
            .iter()
            .filter(|f| rules.test_total_groups.contains(&f.group))
            .find_map(|f| match &f.value {
                MatchValue::Integer(n) => Some(*n),
                other => other.as_text().and_then(|t| t.trim().parse().ok()),
            });

        let line = match total {
            Some(total) => format!("{} out of {total} test(s) failed", failed.len()),
            None => format!("{} test(s) failed", failed.len()),
        };
        self.log.findings(&line, &failed);
        record.tests.failed.extend(failed);
        record.tests.succeeded.extend(succeeded);
        fail_on_escalations(&result.session.fatal_errors, &result.command)?;
        Ok(result)
    }

    /// Run every selected test of an `alltests.txt` list, one command per test.
    ///
    /// `command_for` renders the command for a test name.
    #[instrument(skip_all, fields(project = %project, suite = suite.name))]
    pub fn run_alltests(
        &self,
        env: &mut Environment,
        project: &str,
        suite: &TestSuite<'_>,
        command_for: &dyn Fn(&str) -> Result<String>,
    ) -> Result<SuiteOutcome> {
        let list = suite.list;
        suite.rules.resolve(suite.groups)?;
        let raw = fs::read_to_string(list).map_err(|err| {
            NonBuildError::new("Could not read test list")
                .with_value("path", list.display().to_string())
                .with_value("cause", err.to_string())
        })?;
        let workdir = list.parent().filter(|p| !p.as_os_str().is_empty());
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();

        let mut outcome = SuiteOutcome::default();
        let mut escalations = Vec::new();
        for case in parse_test_list(&raw) {
            let selected =
                case.category == "use" || (case.category == "long" && !suite.short_only);
            if !selected {
                continue;
            }
            let command = command_for(&case.name)?;
            let started = Instant::now();
            let output = self.run(&command, workdir)?;
            let elapsed = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
            env.record_timing(suite.name, &case.name, &timestamp, elapsed);

            let session = classify_with_return_code(
                suite.rules,
                suite.groups,
                &output.output,
                Some(output.return_code),
            )?;
            outcome.failed.extend(session.output_lines());
            escalations.extend(session.fatal_errors);
            outcome.executed += 1;
        }

        self.log.findings(
            &format!(
                "{} out of {} test(s) in {} failed",
                outcome.failed.len(),
                outcome.executed,
                suite.name
            ),
            &outcome.failed,
        );
        env.project_mut(project)
            .tests
            .failed
            .extend(outcome.failed.iter().cloned());
        fail_on_escalations(&escalations, &format!("alltests {}", suite.name))?;
        Ok(outcome)
    }

    /// Run `command` and require the first group of `pattern` to equal `expected`.
    pub fn check_version(
        &self,
        tool: &str,
        command: &str,
        workdir: Option<&Path>,
        pattern: &str,
        expected: &str,
    ) -> Result<String> {
        let regex = Regex::new(pattern).with_context(|| format!("version pattern '{pattern}'"))?;
        let output = self.run_safely(command, workdir)?;
        let found = regex
            .captures(&output.output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        match found {
            Some(found) if found == expected => {
                self.log.note_summary(&format!("{tool} version: {found}"));
                Ok(found)
            }
            found => Err(NonBuildError::new(format!(
                "Expected {tool} {expected} but found: {}",
                found.as_deref().unwrap_or("no version")
            ))
            .with_value("command", command)
            .with_value("returncode", output.return_code)
            .with_value("output", output.output.trim_end())
            .into()),
        }
    }

    fn log_findings(&self, result: &StepResult) {
        let mut lines = result.session.lines();
        if lines.is_empty() && !result.session.is_fatal() {
            return;
        }
        lines.extend(
            result
                .session
                .fatal_errors
                .iter()
                .map(|e| format!("{}: {}", e.severity, e.message)),
        );
        self.log.findings(&result.command, &lines);
    }
}

/// Any escalation fails the step; infrastructure escalations are never
/// blamed on the code.
fn fail_on_escalations(escalations: &[Escalation], command: &str) -> Result<()> {
    if escalations.is_empty() {
        return Ok(());
    }
    let errors: Vec<String> = escalations.iter().map(|e| e.message.clone()).collect();
    if escalations
        .iter()
        .any(|e| e.severity == Severity::Infrastructure)
    {
        warn!(count = errors.len(), "infrastructure errors in step output");
        return Err(NonBuildError::new("Found infrastructure errors.")
            .with_value("errors", errors)
            .with_value("command", command)
            .into());
    }
    Err(BuildError::new("Found build errors.")
        .with_value("errors", errors)
        .with_value("command", command)
        .into())
}

/// `<name> <category> [description]` per line; `#` starts a comment line.
pub fn parse_test_list(raw: &str) -> Vec<TestCase> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(name), Some(category)) => Some(TestCase {
                    name: name.to_string(),
                    category: category.to_lowercase(),
                }),
                _ => {
                    warn!(line, "test list entry without category");
                    None
                }
            }
        })
        .collect()
}
