//! Task-level scenarios driven through scripted processes and recording stores.
//!
//! These cover the commit protocol end to end: which outcomes commit the
//! summary, what the commit says, and that the task error reaches the caller
//! untouched.

use std::io;
use std::path::Path;

use aste::core::classifier::classify;
use aste::core::environment::Environment;
use aste::core::rules::{Filter, MatchRule, RuleSet};
use aste::core::types::{Escalation, MatchValue, Severity};
use aste::error::{BuildError, ErrorKind, details_of};
use aste::io::config::{Args, AsteConfig};
use aste::io::process::{ProcessOutput, ProcessRunner};
use aste::io::run_log::RunLog;
use aste::step::StepExecutor;
use aste::task::{Services, TaskRunner};
use aste::test_support::{
    RecordingSummaryStore, RecordingUploader, RecordingVcs, RecordingVcsProvider,
    ScriptedProcessRunner,
};

const CONFIG: &str = r#"
[flags]
upload_summary = true

[[projects.Boogie.steps]]
name = "Build Boogie"
command = "msbuild Boogie.sln"

[[projects.Chalice.steps]]
command = "sbt compile"
ruleset = "sbt"

[tasks.boogie]
actions = [{ build = "Boogie" }]

[tasks.nightly]
actions = [{ task = "boogie" }, { build = "Chalice" }]
"#;

struct Harness {
    cfg: AsteConfig,
    summaries: RecordingSummaryStore,
    log: RunLog,
}

impl Harness {
    fn new() -> Self {
        let cfg: AsteConfig = toml::from_str(CONFIG).expect("parse");
        cfg.validate().expect("valid");
        Self {
            cfg,
            summaries: RecordingSummaryStore::default(),
            log: RunLog::in_memory("lifecycle", false),
        }
    }

    fn run(
        &self,
        runner: &dyn ProcessRunner,
        env: &mut Environment,
        task: &str,
    ) -> anyhow::Result<()> {
        let provider = RecordingVcsProvider::new(RecordingVcs::default());
        let uploader = RecordingUploader::default();
        let args = Args::new();
        let services = Services {
            runner,
            vcs: &provider,
            summaries: &self.summaries,
            uploader: &uploader,
            log: &self.log,
        };
        TaskRunner::new(&self.cfg, &args, services)
            .expect("task runner")
            .run_task(env, task)
    }
}

#[test]
fn build_error_commits_once_with_a_failed_message() {
    let harness = Harness::new();
    let runner = ScriptedProcessRunner::new()
        .with_output(1, "Parser.cs(12,5): error CS1002: ; expected\nBoogie - 1 error(s), 0 warning(s)\n");
    let mut env = Environment::new(Some("boogie"));

    let err = harness.run(&runner, &mut env, "boogie").expect_err("build error");

    assert_eq!(ErrorKind::of(&err), ErrorKind::Build);
    let commits = harness.summaries.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].1.contains("failed"));
    assert_eq!(env.commits, vec!["Boogie"]);
    // The named step is the innermost context.
    assert_eq!(
        details_of(&err).and_then(|d| d.context.as_deref()),
        Some("Build Boogie")
    );
}

#[test]
fn io_error_skips_the_commit_and_reaches_the_caller_unchanged() {
    let harness = Harness::new();
    let runner = ScriptedProcessRunner::new().with_failure("Could not start command");
    let mut env = Environment::new(Some("boogie"));

    let err = harness.run(&runner, &mut env, "boogie").expect_err("non-build error");

    assert_eq!(ErrorKind::of(&err), ErrorKind::NonBuild);
    assert_eq!(err.to_string(), "Could not start command");
    assert!(harness.summaries.commits().is_empty());
    assert!(env.commits.is_empty());
}

/// Fails every command with a plain I/O error.
struct DiskFull;

impl ProcessRunner for DiskFull {
    fn execute(
        &self,
        _command: &str,
        _workdir: Option<&Path>,
        _on_line: &mut dyn FnMut(&str),
    ) -> anyhow::Result<ProcessOutput> {
        Err(io::Error::other("disk full").into())
    }
}

#[test]
fn plain_io_error_reaches_the_caller_without_added_context() {
    let harness = Harness::new();
    let mut env = Environment::new(Some("boogie"));

    let err = harness
        .run(&DiskFull, &mut env, "boogie")
        .expect_err("io error");

    assert_eq!(ErrorKind::of(&err), ErrorKind::Unexpected);
    assert_eq!(err.to_string(), "disk full");
    assert_eq!(format!("{err:#}"), "disk full");
    assert!(err.downcast_ref::<io::Error>().is_some());
    assert!(harness.summaries.commits().is_empty());
    assert!(env.commits.is_empty());
}

#[test]
fn nested_task_failure_stops_the_outer_task() {
    let harness = Harness::new();
    let runner = ScriptedProcessRunner::new().with_output(1, "Boogie - 3 error(s), 0 warning(s)\n");
    let mut env = Environment::new(Some("nightly"));

    harness.run(&runner, &mut env, "nightly").expect_err("build error");

    assert_eq!(runner.commands(), vec!["msbuild Boogie.sln"]);
    assert!(env.project("Chalice").is_none());
    assert_eq!(harness.summaries.commits().len(), 1);
}

#[test]
fn commit_failure_after_build_error_keeps_the_build_error() {
    let mut harness = Harness::new();
    harness.summaries = RecordingSummaryStore::default().failing_commit();
    let runner = ScriptedProcessRunner::new().with_output(1, "Boogie - 1 error(s), 0 warning(s)\n");
    let mut env = Environment::default();

    let err = harness.run(&runner, &mut env, "boogie").expect_err("build error");

    assert!(err.downcast_ref::<BuildError>().is_some());
    assert!(harness
        .log
        .verbose_text()
        .expect("verbose")
        .contains("Summary commit failed"));
}

#[test]
fn commit_failure_after_success_fails_the_task() {
    let mut harness = Harness::new();
    harness.summaries = RecordingSummaryStore::default().failing_commit();
    let runner = ScriptedProcessRunner::new().with_output(0, "Build succeeded.\n");
    let mut env = Environment::default();

    let err = harness.run(&runner, &mut env, "boogie").expect_err("commit fails");

    assert_eq!(ErrorKind::of(&err), ErrorKind::NonBuild);
    assert_eq!(
        details_of(&err).and_then(|d| d.context.as_deref()),
        Some("Committing summary of Boogie")
    );
    assert!(env.project("Boogie").expect("record").build.success);
}

#[test]
fn both_projects_commit_when_everything_builds() {
    let harness = Harness::new();
    let runner = ScriptedProcessRunner::new()
        .with_output(0, "Build succeeded.\n")
        .with_output(0, "[info] Compiling 12 Scala sources\n[success] Total time: 30 s\n");
    let mut env = Environment::new(Some("nightly"));

    harness.run(&runner, &mut env, "nightly").expect("nightly");

    assert_eq!(
        harness.summaries.commits(),
        vec![
            ("Boogie".to_string(), "Boogie build succeeded".to_string()),
            ("Chalice".to_string(), "Chalice build succeeded".to_string()),
        ]
    );
    assert_eq!(env.commits, vec!["Boogie", "Chalice"]);
}

fn compile_rules() -> RuleSet {
    RuleSet::new("cl")
        .with_group(
            "errors",
            vec![MatchRule::new(&[r"error C\d+.*"], vec![Filter::Accept], vec![]).expect("rule")],
        )
        .with_group(
            "counts",
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
fn compiler_error_and_count_fail_the_step() {
    let rules = compile_rules();
    let groups = vec!["errors".to_string(), "counts".to_string()];
    let text = "1>foo.cpp(10): error C2143: syntax error\n2 Error(s), 0 Warning(s)";

    let session = classify(&rules, &groups, text).expect("classify");
    assert_eq!(
        session.values(),
        vec![&MatchValue::Text("error C2143: syntax error".to_string())]
    );
    assert_eq!(
        session.fatal_errors,
        vec![Escalation::new(Severity::Fatal, "2 Error(s)")]
    );
    assert_eq!(classify(&rules, &groups, text).expect("again"), session);

    let runner = ScriptedProcessRunner::new().with_output(2, text);
    let log = RunLog::in_memory("lifecycle", false);
    let err = StepExecutor::new(&runner, &log)
        .run_default_build_step("cl foo.cpp", None, &rules, &groups)
        .expect_err("step fails");
    assert_eq!(err.to_string(), "Found build errors.");
}

#[test]
fn run_safely_reports_the_exact_command() {
    let runner = ScriptedProcessRunner::new().with_output(1, "");
    let log = RunLog::in_memory("lifecycle", false);
    let command = "nmake /f Makefile.nmake all";

    let err = StepExecutor::new(&runner, &log)
        .run_safely(command, None)
        .expect_err("nonzero");

    let build = err.downcast_ref::<BuildError>().expect("build error");
    assert_eq!(
        build.to_string(),
        "nmake /f Makefile.nmake all failed with return code 1"
    );
    assert_eq!(build.value("returncode"), Some(&serde_json::json!(1)));
    assert_eq!(build.value("command"), Some(&serde_json::json!(command)));
}

#[test]
fn clean_output_with_zero_return_code_passes() {
    let runner = ScriptedProcessRunner::new().with_output(0, "");
    let log = RunLog::in_memory("lifecycle", false);
    let rules = compile_rules();
    let groups = vec!["errors".to_string(), "counts".to_string()];

    let result = StepExecutor::new(&runner, &log)
        .run_default_build_step("cl foo.cpp", None, &rules, &groups)
        .expect("passes");

    assert!(result.session.accepted.is_empty());
    assert!(!result.session.is_fatal());
}
