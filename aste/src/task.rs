//! Tasks: ordered checkout, build and bookkeeping actions.
//!
//! Each `build` action runs a project pipeline and then decides whether the
//! project's summary is committed:
//!
//! ```text
//! pipeline -> Completed          Ok              commit, a commit error is the result
//!          -> RecoverableFailed  BuildError      commit, a commit error is only logged
//!          -> FatalFailed        anything else   no commit
//! ```
//!
//! The pipeline's error is always handed back unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::environment::{Environment, ProjectRecord};
use crate::core::rulesets::{ALLTESTS_GROUP, RuleBook};
use crate::error::{BuildError, ErrorContextExt};
use crate::io::config::{Action, Args, AsteConfig, ProjectConfig, ReleaseConfig, StepConfig, StepKind};
use crate::io::process::ProcessRunner;
use crate::io::release::{ReleaseUploader, pack};
use crate::io::run_log::RunLog;
use crate::io::summary::SummaryStore;
use crate::io::timings::{export_csv, record_timings};
use crate::io::vcs::VcsProvider;
use crate::step::{StepExecutor, TestSuite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    RecoverableFailed,
    FatalFailed,
}

impl TaskOutcome {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => TaskOutcome::Completed,
            Err(err) if err.downcast_ref::<BuildError>().is_some() => {
                TaskOutcome::RecoverableFailed
            }
            Err(_) => TaskOutcome::FatalFailed,
        }
    }
}

/// Run `commit` as the outcome of `result` requires, then return `result`.
pub fn apply_commit_protocol<T>(
    result: Result<T>,
    commit: impl FnOnce() -> Result<()>,
) -> Result<T> {
    match TaskOutcome::of(&result) {
        TaskOutcome::Completed => {
            commit()?;
            result
        }
        TaskOutcome::RecoverableFailed => {
            if let Err(err) = commit() {
                warn!(error = %format!("{err:#}"), "summary commit failed after build error");
            }
            result
        }
        TaskOutcome::FatalFailed => {
            debug!("infrastructure failure, summary not committed");
            result
        }
    }
}

/// `Boogie build failed, 2 test(s) failed`
pub fn commit_message(record: &ProjectRecord) -> String {
    let mut message = format!(
        "{} build {}",
        record.name,
        if record.build.success { "succeeded" } else { "failed" }
    );
    let failed = record.tests.failed.len();
    if failed > 0 {
        message.push_str(&format!(", {failed} test(s) failed"));
    }
    message
}

/// The side-effecting collaborators a task needs.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub vcs: &'a dyn VcsProvider,
    pub summaries: &'a dyn SummaryStore,
    pub uploader: &'a dyn ReleaseUploader,
    pub log: &'a RunLog,
}

pub struct TaskRunner<'a> {
    cfg: &'a AsteConfig,
    args: &'a Args,
    book: RuleBook,
    services: Services<'a>,
}

impl<'a> TaskRunner<'a> {
    pub fn new(cfg: &'a AsteConfig, args: &'a Args, services: Services<'a>) -> Result<Self> {
        Ok(Self {
            cfg,
            args,
            book: cfg.rule_book()?,
            services,
        })
    }

    #[instrument(skip_all, fields(task = name))]
    pub fn run_task(&self, env: &mut Environment, name: &str) -> Result<()> {
        let task = self.cfg.task(name)?;
        info!(actions = task.actions.len(), "running task");
        for action in &task.actions {
            self.run_action(env, action)?;
        }
        Ok(())
    }

    fn run_action(&self, env: &mut Environment, action: &Action) -> Result<()> {
        match action {
            Action::Checkout(project) => self
                .checkout(env, project)
                .error_context(&format!("Checking out {project}")),
            Action::Build(project) => self.build(env, project),
            Action::Task(name) => self.run_task(env, name),
            Action::RecordTimings => self
                .record_timings(env)
                .error_context("Recording test timings"),
            Action::ExportTimings => self
                .export_timings()
                .error_context("Exporting test timings to a CSV file"),
        }
    }

    /// Fetch the project's sources and record their revision.
    #[instrument(skip_all, fields(project))]
    pub fn checkout(&self, env: &mut Environment, project: &str) -> Result<()> {
        let config = self.cfg.project(project)?;
        let source = config
            .source
            .as_ref()
            .with_context(|| format!("project '{project}' has no source"))?;
        let url = self.render(&source.url, project)?;
        let dest = self.render(&source.dest, project)?;
        let vcs = self
            .services
            .vcs
            .client(source.vcs, source.credentials.as_ref());
        let revision = vcs.fetch(&url, Path::new(&dest), source.update)?;
        self.services.log.header(&format!(
            "{project} revision: {}",
            revision.last_changed_revision
        ));
        env.project_mut(project).revision = Some(revision);
        Ok(())
    }

    /// Project pipeline wrapped in the commit protocol.
    pub fn build(&self, env: &mut Environment, project: &str) -> Result<()> {
        let result = self
            .build_pipeline(env, project)
            .typed_context(&format!("Building {project}"));
        apply_commit_protocol(result, || {
            self.commit_summary_if_changed(env, project)
                .error_context(&format!("Committing summary of {project}"))
                .inspect_err(|err| {
                    self.services
                        .log
                        .note(&format!("Summary commit failed: {err:#}"));
                })
        })
    }

    #[instrument(skip_all, fields(project))]
    fn build_pipeline(&self, env: &mut Environment, project: &str) -> Result<()> {
        let config = self.cfg.project(project)?;
        env.project_mut(project).build.started = true;
        self.services.log.note_summary(&format!("Building {project}"));

        for step in &config.steps {
            self.run_step(env, project, config, step)?;
        }
        env.project_mut(project).build.success = true;

        if self.cfg.flags.tests {
            for step in &config.tests {
                self.run_step(env, project, config, step)?;
            }
        }
        if self.cfg.flags.upload_build {
            if let Some(release) = &config.release {
                self.release(env, project, release)
                    .typed_context(&format!("Releasing {project}"))?;
            }
        }
        Ok(())
    }

    fn run_step(
        &self,
        env: &mut Environment,
        project: &str,
        config: &ProjectConfig,
        step: &StepConfig,
    ) -> Result<()> {
        let result = self.run_step_inner(env, project, config, step);
        if step.name.is_empty() {
            result
        } else {
            result.typed_context(&step.name)
        }
    }

    fn run_step_inner(
        &self,
        env: &mut Environment,
        project: &str,
        config: &ProjectConfig,
        step: &StepConfig,
    ) -> Result<()> {
        let executor = StepExecutor::new(self.services.runner, self.services.log);
        let rules = self.book.get(step.ruleset_name(config))?;
        let groups = if !step.groups.is_empty() {
            step.groups.clone()
        } else if step.kind == StepKind::Alltests {
            vec![ALLTESTS_GROUP.to_string()]
        } else {
            rules.default_groups.clone()
        };
        let workdir = self.workdir(project, config, step)?;
        let workdir = workdir.as_deref();
        debug!(step = step.label(), kind = ?step.kind, "running step");

        match step.kind {
            StepKind::Build => {
                let command = self.render(&step.command, project)?;
                executor.run_default_build_step(&command, workdir, rules, &groups)?;
            }
            StepKind::Safe => {
                let command = self.render(&step.command, project)?;
                executor.run_safely(&command, workdir)?;
            }
            StepKind::Run => {
                let command = self.render(&step.command, project)?;
                executor.run(&command, workdir)?;
            }
            StepKind::Test => {
                let command = self.render(&step.command, project)?;
                executor.run_test_step(env.project_mut(project), &command, workdir, rules, &groups)?;
            }
            StepKind::Alltests => {
                let list = step
                    .list
                    .as_deref()
                    .with_context(|| format!("step '{}' has no test list", step.label()))?;
                let list = PathBuf::from(self.render(list, project)?);
                let list = match workdir {
                    Some(dir) if list.is_relative() => dir.join(list),
                    _ => list,
                };
                let suite = TestSuite {
                    name: step.label(),
                    list: &list,
                    short_only: self.cfg.flags.short_tests_only,
                    rules,
                    groups: &groups,
                };
                let command_for = |test: &str| {
                    let mut extra = BTreeMap::new();
                    extra.insert("test", test.to_string());
                    self.cfg.render(&step.command, Some(project), self.args, &extra)
                };
                executor.run_alltests(env, project, &suite, &command_for)?;
            }
            StepKind::Version => {
                let command = self.render(&step.command, project)?;
                let (Some(pattern), Some(expected)) = (&step.pattern, &step.expected) else {
                    anyhow::bail!("version step '{}' needs pattern and expected", step.label());
                };
                executor.check_version(project, &command, workdir, pattern, expected)?;
            }
        }
        Ok(())
    }

    fn release(&self, env: &Environment, project: &str, release: &ReleaseConfig) -> Result<()> {
        let dir = PathBuf::from(self.render(&release.dir, project)?);
        let archive_dir = match &release.archive_dir {
            Some(dir) => PathBuf::from(self.render(dir, project)?),
            None => self.cfg.logging.dir.clone(),
        };
        let archive = pack(project, &dir, &archive_dir)?;
        let revision = env
            .project(project)
            .and_then(|record| record.revision.as_ref())
            .map_or_else(|| "0".to_string(), |r| r.last_changed_revision.clone());
        self.services
            .uploader
            .upload(project, &revision, release.credentials.as_ref(), &archive)?;
        self.services
            .log
            .header(&format!("Released nightly of {project}"));
        Ok(())
    }

    /// Commit the run summary for `project` when it differs from the last commit.
    pub fn commit_summary_if_changed(&self, env: &mut Environment, project: &str) -> Result<()> {
        let log = self.services.log;
        let current = log.summary_text()?;
        if !self.services.summaries.diff(project, &current)? {
            log.note(&format!(
                "Summary (project={project}) hasn't changed and won't be committed."
            ));
            return Ok(());
        }
        if !self.cfg.flags.upload_summary {
            log.note(&format!(
                "Summary (project={project}) has changed but won't be committed due to flag 'upload_summary'."
            ));
            return Ok(());
        }
        let message = commit_message(env.project_mut(project));
        self.services.summaries.commit(project, &current, &message)?;
        info!(project, message, "summary committed");
        env.record_commit(project);
        Ok(())
    }

    fn record_timings(&self, env: &Environment) -> Result<()> {
        if env.timings.is_empty() {
            debug!("no timings recorded in this run");
            return Ok(());
        }
        let path = self
            .cfg
            .timings
            .json
            .as_deref()
            .context("timings.json is not configured")?;
        record_timings(path, &env.timings)?;
        Ok(())
    }

    fn export_timings(&self) -> Result<()> {
        let (Some(json), Some(csv)) = (&self.cfg.timings.json, &self.cfg.timings.csv) else {
            anyhow::bail!("timings.json and timings.csv must be configured");
        };
        export_csv(json, csv)
    }

    fn workdir(
        &self,
        project: &str,
        config: &ProjectConfig,
        step: &StepConfig,
    ) -> Result<Option<PathBuf>> {
        step.dir
            .as_ref()
            .or(config.workdir.as_ref())
            .map(|dir| self.render(dir, project).map(PathBuf::from))
            .transpose()
    }

    fn render(&self, template: &str, project: &str) -> Result<String> {
        self.cfg
            .render(template, Some(project), self.args, &BTreeMap::new())
    }
}
