//! `aste start`: run one task and report the result.
//!
//! Problems found before the task starts (unreadable config, unknown task,
//! bad flag overrides) are invocation errors. Once the task runs, every
//! error ends up in the report, which is always produced exactly once.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::environment::Environment;
use crate::core::report::{ReportInfo, SummaryLink, render_error, render_report, report_subject};
use crate::error::ErrorKind;
use crate::exit_codes;
use crate::io::config::{Args, AsteConfig, load_config};
use crate::io::mail::{CommandMailer, Mailer, OutboxMailer};
use crate::io::process::ShellProcessRunner;
use crate::io::release::CommandReleaseUploader;
use crate::io::run_log::RunLog;
use crate::io::summary::FileSummaryStore;
use crate::io::vcs::CommandVcsProvider;
use crate::task::{Services, TaskRunner};

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub config: PathBuf,
    pub task: String,
    /// Keep run logs in memory instead of the log directory.
    pub no_file_logging: bool,
    /// `key=value` pairs; flag names override `[flags]`.
    pub args: Args,
}

/// Report of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub subject: String,
    pub body: String,
    pub exit_code: i32,
    pub environment: Environment,
}

pub fn exit_code(error: Option<ErrorKind>) -> i32 {
    match error {
        None => exit_codes::OK,
        Some(ErrorKind::Build) => exit_codes::BUILD_ERROR,
        Some(ErrorKind::NonBuild | ErrorKind::Unexpected) => exit_codes::ERROR,
    }
}

/// Load the config and apply command-line overrides.
pub fn prepare(options: &StartOptions) -> Result<AsteConfig> {
    let mut cfg = load_config(&options.config)?;
    for (key, value) in &options.args {
        if cfg.flags.set(key, value)? {
            info!(flag = %key, value = %value, "flag overridden");
        }
    }
    cfg.task(&options.task)?;
    Ok(cfg)
}

/// Run the task with real tools, deliver the report, and return it.
///
/// Errors mean the run never started (exit code [`exit_codes::INVALID`]).
#[instrument(skip_all, fields(task = %options.task))]
pub fn start(options: &StartOptions) -> Result<RunReport> {
    let cfg = prepare(options)?;
    let log = if options.no_file_logging {
        RunLog::in_memory(&cfg.host_id, cfg.logging.echo)
    } else {
        RunLog::open(&cfg.logging, &cfg.host_id)?
    };
    let runner = ShellProcessRunner::new(cfg.process.timeout());
    let provider = CommandVcsProvider::new(&cfg.apps);
    let summaries = FileSummaryStore::from_config(&cfg, &options.args, &provider)?;
    let uploader = CommandReleaseUploader::new(&cfg, &options.args, &runner);
    let services = Services {
        runner: &runner,
        vcs: &provider,
        summaries: &summaries,
        uploader: &uploader,
        log: &log,
    };

    let report = run_and_report(&cfg, &options.args, &options.task, &options.config, services);
    if cfg.mail.enabled {
        let mailer = mailer(&cfg);
        if let Err(err) = deliver(&cfg, &report, mailer.as_ref()) {
            warn!(error = %format!("{err:#}"), "report not mailed");
            log.note(&format!("Could not mail the report: {err:#}"));
        }
    }
    Ok(report)
}

/// Run `task` and build its report. Task errors are recorded, never returned.
pub fn run_and_report(
    cfg: &AsteConfig,
    args: &Args,
    task: &str,
    config_path: &Path,
    services: Services<'_>,
) -> RunReport {
    let log = services.log;
    log.header(&format!("Configuration: {}", config_path.display()));
    log.header(&format!("Task: {task}"));

    let mut env = Environment::new(Some(task));
    let result = TaskRunner::new(cfg, args, services).and_then(|runner| runner.run_task(&mut env, task));

    let (kind, rendered) = match &result {
        Ok(()) => {
            info!(task, "task finished");
            (None, None)
        }
        Err(err) => {
            let kind = ErrorKind::of(err);
            error!(kind = kind.as_str(), error = %format!("{err:#}"), "task failed");
            let rendered = render_error(err);
            env.record_error(kind.as_str(), rendered.clone());
            log.report_error(&rendered);
            (Some(kind), Some(rendered))
        }
    };

    let subject = report_subject(&env, kind);
    let info = report_info(cfg, config_path);
    let body = render_report(&env, &info, rendered.as_deref()).unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "report template failed");
        format!("{subject}\n\n{}", rendered.as_deref().unwrap_or_default())
    });
    RunReport {
        subject,
        body,
        exit_code: exit_code(kind),
        environment: env,
    }
}

/// Send the report to the configured recipients.
pub fn deliver(cfg: &AsteConfig, report: &RunReport, mailer: &dyn Mailer) -> Result<()> {
    let subject = format!("{}{}", cfg.mail.subject_prefix, report.subject);
    mailer
        .send(&subject, &report.body, &cfg.mail.recipients)
        .context("send report")
}

fn mailer(cfg: &AsteConfig) -> Box<dyn Mailer> {
    match &cfg.mail.outbox {
        Some(dir) => Box::new(OutboxMailer::new(dir, cfg.mail.sender.clone())),
        None => Box::new(CommandMailer::new(
            cfg.mail.program.clone(),
            cfg.mail.sender.clone(),
        )),
    }
}

fn report_info(cfg: &AsteConfig, config_path: &Path) -> ReportInfo {
    ReportInfo {
        host_id: cfg.host_id.clone(),
        config_path: config_path.display().to_string(),
        tests: cfg.flags.tests,
        short_tests_only: cfg.flags.short_tests_only,
        upload_summary: cfg.flags.upload_summary,
        upload_build: cfg.flags.upload_build,
        summary_links: cfg
            .projects
            .iter()
            .filter_map(|(name, project)| {
                let link = project.summary.as_ref()?.link.as_ref()?;
                Some(SummaryLink {
                    project: name.clone(),
                    url: link.clone(),
                })
            })
            .collect(),
    }
}
