//! Build bot configuration (TOML).
//!
//! One file describes the machine (`host_id`, tool paths), the projects it
//! builds, and the tasks that string checkout/build actions together. Step
//! commands are minijinja templates rendered against `apps`, `paths`, `vars`,
//! the project name and the `key=value` arguments given to `aste start`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{UndefinedBehavior, context};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::rot47::rot47;
use crate::core::rules::RuleSetSpec;
use crate::core::rulesets::{MSBUILD, RuleBook, TESTS};

/// `key=value` arguments from the command line.
pub type Args = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsteConfig {
    /// Identifies the build machine in logs and reports.
    pub host_id: String,
    pub logging: LoggingConfig,
    pub flags: Flags,
    pub process: ProcessConfig,
    pub mail: MailConfig,
    pub timings: TimingsConfig,
    /// Tool executables, e.g. `msbuild = "C:/Windows/.../MSBuild.exe"`.
    pub apps: BTreeMap<String, String>,
    pub paths: BTreeMap<String, String>,
    pub vars: BTreeMap<String, String>,
    pub rulesets: BTreeMap<String, RuleSetSpec>,
    pub projects: BTreeMap<String, ProjectConfig>,
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl Default for AsteConfig {
    fn default() -> Self {
        Self {
            host_id: "unknown".to_string(),
            logging: LoggingConfig::default(),
            flags: Flags::default(),
            process: ProcessConfig::default(),
            mail: MailConfig::default(),
            timings: TimingsConfig::default(),
            apps: BTreeMap::new(),
            paths: BTreeMap::new(),
            vars: BTreeMap::new(),
            rulesets: BTreeMap::new(),
            projects: BTreeMap::new(),
            tasks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub verbose_file: String,
    pub summary_file: String,
    /// Rotated copies kept per log (`verbose.log.1` ...).
    pub backups: u32,
    /// Also print log lines on stdout.
    pub echo: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            verbose_file: "verbose.log".to_string(),
            summary_file: "summary.log".to_string(),
            backups: 10,
            echo: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Run test steps after a successful build.
    pub tests: bool,
    /// Skip `long` tests in alltests runs.
    pub short_tests_only: bool,
    /// Commit changed summaries to their repositories.
    pub upload_summary: bool,
    /// Pack and upload release archives.
    pub upload_build: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            tests: true,
            short_tests_only: false,
            upload_summary: false,
            upload_build: false,
        }
    }
}

impl Flags {
    /// Apply a boolean override from the command line (`tests=false`).
    pub fn set(&mut self, name: &str, value: &str) -> Result<bool> {
        let flag = match name {
            "tests" => &mut self.tests,
            "short_tests_only" => &mut self.short_tests_only,
            "upload_summary" => &mut self.upload_summary,
            "upload_build" => &mut self.upload_build,
            _ => return Ok(false),
        };
        *flag = parse_bool(value).with_context(|| format!("flag {name}"))?;
        Ok(true)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{other}'")),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Kill build commands running longer than this. Unset waits forever.
    pub timeout_secs: Option<u64>,
}

impl ProcessConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub enabled: bool,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject_prefix: String,
    /// Program receiving the message on stdin.
    pub program: Vec<String>,
    /// Write messages into this directory instead of running `program`.
    pub outbox: Option<PathBuf>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sender: String::new(),
            recipients: Vec::new(),
            subject_prefix: "[Aste] ".to_string(),
            program: vec!["sendmail".to_string(), "-t".to_string(), "-i".to_string()],
            outbox: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    #[default]
    Svn,
    Hg,
    Git,
}

impl VcsKind {
    pub fn program(self) -> &'static str {
        match self {
            VcsKind::Svn => "svn",
            VcsKind::Hg => "hg",
            VcsKind::Git => "git",
        }
    }
}

/// Login for a repository or upload site. `password` is rot47-encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn password(&self) -> String {
        rot47(&self.password)
    }

    fn validate(&self, owner: &str) -> Result<()> {
        if self.user.trim().is_empty() {
            bail!("{owner}: credentials.user must not be empty");
        }
        if self.password.chars().any(|c| !c.is_ascii_graphic()) {
            bail!("{owner}: credentials.password must be rot47-encoded printable ASCII");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub vcs: VcsKind,
    pub url: String,
    /// Checkout directory (template).
    pub dest: String,
    /// Update an existing checkout instead of checking out fresh.
    pub update: bool,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub vcs: VcsKind,
    /// Working copy holding committed summaries (template).
    pub checkout: String,
    /// File name inside `checkout`. Defaults to the summary log's name.
    pub file: Option<String>,
    /// Where readers find the committed summary; shown in reports.
    pub link: Option<String>,
    pub credentials: Option<Credentials>,
}

impl SummaryConfig {
    pub fn file_name<'a>(&'a self, logging: &'a LoggingConfig) -> &'a str {
        self.file.as_deref().unwrap_or(&logging.summary_file)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Build output to pack (template).
    pub dir: String,
    /// Where the archive is written (template). Defaults to the log directory.
    pub archive_dir: Option<String>,
    /// Upload command (template over `project`, `revision`, `user`, `password`, `archive`).
    pub upload: String,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Classify output; fatal findings fail the step.
    #[default]
    Build,
    /// Fail on any nonzero return code.
    Safe,
    /// Run and log, never fail.
    Run,
    /// Collect failing and passing tests.
    Test,
    /// Run an `alltests.txt` suite test by test.
    Alltests,
    /// Check a tool version printed by the command.
    Version,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub name: String,
    pub kind: StepKind,
    pub command: String,
    /// Working directory (template). Defaults to the project workdir.
    pub dir: Option<String>,
    /// Rule groups; empty means the rule set defaults.
    pub groups: Vec<String>,
    /// Rule set override for this step.
    pub ruleset: Option<String>,
    /// `alltests` only: the test list (template).
    pub list: Option<String>,
    /// `version` only: regex whose first group is the version.
    pub pattern: Option<String>,
    /// `version` only: required version.
    pub expected: Option<String>,
}

impl StepConfig {
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.command
        } else {
            &self.name
        }
    }

    /// Rule set classifying this step's output. Test steps default to `tests`.
    pub fn ruleset_name<'a>(&'a self, project: &'a ProjectConfig) -> &'a str {
        match (&self.ruleset, self.kind) {
            (Some(set), _) => set,
            (None, StepKind::Test | StepKind::Alltests) => TESTS,
            (None, _) => &project.ruleset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Default working directory for steps (template).
    pub workdir: Option<String>,
    pub ruleset: String,
    pub source: Option<SourceConfig>,
    pub steps: Vec<StepConfig>,
    pub tests: Vec<StepConfig>,
    pub summary: Option<SummaryConfig>,
    pub release: Option<ReleaseConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            ruleset: MSBUILD.to_string(),
            source: None,
            steps: Vec::new(),
            tests: Vec::new(),
            summary: None,
            release: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Checkout(String),
    Build(String),
    Task(String),
    RecordTimings,
    ExportTimings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub description: String,
    pub actions: Vec<Action>,
}

impl AsteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.process.timeout_secs == Some(0) {
            bail!("process.timeout_secs must be > 0");
        }
        if self.logging.verbose_file.trim().is_empty() || self.logging.summary_file.trim().is_empty()
        {
            bail!("logging file names must not be empty");
        }
        if self.mail.enabled {
            if self.mail.recipients.is_empty() {
                bail!("mail.recipients must not be empty when mail is enabled");
            }
            if self.mail.outbox.is_none()
                && self.mail.program.first().is_none_or(|p| p.trim().is_empty())
            {
                bail!("mail.program must be a non-empty array");
            }
        }

        let book = self.rule_book()?;
        for (name, project) in &self.projects {
            self.validate_project(name, project, &book)?;
        }
        for (name, task) in &self.tasks {
            self.validate_task(name, task)?;
        }
        self.check_task_cycles()?;
        Ok(())
    }

    /// Built-in rule sets merged with the ones declared in this file.
    pub fn rule_book(&self) -> Result<RuleBook> {
        RuleBook::with_specs(&self.rulesets).context("rulesets")
    }

    pub fn project(&self, name: &str) -> Result<&ProjectConfig> {
        self.projects
            .get(name)
            .ok_or_else(|| anyhow!("unknown project '{name}'"))
    }

    pub fn task(&self, name: &str) -> Result<&TaskConfig> {
        self.tasks
            .get(name)
            .ok_or_else(|| anyhow!("unknown task '{name}'"))
    }

    /// Render a command or path template.
    ///
    /// Undefined variables are errors so a typo never runs a half-rendered command.
    pub fn render(
        &self,
        template: &str,
        project: Option<&str>,
        args: &Args,
        extra: &BTreeMap<&str, String>,
    ) -> Result<String> {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let ctx = context! {
            apps => &self.apps,
            paths => &self.paths,
            vars => &self.vars,
            host_id => &self.host_id,
            args => args,
            project => project,
            ..minijinja::Value::from_serialize(extra)
        };
        env.render_str(template, ctx)
            .with_context(|| format!("render template '{template}'"))
    }

    fn validate_project(&self, name: &str, project: &ProjectConfig, book: &RuleBook) -> Result<()> {
        let owner = format!("project '{name}'");
        book.get(&project.ruleset)
            .with_context(|| owner.clone())?;
        for step in project.steps.iter().chain(&project.tests) {
            let step_owner = format!("{owner} step '{}'", step.label());
            if step.command.trim().is_empty() {
                bail!("{step_owner}: command must not be empty");
            }
            let rules = book
                .get(step.ruleset_name(project))
                .with_context(|| step_owner.clone())?;
            if !step.groups.is_empty() {
                rules.resolve(&step.groups).with_context(|| step_owner.clone())?;
            }
            match step.kind {
                StepKind::Alltests if step.list.is_none() => {
                    bail!("{step_owner}: alltests steps need `list`");
                }
                StepKind::Version => {
                    let (Some(pattern), Some(_)) = (&step.pattern, &step.expected) else {
                        bail!("{step_owner}: version steps need `pattern` and `expected`");
                    };
                    Regex::new(pattern).with_context(|| format!("{step_owner}: pattern"))?;
                }
                _ => {}
            }
        }
        if let Some(source) = &project.source {
            if source.url.trim().is_empty() || source.dest.trim().is_empty() {
                bail!("{owner}: source.url and source.dest must not be empty");
            }
            if let Some(credentials) = &source.credentials {
                credentials.validate(&owner)?;
            }
        }
        if let Some(summary) = &project.summary {
            if summary.checkout.trim().is_empty() {
                bail!("{owner}: summary.checkout must not be empty");
            }
            if let Some(credentials) = &summary.credentials {
                credentials.validate(&owner)?;
            }
        }
        if let Some(release) = &project.release {
            if release.dir.trim().is_empty() || release.upload.trim().is_empty() {
                bail!("{owner}: release.dir and release.upload must not be empty");
            }
            if let Some(credentials) = &release.credentials {
                credentials.validate(&owner)?;
            }
        }
        Ok(())
    }

    fn validate_task(&self, name: &str, task: &TaskConfig) -> Result<()> {
        for action in &task.actions {
            match action {
                Action::Checkout(project) => {
                    let config = self.project(project).with_context(|| format!("task '{name}'"))?;
                    if config.source.is_none() {
                        bail!("task '{name}': project '{project}' has no source to check out");
                    }
                }
                Action::Build(project) => {
                    self.project(project).with_context(|| format!("task '{name}'"))?;
                }
                Action::Task(nested) => {
                    self.task(nested).with_context(|| format!("task '{name}'"))?;
                }
                Action::RecordTimings => {
                    if self.timings.json.is_none() {
                        bail!("task '{name}': record_timings needs timings.json");
                    }
                }
                Action::ExportTimings => {
                    if self.timings.json.is_none() || self.timings.csv.is_none() {
                        bail!("task '{name}': export_timings needs timings.json and timings.csv");
                    }
                }
            }
        }
        Ok(())
    }

    fn check_task_cycles(&self) -> Result<()> {
        let mut done = BTreeSet::new();
        for name in self.tasks.keys() {
            let mut stack = Vec::new();
            self.visit_task(name, &mut stack, &mut done)?;
        }
        Ok(())
    }

    fn visit_task<'a>(
        &'a self,
        name: &'a str,
        stack: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if stack.contains(&name) {
            stack.push(name);
            bail!("task cycle: {}", stack.join(" -> "));
        }
        stack.push(name);
        for action in &self.task(name)?.actions {
            if let Action::Task(nested) = action {
                self.visit_task(nested, stack, done)?;
            }
        }
        stack.pop();
        done.insert(name);
        Ok(())
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<AsteConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AsteConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AsteConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Starter config written by `aste init`.
pub fn sample_config() -> AsteConfig {
    let mut cfg = AsteConfig {
        host_id: "build-01".to_string(),
        ..AsteConfig::default()
    };
    cfg.apps
        .insert("msbuild".to_string(), "msbuild".to_string());
    cfg.paths
        .insert("sources".to_string(), "sources".to_string());
    cfg.projects.insert(
        "Boogie".to_string(),
        ProjectConfig {
            workdir: Some("{{ paths.sources }}/Boogie".to_string()),
            source: Some(SourceConfig {
                vcs: VcsKind::Hg,
                url: "https://hg.example.org/boogie".to_string(),
                dest: "{{ paths.sources }}/Boogie".to_string(),
                update: true,
                credentials: None,
            }),
            steps: vec![StepConfig {
                name: "Build Boogie".to_string(),
                command: "{{ apps.msbuild }} Source/Boogie.sln /t:Rebuild".to_string(),
                ..StepConfig::default()
            }],
            ..ProjectConfig::default()
        },
    );
    cfg.tasks.insert(
        "nightly".to_string(),
        TaskConfig {
            description: "Check out and build Boogie".to_string(),
            actions: vec![
                Action::Checkout("Boogie".to_string()),
                Action::Build("Boogie".to_string()),
            ],
        },
    );
    cfg
}
