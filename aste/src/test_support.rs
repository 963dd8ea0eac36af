//! Scripted fakes for the I/O seams and a throwaway workspace for tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::Revision;
use crate::error::NonBuildError;
use crate::io::config::{Credentials, VcsKind};
use crate::io::mail::Mailer;
use crate::io::process::{ProcessOutput, ProcessRunner};
use crate::io::release::ReleaseUploader;
use crate::io::summary::SummaryStore;
use crate::io::vcs::{Vcs, VcsProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Scripted {
    Output(ProcessOutput),
    Failure(String),
}

/// Answers commands from a queue, in order, and remembers what was run.
#[derive(Default)]
pub struct ScriptedProcessRunner {
    script: Mutex<VecDeque<Scripted>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, return_code: i32, output: &str) -> Self {
        lock(&self.script).push_back(Scripted::Output(ProcessOutput {
            return_code,
            output: output.to_string(),
        }));
        self
    }

    /// The next command fails to run at all (`NonBuildError`).
    pub fn with_failure(self, message: &str) -> Self {
        lock(&self.script).push_back(Scripted::Failure(message.to_string()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl ProcessRunner for ScriptedProcessRunner {
    fn execute(
        &self,
        command: &str,
        _workdir: Option<&Path>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ProcessOutput> {
        lock(&self.commands).push(command.to_string());
        match lock(&self.script).pop_front() {
            Some(Scripted::Output(output)) => {
                for line in output.output.lines() {
                    on_line(line);
                }
                Ok(output)
            }
            Some(Scripted::Failure(message)) => {
                Err(NonBuildError::new(message).with_value("command", command).into())
            }
            None => Err(anyhow!("no scripted output left for `{command}`")),
        }
    }
}

#[derive(Default)]
struct VcsState {
    calls: Vec<String>,
    revision: Revision,
    fail_fetch: bool,
    fail_commit: bool,
}

/// Records VCS calls instead of running tools. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingVcs {
    state: Arc<Mutex<VcsState>>,
}

impl RecordingVcs {
    pub fn with_revision(self, revision: &str, last_changed: &str) -> Self {
        lock(&self.state).revision = Revision {
            revision: revision.to_string(),
            last_changed_revision: last_changed.to_string(),
        };
        self
    }

    pub fn failing_fetch(self) -> Self {
        lock(&self.state).fail_fetch = true;
        self
    }

    pub fn failing_commit(self) -> Self {
        lock(&self.state).fail_commit = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: String) {
        lock(&self.state).calls.push(call);
    }
}

impl Vcs for RecordingVcs {
    fn fetch(&self, url: &str, _dest: &Path, update: bool) -> Result<Revision> {
        let verb = if update { "update" } else { "fetch" };
        self.record(format!("{verb} {url}"));
        let state = lock(&self.state);
        if state.fail_fetch {
            return Err(NonBuildError::new("SVN action failed")
                .with_value("command", format!("svn checkout {url}"))
                .into());
        }
        Ok(state.revision.clone())
    }

    fn ensure_tracked(&self, _checkout: &Path, file: &Path) -> Result<()> {
        self.record(format!("ensure_tracked {}", file.display()));
        Ok(())
    }

    fn commit(&self, _checkout: &Path, file: &Path, message: &str) -> Result<()> {
        if lock(&self.state).fail_commit {
            return Err(NonBuildError::new("HG action failed").into());
        }
        self.record(format!("commit {}: {message}", file.display()));
        Ok(())
    }

    fn push(&self, _checkout: &Path) -> Result<()> {
        self.record("push".to_string());
        Ok(())
    }
}

/// Hands out clones of one [`RecordingVcs`] whatever the kind.
pub struct RecordingVcsProvider {
    vcs: RecordingVcs,
}

impl RecordingVcsProvider {
    pub fn new(vcs: RecordingVcs) -> Self {
        Self { vcs }
    }
}

impl VcsProvider for RecordingVcsProvider {
    fn client(&self, _kind: VcsKind, _credentials: Option<&Credentials>) -> Box<dyn Vcs> {
        Box::new(self.vcs.clone())
    }
}

#[derive(Default)]
struct SummaryState {
    changed: bool,
    fail_commit: bool,
    commits: Vec<(String, String)>,
}

/// In-memory summary store. Reports every summary as changed unless told otherwise.
#[derive(Clone)]
pub struct RecordingSummaryStore {
    state: Arc<Mutex<SummaryState>>,
}

impl Default for RecordingSummaryStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SummaryState {
                changed: true,
                ..SummaryState::default()
            })),
        }
    }
}

impl RecordingSummaryStore {
    pub fn unchanged(self) -> Self {
        lock(&self.state).changed = false;
        self
    }

    pub fn failing_commit(self) -> Self {
        lock(&self.state).fail_commit = true;
        self
    }

    /// `(project, message)` per commit.
    pub fn commits(&self) -> Vec<(String, String)> {
        lock(&self.state).commits.clone()
    }
}

impl SummaryStore for RecordingSummaryStore {
    fn diff(&self, _project: &str, _current: &str) -> Result<bool> {
        Ok(lock(&self.state).changed)
    }

    fn commit(&self, project: &str, _current: &str, message: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_commit {
            return Err(NonBuildError::new("HG action failed")
                .with_value("command", "hg push")
                .into());
        }
        state.commits.push((project.to_string(), message.to_string()));
        Ok(())
    }
}

/// Remembers `(project, revision)` of every upload.
#[derive(Clone, Default)]
pub struct RecordingUploader {
    uploads: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingUploader {
    pub fn uploads(&self) -> Vec<(String, String)> {
        lock(&self.uploads).clone()
    }
}

impl ReleaseUploader for RecordingUploader {
    fn upload(
        &self,
        project: &str,
        revision: &str,
        _credentials: Option<&Credentials>,
        _archive: &Path,
    ) -> Result<()> {
        lock(&self.uploads).push((project.to_string(), revision.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[derive(Clone, Default)]
pub struct CapturingMailer {
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl CapturingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        lock(&self.sent).clone()
    }
}

impl Mailer for CapturingMailer {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        lock(&self.sent).push(SentMail {
            subject: subject.to_string(),
            body: body.to_string(),
            recipients: recipients.to_vec(),
        });
        Ok(())
    }
}

/// Temporary directory holding a config file and whatever a test writes next to it.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create temp workspace")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path with forward slashes, safe to paste into TOML strings.
    pub fn toml_path(&self, relative: &str) -> String {
        self.path()
            .join(relative)
            .display()
            .to_string()
            .replace('\\', "/")
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        let path = self.path().join(relative);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}
