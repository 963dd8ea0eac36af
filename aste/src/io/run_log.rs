//! Product logs of one `aste start` run.
//!
//! - verbose log: every command output line and every note.
//! - summary log: notes meant for humans plus accepted findings. It is the file
//!   committed to the summary repository, so it must stay diffable.
//!
//! Unlike tracing output these logs are always written and never filtered.
//! Write failures are reported through tracing and otherwise ignored: a full
//! disk must not turn into a build failure.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::warn;

use crate::io::config::LoggingConfig;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const FINDING_INDENT: &str = "    ";

#[derive(Debug)]
enum Channel {
    File { path: PathBuf, file: File },
    Memory(String),
}

impl Channel {
    fn write_line(&mut self, line: &str) {
        match self {
            Channel::File { path, file } => {
                if let Err(err) = writeln!(file, "{line}") {
                    warn!(path = %path.display(), err = %err, "failed to write log line");
                }
            }
            Channel::Memory(buf) => {
                buf.push_str(line);
                buf.push('\n');
            }
        }
    }

    fn contents(&self) -> Result<String> {
        match self {
            Channel::File { path, .. } => {
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
            }
            Channel::Memory(buf) => Ok(buf.clone()),
        }
    }
}

#[derive(Debug)]
struct Channels {
    verbose: Channel,
    summary: Channel,
}

#[derive(Debug)]
pub struct RunLog {
    channels: Mutex<Channels>,
    echo: bool,
    summary_path: Option<PathBuf>,
}

impl RunLog {
    /// Rotate old logs in `config.dir` and start fresh ones.
    pub fn open(config: &LoggingConfig, host_id: &str) -> Result<Self> {
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("create log directory {}", config.dir.display()))?;
        let verbose_path = config.dir.join(&config.verbose_file);
        let summary_path = config.dir.join(&config.summary_file);
        let verbose = open_rotated(&verbose_path, config.backups)?;
        let summary = open_rotated(&summary_path, config.backups)?;
        let log = Self {
            channels: Mutex::new(Channels {
                verbose: Channel::File {
                    path: verbose_path,
                    file: verbose,
                },
                summary: Channel::File {
                    path: summary_path.clone(),
                    file: summary,
                },
            }),
            echo: config.echo,
            summary_path: Some(summary_path),
        };
        log.start(host_id);
        Ok(log)
    }

    /// Logs kept in memory only (`--no-file-logging`, tests).
    pub fn in_memory(host_id: &str, echo: bool) -> Self {
        let log = Self {
            channels: Mutex::new(Channels {
                verbose: Channel::Memory(String::new()),
                summary: Channel::Memory(String::new()),
            }),
            echo,
            summary_path: None,
        };
        log.start(host_id);
        log
    }

    fn start(&self, host_id: &str) {
        self.header(&format!("Aste started: {}", timestamp()));
        self.header(&format!("Host id: {host_id}"));
    }

    /// `# <text>` in both logs. Summary diffs ignore these lines.
    pub fn header(&self, text: &str) {
        let line = format!("# {text}");
        self.with_channels(|c| {
            c.verbose.write_line(&line);
            c.summary.write_line(&line);
        });
        self.echo(&line);
    }

    /// Timestamped line in the verbose log.
    pub fn note(&self, text: &str) {
        let line = stamped(text);
        self.with_channels(|c| c.verbose.write_line(&line));
        self.echo(&line);
    }

    /// One line of command output, verbatim.
    pub fn output_line(&self, line: &str) {
        self.with_channels(|c| c.verbose.write_line(line));
        self.echo(line);
    }

    /// Timestamped line in both logs.
    pub fn note_summary(&self, text: &str) {
        let line = stamped(text);
        self.with_channels(|c| {
            c.verbose.write_line(&line);
            c.summary.write_line(&line);
        });
        self.echo(&line);
    }

    /// A command line followed by its findings, indented.
    pub fn findings(&self, command: &str, findings: &[String]) {
        self.note_summary(command);
        if findings.is_empty() {
            return;
        }
        self.with_channels(|c| {
            for finding in findings {
                for line in finding.lines() {
                    let line = format!("{FINDING_INDENT}{line}");
                    c.verbose.write_line(&line);
                    c.summary.write_line(&line);
                }
            }
        });
    }

    /// Rendered error text, both logs.
    pub fn report_error(&self, rendered: &str) {
        self.with_channels(|c| {
            for line in rendered.lines() {
                c.verbose.write_line(line);
                c.summary.write_line(line);
            }
        });
    }

    pub fn summary_text(&self) -> Result<String> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Channel::File { file, .. } = &channels.summary {
            file.sync_data().context("flush summary log")?;
        }
        channels.summary.contents()
    }

    pub fn verbose_text(&self) -> Result<String> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.verbose.contents()
    }

    /// Location of the summary log, when it is on disk.
    pub fn summary_path(&self) -> Option<&Path> {
        self.summary_path.as_deref()
    }

    fn with_channels(&self, f: impl FnOnce(&mut Channels)) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut channels);
    }

    fn echo(&self, line: &str) {
        if self.echo {
            println!("{line}");
        }
    }
}

pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn stamped(text: &str) -> String {
    format!("[{}] {text}", timestamp())
}

/// `name` -> `name.1` -> ... -> `name.<backups>`, then a fresh `name`.
fn open_rotated(path: &Path, backups: u32) -> Result<File> {
    if backups > 0 && path.exists() {
        for index in (1..backups).rev() {
            let from = backup_path(path, index);
            if from.exists() {
                let to = backup_path(path, index + 1);
                fs::rename(&from, &to)
                    .with_context(|| format!("rotate {} to {}", from.display(), to.display()))?;
            }
        }
        let first = backup_path(path, 1);
        fs::rename(path, &first)
            .with_context(|| format!("rotate {} to {}", path.display(), first.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_gets_headers_notes_and_findings() {
        let log = RunLog::in_memory("build-01", false);
        log.output_line("compiling...");
        log.note_summary("Building Boogie");
        log.findings(
            "msbuild Boogie.sln",
            &["warning CS0168: unused".to_string()],
        );

        let summary = log.summary_text().expect("summary");
        let lines: Vec<&str> = summary.lines().collect();
        assert!(lines[0].starts_with("# Aste started: "));
        assert_eq!(lines[1], "# Host id: build-01");
        assert!(lines[2].ends_with("] Building Boogie"));
        assert!(lines[3].ends_with("] msbuild Boogie.sln"));
        assert_eq!(lines[4], "    warning CS0168: unused");
        assert!(!summary.contains("compiling..."));

        let verbose = log.verbose_text().expect("verbose");
        assert!(verbose.contains("compiling...\n"));
    }

    #[test]
    fn open_rotates_previous_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = LoggingConfig {
            dir: temp.path().join("logs"),
            backups: 2,
            ..LoggingConfig::default()
        };
        for run in 0..4 {
            let log = RunLog::open(&config, "build-01").expect("open");
            log.note_summary(&format!("run {run}"));
        }
        let summary = config.dir.join("summary.log");
        let read = |path: PathBuf| fs::read_to_string(path).expect("read");
        assert!(read(summary.clone()).contains("run 3"));
        assert!(read(backup_path(&summary, 1)).contains("run 2"));
        assert!(read(backup_path(&summary, 2)).contains("run 1"));
        assert!(!backup_path(&summary, 3).exists());
    }

    #[test]
    fn file_log_exposes_summary_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = LoggingConfig {
            dir: temp.path().to_path_buf(),
            ..LoggingConfig::default()
        };
        let log = RunLog::open(&config, "build-01").expect("open");
        log.note_summary("hello");
        assert_eq!(log.summary_path(), Some(temp.path().join("summary.log").as_path()));
        assert!(log.summary_text().expect("text").contains("] hello"));
    }
}
