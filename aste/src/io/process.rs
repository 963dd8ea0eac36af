//! Running build commands with combined, line-streamed output.
//!
//! Commands are operator-written shell lines (`msbuild Boogie.sln /t:Rebuild`),
//! so they run through the platform shell with stderr folded into stdout.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::NonBuildError;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exit status and everything the command printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub return_code: i32,
    /// Combined stdout/stderr, one `\n` after every line.
    pub output: String,
}

/// Runs one command line, forwarding each output line to `on_line` as it arrives.
pub trait ProcessRunner {
    fn execute(
        &self,
        command: &str,
        workdir: Option<&Path>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ProcessOutput>;
}

/// Runs commands through `sh` (or `cmd` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellProcessRunner {
    /// Kill the command after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl ShellProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl ProcessRunner for ShellProcessRunner {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.map(|t| t.as_secs())))]
    fn execute(
        &self,
        command: &str,
        workdir: Option<&Path>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ProcessOutput> {
        let mut cmd = shell_command(command);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command, "spawning command");
        let mut child = cmd.spawn().map_err(|err| {
            NonBuildError::new("Could not start command")
                .with_value("command", command)
                .with_value("cause", err.to_string())
        })?;

        let (tx, rx) = mpsc::channel();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let readers = [
            spawn_line_reader(stdout, tx.clone()),
            spawn_line_reader(stderr, tx),
        ];

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut output = String::new();
        // Stop only once every reader hit EOF and the child has exited.
        let status = loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    on_line(&line);
                    output.push_str(&line);
                    output.push('\n');
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break wait_for_exit(&mut child, deadline, command)?;
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(kill_timed_out(&mut child, command, self.timeout));
            }
        };

        for reader in readers {
            if reader.join().is_err() {
                warn!("output reader thread panicked");
            }
        }

        let return_code = status.code().unwrap_or(-1);
        debug!(return_code, "command finished");
        Ok(ProcessOutput {
            return_code,
            output,
        })
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(format!("exec 2>&1; {command}"));
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(format!("({command}) 2>&1"));
    cmd
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(err = %err, "failed to read command output");
                    break;
                }
            }
        }
    })
}

fn wait_for_exit(child: &mut Child, deadline: Option<Instant>, command: &str) -> Result<ExitStatus> {
    match deadline {
        None => child.wait().context("wait for command"),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match child.wait_timeout(remaining).context("wait for command")? {
                Some(status) => Ok(status),
                None => Err(kill_timed_out(child, command, None)),
            }
        }
    }
}

fn kill_timed_out(child: &mut Child, command: &str, timeout: Option<Duration>) -> anyhow::Error {
    warn!(command, "command timed out, killing");
    if let Err(err) = child.kill() {
        warn!(err = %err, "failed to kill timed out command");
    }
    let _ = child.wait();
    let mut err = NonBuildError::new("Command timed out").with_value("command", command);
    if let Some(timeout) = timeout {
        err = err.with_value("timeout_secs", timeout.as_secs());
    }
    err.into()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, NonBuildError};

    #[test]
    fn streams_combined_output_in_order() {
        let runner = ShellProcessRunner::default();
        let mut seen = Vec::new();
        let out = runner
            .execute("echo one; echo two >&2; echo three", None, &mut |line| {
                seen.push(line.to_string())
            })
            .expect("execute");
        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(out.output, "one\ntwo\nthree\n");
        assert_eq!(out.return_code, 0);
    }

    #[test]
    fn reports_nonzero_return_code() {
        let runner = ShellProcessRunner::default();
        let out = runner.execute("exit 3", None, &mut |_| {}).expect("execute");
        assert_eq!(out.return_code, 3);
        assert!(out.output.is_empty());
    }

    #[test]
    fn runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let runner = ShellProcessRunner::default();
        let out = runner
            .execute("cat marker.txt", Some(temp.path()), &mut |_| {})
            .expect("execute");
        assert_eq!(out.output, "here\n");
    }

    #[test]
    fn timeout_kills_and_raises_infrastructure_error() {
        let runner = ShellProcessRunner::new(Some(Duration::from_millis(300)));
        let err = runner
            .execute("sleep 5", None, &mut |_| {})
            .expect_err("timeout");
        assert_eq!(ErrorKind::of(&err), ErrorKind::NonBuild);
        let typed = err.downcast_ref::<NonBuildError>().expect("typed");
        assert_eq!(typed.value("command"), Some(&serde_json::json!("sleep 5")));
    }
}
