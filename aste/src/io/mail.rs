//! Delivering the run report by mail.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use tracing::{debug, instrument};

use crate::error::NonBuildError;

pub trait Mailer {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()>;
}

/// Plain-text RFC 5322 message.
pub fn compose(sender: &str, recipients: &[String], subject: &str, body: &str) -> String {
    let mut message = String::new();
    if !sender.is_empty() {
        message.push_str(&format!("From: {sender}\n"));
    }
    message.push_str(&format!("To: {}\n", recipients.join(", ")));
    message.push_str(&format!("Subject: {subject}\n"));
    message.push_str(&format!("Date: {}\n", Local::now().to_rfc2822()));
    message.push_str("MIME-Version: 1.0\n");
    message.push_str("Content-Type: text/plain; charset=utf-8\n");
    message.push_str("Content-Transfer-Encoding: 8bit\n");
    message.push('\n');
    message.push_str(body);
    if !body.ends_with('\n') {
        message.push('\n');
    }
    message
}

/// Pipes the message into a local mail program (`sendmail -t -i`).
#[derive(Debug, Clone)]
pub struct CommandMailer {
    program: Vec<String>,
    sender: String,
}

impl CommandMailer {
    pub fn new(program: Vec<String>, sender: impl Into<String>) -> Self {
        Self {
            program,
            sender: sender.into(),
        }
    }
}

impl Mailer for CommandMailer {
    #[instrument(skip_all, fields(recipients = recipients.len()))]
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        let (program, args) = self
            .program
            .split_first()
            .ok_or_else(|| anyhow!("mail program is empty"))?;
        let message = compose(&self.sender, recipients, subject, body);
        let failed = |cause: String| -> anyhow::Error {
            NonBuildError::new("Could not send mail")
                .with_value("command", self.program.join(" "))
                .with_value("cause", cause)
                .into()
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| failed(err.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .map_err(|err| failed(err.to_string()))?;
        }
        let status = child.wait().context("wait for mail program")?;
        if !status.success() {
            return Err(failed(format!("exit status {status}")));
        }
        debug!("mail handed to mail program");
        Ok(())
    }
}

/// Writes each message as an `.eml` file.
#[derive(Debug, Clone)]
pub struct OutboxMailer {
    dir: PathBuf,
    sender: String,
}

impl OutboxMailer {
    pub fn new(dir: impl Into<PathBuf>, sender: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            sender: sender.into(),
        }
    }
}

impl Mailer for OutboxMailer {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create outbox {}", self.dir.display()))?;
        let stem = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let mut path = self.dir.join(format!("{stem}.eml"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}-{n}.eml"));
            n += 1;
        }
        fs::write(&path, compose(&self.sender, recipients, subject, body))
            .with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "mail written to outbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn composes_plain_text_message() {
        let message = compose(
            "aste@example.org",
            &["dev@example.org".to_string(), "qa@example.org".to_string()],
            "[Aste] nightly: OK",
            "Boogie:\n  OK",
        );
        assert!(message.starts_with(
            "From: aste@example.org\nTo: dev@example.org, qa@example.org\nSubject: [Aste] nightly: OK\nDate: "
        ));
        assert!(message.contains("Content-Type: text/plain; charset=utf-8\n"));
        assert!(message.ends_with("\n\nBoogie:\n  OK\n"));
    }

    #[test]
    fn outbox_keeps_every_message() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mailer = OutboxMailer::new(temp.path().join("outbox"), "aste@example.org");
        let to = vec!["dev@example.org".to_string()];
        mailer.send("first", "one", &to).expect("send");
        mailer.send("second", "two", &to).expect("send");
        let count = fs::read_dir(temp.path().join("outbox"))
            .expect("read dir")
            .count();
        assert_eq!(count, 2);
    }

    #[cfg(unix)]
    #[test]
    fn command_mailer_pipes_message_to_program() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = temp.path().join("mail.txt");
        let mailer = CommandMailer::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat > '{}'", sink.display()),
            ],
            "",
        );
        mailer
            .send("[Aste] nightly: OK", "body", &["dev@example.org".to_string()])
            .expect("send");
        let sent = fs::read_to_string(&sink).expect("read");
        assert!(sent.starts_with("To: dev@example.org\nSubject: [Aste] nightly: OK\n"));
    }

    #[test]
    fn missing_mail_program_is_infrastructure_error() {
        let mailer = CommandMailer::new(vec!["aste-no-such-sendmail".to_string()], "");
        let err = mailer
            .send("s", "b", &["dev@example.org".to_string()])
            .expect_err("spawn fails");
        assert_eq!(ErrorKind::of(&err), ErrorKind::NonBuild);
    }
}
