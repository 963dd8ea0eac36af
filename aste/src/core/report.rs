//! Final report: per-project status, subject line, rendered errors.
//!
//! Every run ends with exactly one report, whatever state the task reached.

use anyhow::{Context, Result};
use minijinja::{Environment as Templates, context};
use serde::Serialize;
use serde_json::Value;

use crate::core::environment::Environment;
use crate::error::{ErrorDetails, ErrorKind, details_of};

pub const INDENT: &str = "  ";
const WIDTH: usize = 80;
const REPORT_TEMPLATE: &str = include_str!("templates/report.txt");

/// Render a typed error's context, message and values.
///
/// ```text
/// Error context:
///   Building Boogie
///
/// Error message:
///   Found build errors.
///
///   command=msbuild Boogie.sln
/// ```
pub fn format_error(details: &ErrorDetails) -> String {
    let mut sections = Vec::new();
    if let Some(context) = details.context.as_deref().filter(|c| !c.is_empty()) {
        sections.push(titled("Error context", context));
    }
    if !details.message.is_empty() {
        sections.push(titled("Error message", &details.message));
    }
    let mut text = sections.join("\n");
    if !details.values.is_empty() {
        let pairs: Vec<String> = details
            .values
            .iter()
            .map(|(key, value)| {
                let pair = format!("{key}={}", render_value(value));
                wrap(&pair, WIDTH - INDENT.len(), INDENT, &INDENT.repeat(3))
            })
            .collect();
        text.push('\n');
        text.push_str(&pairs.join("\n"));
    }
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Render any error for the report body.
///
/// Typed errors use [`format_error`]; unexpected errors include the full chain.
pub fn render_error(err: &anyhow::Error) -> String {
    match details_of(err) {
        Some(details) => format_error(details),
        None => {
            let mut text = titled("Unexpected error", &format!("{err:#}"));
            text.push_str("\nTrace:\n");
            for line in format!("{err:?}").lines() {
                text.push_str(INDENT);
                text.push_str(line);
                text.push('\n');
            }
            text
        }
    }
}

/// One block per project, in the order projects were first touched.
pub fn status_report(env: &Environment) -> String {
    let blocks: Vec<String> = env
        .projects()
        .iter()
        .map(|project| {
            let mut text = format!("{}:", project.name);
            if let Some(revision) = &project.revision {
                text.push(' ');
                text.push_str(&revision.last_changed_revision);
            }
            text.push('\n');
            let verdict = if !project.build.started {
                "Build not performed".to_string()
            } else if project.is_ok() {
                "OK".to_string()
            } else if !project.build.success {
                "Build failed".to_string()
            } else {
                format!("{} test(s) failed", project.tests.failed.len())
            };
            text.push_str(&format!("{INDENT}{verdict}\n"));
            if env.has_committed(&project.name) {
                text.push_str(&format!("{INDENT}Summary changed\n"));
            }
            text
        })
        .collect();
    blocks.join("\n")
}

/// Subject line: `<task>: <pieces>` where pieces name the error kind, failed
/// tests, and committed summaries, or `OK`.
pub fn report_subject(env: &Environment, error: Option<ErrorKind>) -> String {
    let mut pieces = Vec::new();
    if let Some(kind) = error {
        pieces.push(kind.as_str());
    }
    if env.any_tests_failed() {
        pieces.push("Tests failed");
    }
    if !env.commits.is_empty() {
        pieces.push("Summaries committed");
    }
    let summary = if pieces.is_empty() {
        "OK".to_string()
    } else {
        pieces.join(", ")
    };
    match env.task_name.as_deref() {
        Some(task) if !task.is_empty() => format!("{task}: {summary}"),
        _ => summary,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryLink {
    pub project: String,
    pub url: String,
}

/// Run facts shown under "Additional information".
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportInfo {
    pub host_id: String,
    pub config_path: String,
    pub tests: bool,
    pub short_tests_only: bool,
    pub upload_summary: bool,
    pub upload_build: bool,
    pub summary_links: Vec<SummaryLink>,
}

/// Full report body: status, separator, rendered error, run information.
pub fn render_report(env: &Environment, info: &ReportInfo, error: Option<&str>) -> Result<String> {
    let mut templates = Templates::new();
    templates
        .add_template("report", REPORT_TEMPLATE)
        .context("load report template")?;
    let template = templates.get_template("report")?;
    let rendered = template
        .render(context! {
            status => status_report(env).trim_end(),
            rule => "-".repeat(70),
            error => error.map(str::trim_end),
            indent => INDENT,
            host_id => &info.host_id,
            config_path => &info.config_path,
            tests => info.tests,
            short_tests_only => info.short_tests_only,
            upload_summary => info.upload_summary,
            upload_build => info.upload_build,
            summary_links => &info.summary_links,
        })
        .context("render report")?;
    Ok(rendered)
}

fn titled(title: &str, text: &str) -> String {
    let longest = text.lines().map(str::len).max().unwrap_or(0);
    let body = if longest > WIDTH {
        wrap(text, WIDTH, INDENT, INDENT)
    } else {
        text.lines()
            .map(|line| format!("{INDENT}{line}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!("{title}:\n{body}\n")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Greedy word wrap; words longer than the width get a line of their own.
fn wrap(text: &str, width: usize, initial: &str, subsequent: &str) -> String {
    let mut lines = Vec::new();
    let mut line = initial.to_string();
    let mut indent_len = initial.len();
    for word in text.split_whitespace() {
        let fits = line.len() + 1 + word.len() <= width;
        if line.len() > indent_len && !fits {
            lines.push(std::mem::replace(&mut line, subsequent.to_string()));
            indent_len = subsequent.len();
        }
        if line.len() > indent_len {
            line.push(' ');
        }
        line.push_str(word);
    }
    lines.push(line);
    lines.join("\n")
}
