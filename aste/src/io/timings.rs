//! Test timing history: a JSON file merged across runs, exportable as CSV.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tracing::debug;

use crate::core::environment::Timings;
use crate::io::config::write_atomic;

pub fn load_timings(path: &Path) -> Result<Timings> {
    if !path.exists() {
        return Ok(Timings::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Merge `timings` into the history at `path`. Existing entries are kept;
/// entries for the same timestamp are replaced.
pub fn record_timings(path: &Path, timings: &Timings) -> Result<Timings> {
    let mut merged = load_timings(path)?;
    for (category, tests) in timings {
        let merged_tests = merged.entry(category.clone()).or_default();
        for (test, runs) in tests {
            merged_tests
                .entry(test.clone())
                .or_default()
                .extend(runs.iter().map(|(ts, secs)| (ts.clone(), *secs)));
        }
    }
    write_atomic(path, &to_json(&merged)?)?;
    debug!(path = %path.display(), categories = merged.len(), "timings recorded");
    Ok(merged)
}

/// Write the history as CSV: `Timestamp` then one `category::test` column each.
pub fn export_csv(json: &Path, csv: &Path) -> Result<()> {
    let timings = load_timings(json)?;
    write_atomic(csv, &to_csv(&timings))
}

pub fn to_csv(timings: &Timings) -> String {
    let mut columns = Vec::new();
    let mut timestamps = BTreeSet::new();
    for (category, tests) in timings {
        for (test, runs) in tests {
            columns.push((format!("{category}::{test}"), runs));
            timestamps.extend(runs.keys().cloned());
        }
    }
    let mut out = String::from("Timestamp");
    for (name, _) in &columns {
        out.push(',');
        out.push_str(&csv_field(name));
    }
    out.push('\n');
    for ts in &timestamps {
        out.push_str(&csv_field(ts));
        for (_, runs) in &columns {
            out.push(',');
            if let Some(secs) = runs.get(ts) {
                out.push_str(&secs.to_string());
            }
        }
        out.push('\n');
    }
    out
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn to_json(timings: &Timings) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"  "));
    timings.serialize(&mut ser).context("serialize timings")?;
    let mut text = String::from_utf8(buf).context("timings json is utf-8")?;
    text.push('\n');
    Ok(text)
}
