//! Committed run summaries.
//!
//! After a build the run's summary log is compared with the copy last committed
//! to the project's summary repository. Only real changes are committed, so the
//! repository history doubles as a log of status changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument};

use crate::io::config::{Args, AsteConfig};
use crate::io::vcs::{Vcs, VcsProvider};

pub trait SummaryStore {
    /// Whether `current` differs from the committed summary of `project`.
    ///
    /// Projects without a summary repository never differ.
    fn diff(&self, project: &str, current: &str) -> Result<bool>;
    fn commit(&self, project: &str, current: &str, message: &str) -> Result<()>;
}

struct SummaryTarget {
    checkout: PathBuf,
    file: String,
    vcs: Box<dyn Vcs>,
}

impl SummaryTarget {
    fn path(&self) -> PathBuf {
        self.checkout.join(&self.file)
    }
}

/// Summaries kept as files in version-controlled working copies.
pub struct FileSummaryStore {
    targets: BTreeMap<String, SummaryTarget>,
}

impl FileSummaryStore {
    pub fn from_config(cfg: &AsteConfig, args: &Args, provider: &dyn VcsProvider) -> Result<Self> {
        let mut targets = BTreeMap::new();
        for (name, project) in &cfg.projects {
            let Some(summary) = &project.summary else {
                continue;
            };
            let checkout = cfg
                .render(&summary.checkout, Some(name), args, &BTreeMap::new())
                .with_context(|| format!("summary checkout of {name}"))?;
            targets.insert(
                name.clone(),
                SummaryTarget {
                    checkout: PathBuf::from(checkout),
                    file: summary.file_name(&cfg.logging).to_string(),
                    vcs: provider.client(summary.vcs, summary.credentials.as_ref()),
                },
            );
        }
        Ok(Self { targets })
    }
}

impl SummaryStore for FileSummaryStore {
    fn diff(&self, project: &str, current: &str) -> Result<bool> {
        let Some(target) = self.targets.get(project) else {
            debug!(project, "no summary repository configured");
            return Ok(false);
        };
        let path = target.path();
        if !path.is_file() {
            return Ok(true);
        }
        let committed =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(summaries_differ(current, &committed))
    }

    #[instrument(skip_all, fields(project))]
    fn commit(&self, project: &str, current: &str, message: &str) -> Result<()> {
        let Some(target) = self.targets.get(project) else {
            return Ok(());
        };
        fs::create_dir_all(&target.checkout)
            .with_context(|| format!("create directory {}", target.checkout.display()))?;
        let path = target.path();
        fs::write(&path, current).with_context(|| format!("write {}", path.display()))?;
        let file = Path::new(&target.file);
        target.vcs.ensure_tracked(&target.checkout, file)?;
        target.vcs.commit(&target.checkout, file, message)?;
        target.vcs.push(&target.checkout)?;
        debug!(path = %path.display(), "summary committed");
        Ok(())
    }
}

/// Compare summaries ignoring timestamps and `#` header lines.
pub fn summaries_differ(a: &str, b: &str) -> bool {
    let a: Vec<String> = a.lines().map(normalize_line).collect();
    let b: Vec<String> = b.lines().map(normalize_line).collect();
    a != b
}

fn normalize_line(line: &str) -> String {
    static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\]").expect("timestamp regex is valid")
    });
    if line.starts_with('#') {
        return String::new();
    }
    TIMESTAMP.replace_all(line, "").into_owned()
}
