//! Per-run session state: project records, commits, timings, final status.
//!
//! Exactly one [`Environment`] exists per `aste start`. It is created before
//! the first task runs, passed by `&mut` to everything that records progress,
//! and read by reporting at the end.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::types::Revision;

/// `category -> test name -> ISO-8601 timestamp -> elapsed seconds`.
pub type Timings = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStatus {
    pub started: bool,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestStatus {
    /// Failing test identifiers in discovery order.
    pub failed: Vec<String>,
    pub succeeded: Vec<String>,
}

/// Build and test status of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectRecord {
    pub name: String,
    pub build: BuildStatus,
    pub tests: TestStatus,
    /// Set by checkout.
    pub revision: Option<Revision>,
    pub data: BTreeMap<String, String>,
}

impl ProjectRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.build.success && self.tests.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    #[default]
    Ok,
    Error,
}

/// Last error of the run, kept for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedError {
    /// `BuildError`, `NonBuildError` or `Error`.
    pub kind: String,
    pub rendered: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Environment {
    projects: Vec<ProjectRecord>,
    /// Projects whose summaries were committed this run, in commit order.
    pub commits: Vec<String>,
    pub status: RunStatus,
    pub last_error: Option<RecordedError>,
    pub timings: Timings,
    pub task_name: Option<String>,
}

impl Environment {
    pub fn new(task_name: Option<&str>) -> Self {
        Self {
            task_name: task_name.map(str::to_string),
            ..Self::default()
        }
    }

    /// Record for `name`, created on first use.
    pub fn project_mut(&mut self, name: &str) -> &mut ProjectRecord {
        let index = match self.projects.iter().position(|p| p.name == name) {
            Some(index) => index,
            None => {
                self.projects.push(ProjectRecord::new(name));
                self.projects.len() - 1
            }
        };
        &mut self.projects[index]
    }

    pub fn project(&self, name: &str) -> Option<&ProjectRecord> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Records in creation order.
    pub fn projects(&self) -> &[ProjectRecord] {
        &self.projects
    }

    pub fn record_commit(&mut self, project: &str) {
        self.commits.push(project.to_string());
    }

    pub fn has_committed(&self, project: &str) -> bool {
        self.commits.iter().any(|c| c == project)
    }

    pub fn any_tests_failed(&self) -> bool {
        self.projects.iter().any(|p| !p.tests.failed.is_empty())
    }

    pub fn record_timing(&mut self, category: &str, test: &str, timestamp: &str, seconds: f64) {
        self.timings
            .entry(category.to_string())
            .or_default()
            .entry(test.to_string())
            .or_default()
            .insert(timestamp.to_string(), seconds);
    }

    pub fn record_error(&mut self, kind: &str, rendered: String) {
        self.status = RunStatus::Error;
        self.last_error = Some(RecordedError {
            kind: kind.to_string(),
            rendered,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_records_are_created_once() {
        let mut env = Environment::new(Some("nightly"));
        env.project_mut("Boogie").build.started = true;
        env.project_mut("Chalice");
        env.project_mut("Boogie").tests.failed.push("a".to_string());

        let names: Vec<&str> = env.projects().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Boogie", "Chalice"]);
        let boogie = env.project("Boogie").expect("boogie");
        assert!(boogie.build.started);
        assert_eq!(boogie.tests.failed, vec!["a".to_string()]);
    }

    #[test]
    fn timings_accumulate_per_category_and_test() {
        let mut env = Environment::default();
        env.record_timing("long", "t1", "2011-08-17T15:37:00", 1.5);
        env.record_timing("long", "t1", "2011-08-18T15:37:00", 2.0);
        env.record_timing("use", "t2", "2011-08-18T15:37:00", 0.25);
        assert_eq!(env.timings["long"]["t1"].len(), 2);
        assert_eq!(env.timings["use"]["t2"]["2011-08-18T15:37:00"], 0.25);
    }

    #[test]
    fn recording_an_error_flips_status() {
        let mut env = Environment::default();
        assert_eq!(env.status, RunStatus::Ok);
        env.record_error("BuildError", "Error message:\n  boom\n".to_string());
        assert_eq!(env.status, RunStatus::Error);
        assert_eq!(env.last_error.as_ref().map(|e| e.kind.as_str()), Some("BuildError"));
    }
}
