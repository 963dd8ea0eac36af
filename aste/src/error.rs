//! Typed build failures carried inside `anyhow::Error`.
//!
//! - [`BuildError`]: the code under build is at fault (compile errors, failed
//!   tests, escalated findings). Tasks still commit their summary.
//! - [`NonBuildError`]: the build machine is at fault (VCS, network, locked
//!   files, missing tools). Tasks skip the summary commit.
//!
//! Anything else is an unexpected error. Callers branch with
//! [`ErrorKind::of`], which looks through `anyhow` context layers.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Payload shared by both typed errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDetails {
    pub message: String,
    /// What the tool was doing when the error happened (e.g. "Building Boogie").
    pub context: Option<String>,
    /// Structured values rendered as `key=value` lines in reports.
    pub values: BTreeMap<String, Value>,
}

impl ErrorDetails {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            values: BTreeMap::new(),
        }
    }

    /// Innermost context wins: once set it is never overwritten.
    fn fill_context(&mut self, context: &str) {
        if self.context.is_none() && !context.is_empty() {
            self.context = Some(context.to_string());
        }
    }
}

/// Failure attributable to the code being built.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", .details.message)]
pub struct BuildError {
    details: ErrorDetails,
}

/// Failure attributable to the build infrastructure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", .details.message)]
pub struct NonBuildError {
    details: ErrorDetails,
}

macro_rules! detailed_error {
    ($ty:ident) => {
        impl $ty {
            pub fn new(message: impl Into<String>) -> Self {
                Self {
                    details: ErrorDetails::new(message),
                }
            }

            pub fn with_context(mut self, context: impl Into<String>) -> Self {
                self.details.context = Some(context.into());
                self
            }

            pub fn with_value(mut self, key: &str, value: impl Into<Value>) -> Self {
                self.details.values.insert(key.to_string(), value.into());
                self
            }

            pub fn details(&self) -> &ErrorDetails {
                &self.details
            }

            pub fn value(&self, key: &str) -> Option<&Value> {
                self.details.values.get(key)
            }
        }
    };
}

detailed_error!(BuildError);
detailed_error!(NonBuildError);

/// Coarse classification of an error for routing and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Build,
    NonBuild,
    Unexpected,
}

impl ErrorKind {
    pub fn of(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<BuildError>().is_some() {
            ErrorKind::Build
        } else if err.downcast_ref::<NonBuildError>().is_some() {
            ErrorKind::NonBuild
        } else {
            ErrorKind::Unexpected
        }
    }

    /// Name used in report subjects.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Build => "BuildError",
            ErrorKind::NonBuild => "NonBuildError",
            ErrorKind::Unexpected => "Error",
        }
    }
}

/// Details of a typed error, if `err` carries one.
pub fn details_of(err: &anyhow::Error) -> Option<&ErrorDetails> {
    if let Some(build) = err.downcast_ref::<BuildError>() {
        return Some(build.details());
    }
    err.downcast_ref::<NonBuildError>().map(NonBuildError::details)
}

/// Attach a context string to errors leaving an operation.
///
/// Typed errors record it in [`ErrorDetails::context`] (if not already set).
/// [`error_context`](Self::error_context) gives other errors an ordinary
/// `anyhow` context layer; [`typed_context`](Self::typed_context) leaves them
/// untouched.
pub trait ErrorContextExt<T> {
    fn error_context(self, context: &str) -> anyhow::Result<T>;
    fn typed_context(self, context: &str) -> anyhow::Result<T>;
}

impl<T> ErrorContextExt<T> for anyhow::Result<T> {
    fn error_context(self, context: &str) -> anyhow::Result<T> {
        self.map_err(|mut err| {
            if fill_typed_context(&mut err, context) {
                err
            } else {
                err.context(context.to_string())
            }
        })
    }

    fn typed_context(self, context: &str) -> anyhow::Result<T> {
        self.map_err(|mut err| {
            fill_typed_context(&mut err, context);
            err
        })
    }
}

/// Returns `false` when `err` carries no typed error.
fn fill_typed_context(err: &mut anyhow::Error, context: &str) -> bool {
    if let Some(build) = err.downcast_mut::<BuildError>() {
        build.details.fill_context(context);
        true
    } else if let Some(non_build) = err.downcast_mut::<NonBuildError>() {
        non_build.details.fill_context(context);
        true
    } else {
        false
    }
}
