//! Nightly build bot: runs build steps and classifies their output.
//!
//! A task checks out projects, runs their build and test commands, and sorts
//! every line of output into accepted findings (warnings worth reading) and
//! fatal errors. Fatal errors are attributed either to the code
//! ([`error::BuildError`]) or to the machine ([`error::NonBuildError`]); only
//! the former leads to a committed run summary.
//!
//! - **[`core`]**: classification, rule sets, run state and report rendering.
//!   No I/O.
//! - **[`io`]**: processes, logs, version control, mail, release archives.
//! - **[`step`]**, **[`task`]**, **[`run`]**: orchestration, from one command
//!   to a full `aste start`.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod step;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
