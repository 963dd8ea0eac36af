//! Side-effecting adapters: processes, files, version control, mail.

pub mod config;
pub mod mail;
pub mod process;
pub mod release;
pub mod run_log;
pub mod summary;
pub mod timings;
pub mod vcs;
