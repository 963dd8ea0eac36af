//! Deterministic, pure logic for classifying build output and reporting.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod environment;
pub mod report;
pub mod rot47;
pub mod rules;
pub mod rulesets;
pub mod types;
