//! Regression-test harness for radare2: reads the `db/` test grammar, runs
//! every record against the tool with bounded concurrency and reports which
//! expectations held.

pub mod classify;
pub mod config;
pub mod discover;
pub mod engine;
pub mod error;
pub mod fix;
pub mod harness;
pub mod normalize;
pub mod parse;
pub mod record;
pub mod report;
pub mod schedule;
pub mod source;
pub mod token;
pub mod triage;
