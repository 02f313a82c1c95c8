//! # ruleforge
//!
//! Command line layer over `ruleforge-core`: file handling, configuration
//! and report output. The core stays free of I/O.

pub mod cli;
pub mod config;
