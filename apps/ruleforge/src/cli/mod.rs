//! # Ruleforge CLI Module
//!
//! This module implements the CLI interface for Ruleforge.
//!
//! ## Available Commands
//!
//! - `compile` - Compile one definition into a package-set snapshot
//! - `build` - Compile definitions into a full knowledge base snapshot
//! - `inspect` - Show the header and packages of a snapshot
//! - `fire` - Materialize a base snapshot and fire its rules
//! - `reload` - Replace packages of a base snapshot

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use ruleforge_core::KnowledgeError;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Ruleforge - rule package compiler and knowledge base tool
///
/// Compiles rule definitions into packages, persists knowledge bases as
/// binary snapshots and reloads rule packages in place.
#[derive(Parser, Debug)]
#[command(name = "ruleforge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (default: ./ruleforge.toml if present)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Loading context for type registries (overrides the config file)
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a rule definition into a package-set snapshot
    Compile {
        /// Rule definition file
        #[arg(short, long)]
        source: PathBuf,

        /// Declared-type source files
        #[arg(short, long)]
        declared: Vec<PathBuf>,

        /// Output snapshot path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Compile definitions and write a full knowledge base snapshot
    Build {
        /// Rule definition files, one package each
        #[arg(short, long, required = true)]
        source: Vec<PathBuf>,

        /// Declared-type source files shared by every definition
        #[arg(short, long)]
        declared: Vec<PathBuf>,

        /// Output snapshot path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show the header and package summary of a snapshot
    Inspect {
        /// Snapshot file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Materialize a base snapshot, insert facts and fire all rules
    Fire {
        /// Full base snapshot
        #[arg(short, long)]
        input: PathBuf,

        /// JSON array of facts: [{"type": "...", "fields": {...}}]
        #[arg(short, long)]
        facts: Option<PathBuf>,

        /// Firing limit (overrides the config file)
        #[arg(long)]
        max_firings: Option<usize>,
    },

    /// Replace packages of a base snapshot with a package-set snapshot
    Reload {
        /// Full base snapshot
        #[arg(short, long)]
        input: PathBuf,

        /// Package-set snapshot holding the new versions
        #[arg(short, long)]
        packages: PathBuf,

        /// Output snapshot path
        #[arg(short, long)]
        output: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute a CLI command.
pub fn execute(cli: Cli, config: &Config) -> Result<(), KnowledgeError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Compile {
            source,
            declared,
            output,
        } => emit(&cmd_compile(&source, &declared, &output)?, json_mode),

        Commands::Build {
            source,
            declared,
            output,
        } => emit(
            &cmd_build(&source, &declared, &output, &config.loading_context())?,
            json_mode,
        ),

        Commands::Inspect { input } => emit(&cmd_inspect(&input)?, json_mode),

        Commands::Fire {
            input,
            facts,
            max_firings,
        } => {
            let limit = max_firings.unwrap_or(config.engine.max_firings);
            emit(
                &cmd_fire(&input, facts.as_deref(), &config.loading_context(), limit)?,
                json_mode,
            )
        }

        Commands::Reload {
            input,
            packages,
            output,
        } => emit(
            &cmd_reload(
                &input,
                &packages,
                &output,
                &config.loading_context(),
                config.reload_policy(),
            )?,
            json_mode,
        ),
    }
}

/// Print a command report as pretty JSON or text.
fn emit<R: Serialize + Display>(report: &R, json_mode: bool) -> Result<(), KnowledgeError> {
    println!("{}", render(report, json_mode)?);
    Ok(())
}

fn render<R: Serialize + Display>(report: &R, json_mode: bool) -> Result<String, KnowledgeError> {
    if json_mode {
        serde_json::to_string_pretty(report)
            .map_err(|e| KnowledgeError::SerializationError(format!("Report: {}", e)))
    } else {
        Ok(report.to_string())
    }
}
