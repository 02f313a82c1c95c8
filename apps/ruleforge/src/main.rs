//! # Ruleforge
//!
//! The command line tool for compiling, packaging and reloading rule
//! knowledge bases.
//!
//! ## Usage
//!
//! ```bash
//! # Compile one definition into a package-set snapshot
//! ruleforge compile -s rules.drl -d facts.drl -o rules.rfp
//!
//! # Build a full base and fire it
//! ruleforge build -s rules.drl -s audit.drl -o base.rfkb
//! ruleforge fire -i base.rfkb --facts facts.json
//!
//! # Swap in new package versions before first use
//! ruleforge reload -i base.rfkb -p rules.rfp -o base2.rfkb
//! ```
//!
//! Logging: `RULEFORGE_LOG` (or `RUST_LOG`) sets the filter,
//! `RULEFORGE_LOG_FORMAT=json` enables machine-parseable output.

use clap::Parser;
use ruleforge::cli;
use ruleforge::config::{Config, LogFormat};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config.with_context(cli.context.clone()),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config, cli.verbose);

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli, &config) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the subscriber; the environment wins over the config file.
fn init_tracing(config: &Config, verbose: bool) {
    let format = match std::env::var("RULEFORGE_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok(_) => LogFormat::Text,
        Err(_) => config.logging.format,
    };

    let default_filter = if verbose {
        "ruleforge=debug,ruleforge_core=debug"
    } else {
        "ruleforge=info,ruleforge_core=info"
    };
    let filter = EnvFilter::try_from_env("RULEFORGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| default_filter.into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Print the startup banner to stderr.
fn print_banner() {
    eprintln!(
        r#"
  ruleforge v{}
  deterministic rule packaging
"#,
        env!("CARGO_PKG_VERSION")
    );
}
