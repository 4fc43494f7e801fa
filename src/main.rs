//! oob-bootstrap - out-of-band communicator bootstrap
//!
//! Entry point for the oob-bootstrap binary. Besides configuration
//! management it can simulate a whole peer group in one process.

mod cli;

use clap::Parser;
use tracing::info;

use oob_bootstrap::config::{self, BootstrapConfig};
use oob_bootstrap::error::{Error, Result};
use oob_bootstrap::logging::{self, LogGuards};
use oob_bootstrap::simulate::{self, SimulationOptions};
use oob_bootstrap::version;

use crate::cli::{Cli, Commands, ConfigSubcommand};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // For commands that don't need full logging, use simple setup
    match &cli.command {
        Commands::Version { short } => {
            version::print_version(*short);
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Simulate { .. } => {}
    }

    let config_path = match &cli.command {
        Commands::Simulate { config, .. } => config.clone(),
        _ => None,
    };

    let config = match BootstrapConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting oob-bootstrap"
    );

    match cli.command {
        Commands::Simulate {
            peers,
            msg_len,
            ops,
            trace,
            ..
        } => {
            let options = SimulationOptions {
                peers: peers as usize,
                msg_len,
                ops,
                trace,
            };
            if let Err(e) = run_simulation(options, config, cli.quiet) {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        }
        Commands::Version { .. } | Commands::Config { .. } => {
            // Already handled above
            unreachable!();
        }
    }

    Ok(())
}

fn init_logging_from_config(config: &BootstrapConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

/// Run the in-process simulation on a multi-threaded runtime
fn run_simulation(options: SimulationOptions, config: BootstrapConfig, quiet: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(1, 8))
        .thread_name("oob-bootstrap")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let report = runtime.block_on(simulate::run(options, &config))?;
    if !quiet {
        print!("{}", report);
    }

    if report.leftover_keys != 0 {
        return Err(Error::Internal(format!(
            "{} rendezvous keys were left in the store",
            report.leftover_keys
        )));
    }
    Ok(())
}

/// Handle config subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = BootstrapConfig::load(config.as_deref())?;
            let toml_str = toml::to_string_pretty(&cfg)?;
            println!("{}", toml_str);
        }
        ConfigSubcommand::Init { path, force } => {
            let created = config::init_config(path.as_deref(), force)?;
            println!("Created configuration file: {}", created.display());
        }
        ConfigSubcommand::Validate { config } => match BootstrapConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }
    Ok(())
}
