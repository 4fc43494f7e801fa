//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for oob-bootstrap.

use clap::{Parser, Subcommand};

/// oob-bootstrap - out-of-band communicator bootstrap
///
/// Exchanges peer metadata through a shared key-value store and uses it to
/// bring up communication contexts. The `simulate` command runs a whole
/// group of peers in one process against an in-memory store.
#[derive(Parser, Debug)]
#[command(name = "oob-bootstrap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap a group of in-process peers and drive operations through it
    Simulate {
        /// Number of peers in the group
        #[arg(short = 'n', long, default_value = "4", value_parser = clap::value_parser!(u32).range(1..=1024))]
        peers: u32,

        /// Bytes each peer publishes in the rendezvous round
        #[arg(short = 'l', long, default_value = "16")]
        msg_len: usize,

        /// Operations each peer submits once its communicator is ready
        #[arg(short, long, default_value = "8")]
        ops: u32,

        /// Record submitted operations and write one trace file per rank
        #[arg(long)]
        trace: bool,

        /// Path to configuration file
        #[arg(short, long, env = "OOB_CONFIG")]
        config: Option<String>,
    },

    /// Display version and build information
    Version {
        /// Print only the version and commit
        #[arg(short, long)]
        short: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
