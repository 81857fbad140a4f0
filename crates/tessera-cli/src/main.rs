//! Tessera CLI.
//!
//! Inspects replica configuration and runs PBFT clusters in-process.
//!
//! # Quick Start
//!
//! ```bash
//! # Write a deployment config for replica 0 of a 4-replica cluster
//! tessera init ./replica-0 --replica-id 0 --replicas 4
//!
//! # Check it
//! tessera config validate --dir ./replica-0
//!
//! # Order ten requests on a simulated cluster, then fail the primary
//! tessera simulate --replicas 4 --requests 10 --crash-primary
//! ```

mod commands;
mod style;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// Tessera - Byzantine fault tolerant replication.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    /// Log protocol activity to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Write a tessera.toml for one replica of a local cluster.
    Init {
        /// Directory to write the configuration into.
        path: String,

        /// Id of the replica this configuration belongs to.
        #[arg(long, default_value = "0")]
        replica_id: u32,

        /// Number of replicas in the cluster.
        #[arg(long, default_value = "4")]
        replicas: u32,
    },

    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Run a cluster over an in-memory network and report what happened.
    Simulate {
        /// Number of replicas.
        #[arg(short = 'n', long, default_value = "4")]
        replicas: u32,

        /// Client requests to submit.
        #[arg(short, long, default_value = "5")]
        requests: u32,

        /// Partition the primary after the first batch and recover from it.
        #[arg(long)]
        crash_primary: bool,

        /// Fault detection interval in milliseconds.
        #[arg(long, default_value = "200")]
        detection_ms: u64,

        /// Report format.
        #[arg(short, long, value_enum, default_value = "table")]
        format: ReportFormat,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration.
    Show {
        /// Deployment directory containing tessera.toml.
        #[arg(short, long, default_value = ".")]
        dir: String,

        /// Output format.
        #[arg(short, long, value_enum, default_value = "text")]
        format: ConfigFormat,
    },

    /// Validate the configuration.
    Validate {
        /// Deployment directory containing tessera.toml.
        #[arg(short, long, default_value = ".")]
        dir: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfigFormat {
    Text,
    Toml,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Table,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    style::set_no_color(cli.no_color || std::env::var_os("NO_COLOR").is_some());

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Init {
            path,
            replica_id,
            replicas,
        } => commands::init::run(&path, replica_id, replicas),
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show { dir, format } => commands::config::show(
                &dir,
                match format {
                    ConfigFormat::Text => commands::config::Format::Text,
                    ConfigFormat::Toml => commands::config::Format::Toml,
                    ConfigFormat::Json => commands::config::Format::Json,
                },
            ),
            ConfigCommands::Validate { dir } => commands::config::validate(&dir),
        },
        Commands::Simulate {
            replicas,
            requests,
            crash_primary,
            detection_ms,
            format,
        } => commands::simulate::run(&commands::simulate::SimulationPlan {
            replicas,
            requests,
            crash_primary,
            detection_ms,
            json: matches!(format, ReportFormat::Json),
        }),
    }
}
