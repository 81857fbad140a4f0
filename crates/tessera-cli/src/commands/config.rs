//! Configuration commands.

use std::path::Path;

use anyhow::{Context, Result};
use tessera_config::{Paths, TesseraConfig};

use crate::style::colors::SemanticStyle;
use crate::style::{info_table, print_error, print_success};

#[derive(Debug, Clone, Copy)]
pub enum Format {
    Text,
    Toml,
    Json,
}

fn require_initialized(dir: &Path) -> Result<()> {
    if !Paths::is_initialized(dir) {
        anyhow::bail!(
            "No tessera.toml in {}. Run 'tessera init' there first.",
            dir.display()
        );
    }
    Ok(())
}

/// Show the effective configuration, after layering and validation.
pub fn show(dir: &str, format: Format) -> Result<()> {
    let dir = Path::new(dir);
    require_initialized(dir)?;
    let config = TesseraConfig::load_from_dir(dir).context("Failed to load configuration")?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        Format::Toml => println!("{}", toml::to_string_pretty(&config)?),
        Format::Text => {
            println!("{}", "Tessera Configuration".header());
            let peers = config
                .peers
                .iter()
                .map(|peer| format!("{}@{}", peer.id, peer.address))
                .collect::<Vec<_>>()
                .join(", ");
            let table = info_table(&[
                ("Replica", config.replica.id.to_string()),
                ("Replicas", config.replica.total_replicas.to_string()),
                ("Max faulty", config.max_faulty().to_string()),
                ("Retry interval", format!("{:?}", config.timeouts.retry_interval())),
                ("Retry limit", config.timeouts.retry_limit.to_string()),
                (
                    "Fault detection",
                    format!("{:?}", config.timeouts.fault_detection_interval()),
                ),
                ("Ack timeout", format!("{:?}", config.timeouts.ack_timeout())),
                (
                    "Phase timeout",
                    format!("{:?}", config.timeouts.consensus_phase_timeout()),
                ),
                (
                    "Checkpoint interval",
                    config.consensus.checkpoint_interval.to_string(),
                ),
                ("Unsigned allowed", config.consensus.unsigned_allowed.join(", ")),
                ("Peers", peers),
            ]);
            println!("{table}");
        }
    }
    Ok(())
}

/// Validate the configuration in `dir`.
pub fn validate(dir: &str) -> Result<()> {
    let dir = Path::new(dir);
    require_initialized(dir)?;

    match TesseraConfig::load_from_dir(dir) {
        Ok(config) => {
            print_success(&format!(
                "Configuration is valid: replica {} of {}",
                config.replica.id, config.replica.total_replicas
            ));
            Ok(())
        }
        Err(e) => {
            print_error("Configuration validation failed");
            Err(e)
        }
    }
}
