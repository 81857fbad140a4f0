//! Initialize command - writes the deployment config for one replica.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tessera_config::{Paths, TesseraConfig};

use crate::style::colors::SemanticStyle;
use crate::style::{print_hint, print_success};

pub fn run(path: &str, replica_id: u32, replicas: u32) -> Result<()> {
    let project_dir = Path::new(path);

    if Paths::is_initialized(project_dir) {
        anyhow::bail!(
            "Already initialized in {}. tessera.toml already exists.",
            project_dir.display()
        );
    }

    let config = TesseraConfig::local_cluster(replica_id, replicas);
    config.validate().context("Invalid cluster layout")?;

    fs::create_dir_all(project_dir).context("Failed to create directory")?;
    let config_path = Paths::project_config_file(project_dir);
    let content = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
    fs::write(&config_path, content).context("Failed to write tessera.toml")?;

    print_success(&format!(
        "Wrote {} for replica {replica_id} of {replicas} (tolerates {} faulty)",
        config_path.display(),
        config.max_faulty()
    ));
    print_hint(&format!(
        "Local overrides go in {}",
        Paths::local_config_file(project_dir).display().to_string().code()
    ));
    print_hint(&format!(
        "Check it with {}",
        format!("tessera config validate --dir {path}").code()
    ));
    Ok(())
}
