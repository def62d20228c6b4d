//! Configuration view and validation commands: `foundry config`.

use anyhow::{Context, Result};

use foundry::config::{FoundryConfig, FoundryToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(".foundry").join("foundry.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foundry Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foundry.toml found at {}; showing defaults.", config_path.display());
            }
            println!("Effective values (with env overrides):");
            println!();

            let config = FoundryConfig::new(project_dir.to_path_buf())?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foundry.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = FoundryToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
