//! Configuration view and validation commands: `rollout config`.

use anyhow::Result;
use rollout::config::{CONFIG_FILE, Config, ROLLOUT_DIR, RolloutToml};
use std::path::Path;

use super::super::ConfigCommands;

fn print_toml(toml: &RolloutToml) {
    println!("[engine]");
    println!("  max_parallel = {}", toml.engine.max_parallel);
    println!("  run_timeout_secs = {}", toml.engine.run_timeout_secs);
    println!("  build_timeout_secs = {}", toml.engine.build_timeout_secs);
    println!();

    println!("[retry]");
    println!("  max_retries = {}", toml.retry.max_retries);
    println!("  base_delay_ms = {}", toml.retry.base_delay_ms);
    println!(
        "  retryable_exit_codes = {:?}",
        toml.retry.retryable_exit_codes
    );
    println!(
        "  network_error_patterns = {:?}",
        toml.retry.network_error_patterns
    );
    println!();

    println!("[platform]");
    println!("  host = \"{}\"", toml.platform.host);
    println!("  base_port = {}", toml.platform.base_port);
    println!("  startup_grace_ms = {}", toml.platform.startup_grace_ms);
    println!();

    if !toml.services.overrides.is_empty() {
        println!("[services.overrides]");
        for (pattern, override_cfg) in &toml.services.overrides {
            println!("  \"{}\":", pattern);
            if let Some(secs) = override_cfg.build_timeout_secs {
                println!("    build_timeout_secs = {}", secs);
            }
            if let Some(retries) = override_cfg.max_retries {
                println!("    max_retries = {}", retries);
            }
        }
        println!();
    }
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let rollout_dir = project_dir.join(ROLLOUT_DIR);
    let config_path = rollout_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Rollout Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&RolloutToml::load(&config_path)?);
            } else {
                println!("No rollout.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                print_toml(&RolloutToml::default());
                println!("Run 'rollout config init' to create a rollout.toml file.");
                println!();
            }

            // Effective values include env overrides
            let config = Config::new(project_dir.to_path_buf())?;
            println!("Effective values (with env overrides):");
            println!("  max_parallel = {}", config.max_parallel());
            println!("  run_timeout_secs = {}", config.run_timeout().as_secs());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No rollout.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = RolloutToml::load(&config_path)?;
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
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("rollout.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !rollout_dir.exists() {
                std::fs::create_dir_all(&rollout_dir)?;
            }

            RolloutToml::default().save(&config_path)?;

            println!("Created rollout.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] max_parallel, run_timeout_secs, build_timeout_secs");
            println!("  - [retry] max_retries, base_delay_ms, retryable_exit_codes");
            println!("  - [services.overrides.\"api-*\"] for service-specific settings");
            println!();
        }
    }

    Ok(())
}
