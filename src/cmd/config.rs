//! Configuration view and validation commands: `reviewd config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(repo_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use reviewd::config::Config;
    use reviewd::workflow_config::WorkflowToml;

    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Workflow Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No workflow.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print!("{}", toml::to_string_pretty(config.workflow())?);
            println!();

            // Show effective values (including env overrides)
            println!("Effective values (with env overrides):");
            println!("  mailbox_root = \"{}\"", config.mailbox_root.display());
            println!("  reviews_dir = \"{}\"", config.reviews_dir.display());
            for role in config.workflow().roles.keys() {
                println!(
                    "  {}: reviewer_cmd = \"{}\", timeout_secs = {}",
                    role,
                    config.workflow().reviewer_cmd(role),
                    config.workflow().timeout_secs(role)
                );
            }
            println!();
            if !config_path.exists() {
                println!("Run 'reviewd config init' to create a workflow.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.workflow().validate();
            if warnings.is_empty() {
                if config_path.exists() {
                    println!("Configuration is valid.");
                } else {
                    println!("No workflow.toml found. Using defaults (valid).");
                }
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
                println!("workflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.workflow_dir)?;
            WorkflowToml::default().save(&config_path)?;

            println!("Created workflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] reviewer_cmd, reviews_dir, protected_dir, baseline_pattern");
            println!("  - [defaults] timeout_secs, poll_interval_secs, auto_move");
            println!("  - [families.<name>], [kinds.<name>], [roles.<name>]");
            println!();
        }
    }

    Ok(())
}
