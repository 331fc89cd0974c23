//! Check-config command - print the resolved settings

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use uplink_core::AgentSettings;

pub fn execute(config: Option<&Path>) -> Result<()> {
    let settings = AgentSettings::load(config).context("Failed to load configuration")?;

    match config {
        Some(path) => println!("  Config file: {}", path.display().to_string().dimmed()),
        None => println!("  Config file: {}", "(defaults and environment)".dimmed()),
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!();
    println!("{}", "Configuration is valid".green().bold());

    Ok(())
}
