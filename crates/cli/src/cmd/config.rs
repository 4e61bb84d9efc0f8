//! Show the effective configuration

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use snap_core::Config;
use std::path::Path;

pub fn run(config: &Config, path: Option<&Path>) -> Result<()> {
    let text = config
        .to_toml_string()
        .context("Failed to render configuration")?;

    println!("{}", "Configuration".bold());
    match path {
        Some(path) if path.exists() => {
            println!("{}: {}\n", "Location".dimmed(), path.display().dimmed())
        }
        Some(path) => println!(
            "{}: {} {}\n",
            "Location".dimmed(),
            path.display().dimmed(),
            "(not present, using defaults)".dimmed()
        ),
        None => println!("{}\n", "(no config directory, using defaults)".dimmed()),
    }

    for line in text.lines() {
        if line.starts_with('[') {
            println!("{}", line.yellow());
        } else if let Some((key, value)) = line.split_once(" = ") {
            println!("{} = {}", key.cyan(), value);
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}
