use std::{fs, path::Path};

use anyhow::{Context, Result};
use shared::config::server::Config;

/// Renders the default configuration in `format` (`toml`, `yaml` or `json`).
///
/// Writes to `output` when given, otherwise to stdout.
///
/// # Errors
/// Returns an error for unsupported formats or when the file cannot be written.
pub fn generate_config(format: &str, output: Option<&Path>) -> Result<()> {
    let rendered = Config::default().render(format)?;

    match output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Configuration file '{}' generated successfully.", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
