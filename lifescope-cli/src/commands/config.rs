use anyhow::{Context, Result};
use lifescope::RuntimeConfig;
use std::path::Path;

/// Load the configuration file when one is given, else the defaults
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

pub fn show_config(config: &RuntimeConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}
