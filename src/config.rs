//! Configuration loading and schema definitions for runlane.
//!
//! Configuration comes from a TOML file; CLI flags override individual
//! fields after loading. The schema is described in [`schema`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads runlane configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match the schema.
///
/// # Example
///
/// ```no_run
/// use runlane::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("runlane.toml"))?;
/// println!("Max attempts: {}", config.runner.max_attempts);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads runlane configuration from a TOML string.
///
/// ```
/// use runlane::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     bail = true
///
///     [filters]
///     include = ["js/node"]
/// "#)?;
///
/// assert!(config.runner.bail);
/// assert_eq!(config.filters.include, vec!["js/node".to_string()]);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the file if it exists, else returns defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(
            "No config file at {}, using defaults",
            path.display()
        );
        Ok(Config::default())
    }
}
