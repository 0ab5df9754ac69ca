//! Config file loading for the apiary binary.
//!
//! The hub config lives in a project-local `apiary.toml`. Resolution
//! chain: `--config` flag > `APIARY_CONFIG` env var > `./apiary.toml` >
//! built-in defaults. Whatever wins is validated by the core rules before
//! the hub starts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use apiary_core::config::{ConfigSource, HubConfig};
use apiary_core::error::HubError;

/// Default project-local config file name.
pub const CONFIG_FILE: &str = "apiary.toml";

/// TOML-file-backed [`ConfigSource`].
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> apiary_core::Result<HubConfig> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            HubError::Unavailable(format!(
                "failed to read config file at {}: {e}",
                self.path.display()
            ))
        })?;
        let config: HubConfig = toml::from_str(&contents).map_err(|e| {
            HubError::InvalidArgument(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Resolve and validate the hub configuration.
///
/// Chain: `--config` flag > `APIARY_CONFIG` env var > `./apiary.toml` >
/// defaults.
pub fn resolve(cli_path: Option<&Path>) -> Result<HubConfig> {
    let path = if let Some(path) = cli_path {
        Some(path.to_path_buf())
    } else if let Ok(env_path) = std::env::var("APIARY_CONFIG") {
        Some(PathBuf::from(env_path))
    } else if Path::new(CONFIG_FILE).exists() {
        Some(PathBuf::from(CONFIG_FILE))
    } else {
        None
    };

    match path {
        Some(path) => {
            let config = FileConfigSource::new(&path)
                .load()
                .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => {
            tracing::info!("no config file found, using defaults");
            let config = HubConfig::default();
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
            Ok(config)
        }
    }
}

/// Write a commented starter config into the working directory.
pub fn write_starter_config(force: bool) -> Result<()> {
    let path = PathBuf::from(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{CONFIG_FILE} already exists; pass --force to overwrite");
    }

    let starter = r#"# apiary hub configuration

[workspace]
# Project name; container names derive from it.
name = "my-project"

[redis]
port = 6379

[agents.queen]
model = "opus"
dockerfile = "Dockerfile.queen"

[agents.workers]
count = 2
mode = "daemon"
model = "sonnet"
dockerfile = "Dockerfile.worker"
poll_interval_s = 10

[monitoring.queen]
enabled = true
interval_s = 15

[monitoring.worker]
enabled = true
interval_s = 15
"#;

    std::fs::write(&path, starter)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {CONFIG_FILE}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starter_config_parses_and_validates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        // The starter text must stay loadable.
        let starter = r#"
[workspace]
name = "my-project"

[agents.workers]
count = 2
"#;
        std::fs::write(&path, starter).unwrap();
        let config = FileConfigSource::new(&path).load().unwrap();
        assert_eq!(config.workspace.name, "my-project");
    }

    #[test]
    fn explicit_path_beats_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[workspace]\nname = \"custom\"\n").unwrap();

        let config = resolve(Some(&path)).unwrap();
        assert_eq!(config.workspace.name, "custom");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[agents.workers]\ncount = 99\n").unwrap();

        let err = resolve(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn missing_explicit_file_errors() {
        let err = resolve(Some(Path::new("/nonexistent/apiary.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
