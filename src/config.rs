use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// Behaviour switches for a [`crate::TarEngine`].
///
/// There is no ambient global configuration: callers build a `Config`
/// (or load one from a JSON file) and hand it to the engine constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Echo per-entry processing decisions at debug level.
    pub debug: bool,

    /// Apply uid/gid from entry headers to extracted objects.
    /// Requires privileges; chown failures abort the task.
    pub same_owner: bool,

    /// Preserve source modification times on extracted objects.
    pub same_chtimes: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;
        let config: Config = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = Config::new();
        assert!(!config.debug);
        assert!(!config.same_owner);
        assert!(!config.same_chtimes);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = File::create(&path).unwrap();
        file.write_all(br#"{"same_chtimes": true}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.same_chtimes);
        assert!(!config.same_owner);
    }
}
