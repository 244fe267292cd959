use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::{Cli, Command};

/// Default backup output directory.
pub const DEFAULT_DEST: &str = "/var/lib/deepfreeze/";

/// Resolved runtime configuration. Precedence: CLI flag > environment >
/// config file > default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub root: Option<PathBuf>,
    pub dest: Option<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
    #[serde(default)]
    pub debug: bool,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: Config = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: Config = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// The config file consulted when `--config` is not given.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/deepfreeze/deepfreeze.toml"))
    }

    /// Applies the recognized environment keys through `lookup`:
    /// `ROOT`, `DEST`, `EXCLUDE` (comma separated), `DEBUG`, `LOG_FILE`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ROOT") {
            self.root = Some(value.into());
        }
        if let Some(value) = lookup("DEST") {
            self.dest = Some(value.into());
        }
        if let Some(value) = lookup("EXCLUDE") {
            self.exclude = value
                .split(',')
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(value) = lookup("DEBUG") {
            self.debug = matches!(value.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(value) = lookup("LOG_FILE") {
            self.log_file = Some(value.into());
        }
    }

    /// Resolves the effective configuration for a parsed command line.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Config::from_file(path)?,
            None => match Config::default_path() {
                Some(path) if path.exists() => Config::from_file(&path)?,
                _ => Config::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok());

        if cli.debug {
            config.debug = true;
        }
        if let Some(log_file) = &cli.log_file {
            config.log_file = Some(log_file.clone());
        }
        let Command::Backup { root, dest, exclude } = &cli.command;
        if let Some(root) = root {
            config.root = Some(root.clone());
        }
        if let Some(dest) = dest {
            config.dest = Some(dest.clone());
        }
        if !exclude.is_empty() {
            config.exclude = exclude.clone();
        }
        Ok(config)
    }

    /// The effective backup output directory.
    pub fn dest(&self) -> PathBuf {
        self.dest
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEST))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn defaults_are_empty_with_standard_dest() {
        let config = Config::default();
        assert!(config.root.is_none());
        assert!(config.exclude.is_empty());
        assert!(!config.debug);
        assert_eq!(config.dest(), PathBuf::from(DEFAULT_DEST));
    }

    #[test]
    fn from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
root = "/srv/data"
dest = "/mnt/backups"
exclude = ["/srv/data/tmp", "/srv/data/cache"]
debug = true
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.root, Some(PathBuf::from("/srv/data")));
        assert_eq!(config.dest, Some(PathBuf::from("/mnt/backups")));
        assert_eq!(config.exclude.len(), 2);
        assert!(config.debug);
    }

    #[test]
    fn from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"root": "/j/root", "log_file": "/var/log/df.log"}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.root, Some(PathBuf::from("/j/root")));
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/df.log")));
        assert!(!config.debug);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config {
            root: Some(PathBuf::from("/from-file")),
            ..Config::default()
        };
        let env: HashMap<&str, &str> = [
            ("ROOT", "/from-env"),
            ("EXCLUDE", "/a,/b"),
            ("DEBUG", "1"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.root, Some(PathBuf::from("/from-env")));
        assert_eq!(
            config.exclude,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert!(config.debug);
    }

    #[test]
    fn unset_env_changes_nothing() {
        let mut config = Config {
            root: Some(PathBuf::from("/keep")),
            debug: true,
            ..Config::default()
        };
        config.apply_env(|_| None);
        assert_eq!(config.root, Some(PathBuf::from("/keep")));
        assert!(config.debug);
    }
}
