use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::ConfigError;
use crate::logging::Logger;
use crate::schema::DatasetConfig;

pub const CONFIG_ENV: &str = "ORCHESTRA_CONFIG";
pub const DATASET_PATH_ENV: &str = "ORCHESTRA_DATASET_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "~/.config/orchestra/config.yaml";
pub const DEFAULT_DATASET_DIR: &str = "~/.config/orchestra/datasets";
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:42305";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub datasets: DatasetConfig,
}

/// Replace a leading `~` with the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    let home = home_dir();
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// Config file location and whether it was chosen explicitly.
pub fn config_path() -> (PathBuf, bool) {
    match env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => (expand_user(path.trim()), true),
        _ => (expand_user(DEFAULT_CONFIG_FILE), false),
    }
}

pub fn dataset_paths() -> Vec<PathBuf> {
    match env::var(DATASET_PATH_ENV) {
        Ok(list) if !list.trim().is_empty() => list
            .split(':')
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(expand_user)
            .collect(),
        _ => vec![expand_user(DEFAULT_DATASET_DIR)],
    }
}

impl Config {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
    }

    pub fn load_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|err| ConfigError::new(Some(path.to_path_buf()), err.to_string()))?;
        let config = serde_yaml::from_str(&text)
            .map_err(|err| ConfigError::new(Some(path.to_path_buf()), format!("yaml parse error: {err}")))?;
        Ok(config)
    }

    /// Merge every dataset file found under `dirs` into this configuration,
    /// then name and validate the result. Files that fail to decode are
    /// logged and skipped.
    pub fn load_datasets(&mut self, dirs: &[PathBuf], logger: &Logger) -> Result<()> {
        for dir in dirs {
            if !dir.is_dir() {
                continue;
            }
            let mut files = Vec::new();
            collect_yaml_files(dir, &mut files)?;
            for file in files {
                match decode_dataset(&file) {
                    Ok(dataset) => self.datasets.merge(dataset),
                    Err(err) => logger.error(
                        "dataset skipped",
                        Some(json!({ "path": file.display().to_string(), "error": format!("{err:#}") })),
                    ),
                }
            }
        }
        self.datasets.prepare();
        self.datasets.validate()
    }

    /// Read `path` (optional unless `required`) and the dataset directories.
    pub fn load(path: &Path, required: bool, dirs: &[PathBuf], logger: &Logger) -> Result<Config> {
        let mut config = if path.exists() || required {
            Config::load_file(path)?
        } else {
            Config::default()
        };
        config.load_datasets(dirs, logger)?;
        logger.info(
            "config loaded",
            Some(json!({
                "path": path.display().to_string(),
                "endpoints": config.datasets.endpoints.len(),
                "queries": config.datasets.queries.len(),
            })),
        );
        Ok(config)
    }

    /// Load from `ORCHESTRA_CONFIG` and `ORCHESTRA_DATASET_PATH`, or their
    /// defaults under `~/.config/orchestra`.
    pub fn load_default(logger: &Logger) -> Result<Config> {
        let (path, explicit) = config_path();
        Config::load(&path, explicit, &dataset_paths(), logger)
    }
}

fn decode_dataset(path: &Path) -> Result<DatasetConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let dataset = serde_yaml::from_str(&text)
        .map_err(|err| ConfigError::new(Some(path.to_path_buf()), err.to_string()))?;
    Ok(dataset)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("unable to list directory: {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UndefinedEndpointError;
    use crate::logging::Level;
    use tempfile::tempdir;

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = home_dir() {
            assert_eq!(expand_user("~/x/y"), home.join("x/y"));
            assert_eq!(expand_user("~"), home);
        }
        assert_eq!(expand_user("/etc/orchestra"), PathBuf::from("/etc/orchestra"));
    }

    #[test]
    fn address_has_a_default() {
        assert_eq!(Config::default().address(), "127.0.0.1:42305");
    }

    #[test]
    fn datasets_merge_in_sorted_order() -> Result<()> {
        let dir = tempdir()?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("a.yaml"), "endpoints: { users: { url: 'http://one' } }")?;
        fs::write(dir.path().join("nested/b.yml"), "endpoints: { users: { url: 'http://two' } }")?;
        fs::write(dir.path().join("notes.txt"), "not yaml: [")?;
        fs::write(dir.path().join("broken.yaml"), "endpoints: { users: { bogus: 1 } }")?;

        let logger = Logger::capturing(Level::Info);
        let config = Config::load(&dir.path().join("missing.yaml"), false, &[dir.path().to_path_buf()], &logger)?;
        assert_eq!(config.datasets.endpoints["users"].url, "http://two");
        assert_eq!(config.datasets.endpoints["users"].name, "users");

        let entries = logger.captured();
        assert!(entries
            .iter()
            .any(|entry| entry["level"] == "error" && entry["message"] == "dataset skipped"));
        assert!(entries.iter().any(|entry| entry["message"] == "config loaded"));
        Ok(())
    }

    #[test]
    fn config_file_rejects_unknown_fields() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.yaml");
        fs::write(&path, "listen: 0.0.0.0:80\n")?;
        let err = Config::load_file(&path).unwrap_err();
        assert!(err.is::<ConfigError>());
        Ok(())
    }

    #[test]
    fn explicit_config_must_exist() {
        let logger = Logger::capturing(Level::Info);
        let err = Config::load(Path::new("/nonexistent/orchestra.yaml"), true, &[], &logger).unwrap_err();
        assert!(err.is::<ConfigError>());
    }

    #[test]
    fn undefined_endpoints_fail_loading() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "address: 0.0.0.0:8080\ndatasets:\n  queries:\n    q:\n      pipeline:\n        steps:\n          - query: { endpoint: nope }\n",
        )?;
        let logger = Logger::capturing(Level::Info);
        let err = Config::load(&path, true, &[], &logger).unwrap_err();
        assert!(err.is::<UndefinedEndpointError>());
        Ok(())
    }
}
