//! Configuration loader.
//!
//! Finds, parses and validates harness configuration files.

use crate::config::HarnessConfig;
use crate::env::{InterpolateError, interpolate};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration file names searched for, in order.
pub const CONFIG_FILENAMES: [&str; 3] = ["goldrun.yaml", "goldrun.yml", "goldrun.toml"];

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid TOML in {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unsupported config format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
    #[error("no binary under test configured (set `binary` in goldrun.yaml or pass --binary)")]
    MissingBinary,
    #[error("timeout must be at least 1 second")]
    ZeroTimeout,
    #[error("script extension must not be empty")]
    EmptyExtension,
    #[error("invalid value for `{field}`: {source}")]
    Interpolate {
        field: &'static str,
        source: InterpolateError,
    },
    #[error("invalid filter pattern: {0}")]
    Filter(#[from] regex::Error),
}

/// Load a configuration file, choosing the format from its extension.
///
/// Relative paths inside the file are resolved against the file's directory.
pub fn load_config(path: &Path) -> Result<HarnessConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config: HarnessConfig = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?,
        "toml" => toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?,
        other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
    };

    if let Some(base) = path.parent()
        && !base.as_os_str().is_empty()
    {
        config.resolve_relative_to(base);
    }
    tracing::debug!(path = %path.display(), "loaded harness config");
    Ok(config)
}

/// Look for a configuration file in `dir`.
///
/// Returns `None` if no known config file exists there.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Load the config file in `dir` if one exists, or fall back to defaults.
pub fn load_config_in(dir: &Path) -> Result<HarnessConfig, ConfigError> {
    match find_config(dir) {
        Some(path) => load_config(&path),
        None => Ok(HarnessConfig::default()),
    }
}

/// Interpolate and validate a config so it is ready to run.
pub fn finalize(mut config: HarnessConfig) -> Result<HarnessConfig, ConfigError> {
    let binary = config.binary.take().ok_or(ConfigError::MissingBinary)?;
    let binary = interpolate(&binary.to_string_lossy(), &config.env)
        .map_err(|source| ConfigError::Interpolate {
            field: "binary",
            source,
        })?;
    if binary.is_empty() {
        return Err(ConfigError::MissingBinary);
    }
    config.binary = Some(PathBuf::from(binary));

    config.args = config
        .args
        .iter()
        .map(|arg| interpolate(arg, &config.env))
        .collect::<Result<_, _>>()
        .map_err(|source| ConfigError::Interpolate {
            field: "args",
            source,
        })?;

    if config.timeout == 0 {
        return Err(ConfigError::ZeroTimeout);
    }
    if config.extension().is_empty() {
        return Err(ConfigError::EmptyExtension);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_valid_yaml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goldrun.yaml");
        std::fs::write(&path, "binary: vm\nargs: [\"-f\"]\ntimeout: 5\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.binary, Some(PathBuf::from("vm")));
        assert_eq!(config.args, vec!["-f"]);
        assert_eq!(config.timeout, 5);
        assert_eq!(config.case_root, dir.path().join("test_scripts"));
    }

    #[test]
    fn load_valid_toml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goldrun.toml");
        std::fs::write(
            &path,
            r#"
binary = "vm"
case_root = "cases"
jobs = 2

[env]
MODE = "test"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.jobs, 2);
        assert_eq!(config.case_root, dir.path().join("cases"));
        assert_eq!(config.env.get("MODE"), Some(&"test".to_string()));
    }

    #[test]
    fn load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goldrun.yaml");
        std::fs::write(&path, "invalid: [yaml: {").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goldrun.toml");
        std::fs::write(&path, "binary = [toml").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Toml { .. })));
    }

    #[test]
    fn unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goldrun.ini");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            load_config(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn find_config_prefers_yaml() {
        let dir = tempdir().unwrap();
        assert!(find_config(dir.path()).is_none());

        std::fs::write(dir.path().join("goldrun.toml"), "").unwrap();
        std::fs::write(dir.path().join("goldrun.yaml"), "").unwrap();
        let found = find_config(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "goldrun.yaml");
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config_in(dir.path()).unwrap();
        assert!(config.binary.is_none());
        assert_eq!(config.case_root, PathBuf::from("test_scripts"));
    }

    #[test]
    fn finalize_requires_binary() {
        let result = finalize(HarnessConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingBinary)));
    }

    #[test]
    fn finalize_rejects_zero_timeout_and_empty_extension() {
        let config = HarnessConfig {
            binary: Some(PathBuf::from("vm")),
            timeout: 0,
            ..HarnessConfig::default()
        };
        assert!(matches!(finalize(config), Err(ConfigError::ZeroTimeout)));

        let config = HarnessConfig {
            binary: Some(PathBuf::from("vm")),
            extension: ".".to_string(),
            ..HarnessConfig::default()
        };
        assert!(matches!(finalize(config), Err(ConfigError::EmptyExtension)));
    }

    #[test]
    fn finalize_interpolates_binary_and_args() {
        let mut config = HarnessConfig {
            binary: Some(PathBuf::from("${BUILD}/vm")),
            args: vec!["--mode=${MODE}".to_string()],
            ..HarnessConfig::default()
        };
        config.env.insert("BUILD".to_string(), "target/release".to_string());
        config.env.insert("MODE".to_string(), "strict".to_string());

        let config = finalize(config).unwrap();
        assert_eq!(config.binary, Some(PathBuf::from("target/release/vm")));
        assert_eq!(config.args, vec!["--mode=strict"]);
    }

    #[test]
    fn finalize_reports_unset_variable() {
        let config = HarnessConfig {
            binary: Some(PathBuf::from("vm")),
            args: vec!["${GOLDRUN_SURELY_UNSET_ARG}".to_string()],
            ..HarnessConfig::default()
        };
        let err = finalize(config).unwrap_err();
        assert!(err.to_string().contains("args"));
        assert!(err.to_string().contains("GOLDRUN_SURELY_UNSET_ARG"));
    }
}
