//! Test case discovery.
//!
//! Scans the case root for scripts and derives one [`TestCase`] per script,
//! ordered by identifier so run numbering is reproducible.

use crate::config::HarnessConfig;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One unit of test work: a script to run and the golden file to compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Script filename without its extension (lossy UTF-8).
    pub id: String,
    /// The script passed to the binary under test.
    pub script: PathBuf,
    /// Golden output. Not required to exist.
    pub expected: PathBuf,
    /// Where this run's output is written.
    pub captured: PathBuf,
}

/// Error type for discovery. Always fatal for the run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("case root does not exist: {}", .0.display())]
    MissingRoot(PathBuf),
    #[error("case root is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("duplicate case identifier '{id}': {} and {}", .first.display(), .second.display())]
    DuplicateIdentifier {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Discover test cases under the configured case root.
///
/// Cases are sorted by identifier. When `filter` is given, only identifiers
/// matching it are kept; duplicates are rejected before filtering.
pub fn discover(
    config: &HarnessConfig,
    filter: Option<&Regex>,
) -> Result<Vec<TestCase>, DiscoveryError> {
    let root = &config.case_root;
    if !root.exists() {
        return Err(DiscoveryError::MissingRoot(root.clone()));
    }
    if !root.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.clone()));
    }

    // Canonical so `./cases` and `/abs/cases` name the same directory.
    let skip: Vec<PathBuf> = [config.expected_dir(), config.output_dir()]
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .collect();
    let mut scripts = Vec::new();
    collect_scripts(root, config, &skip, &mut scripts)?;

    // BTreeMap keeps identifiers in lexical order.
    let mut by_id: BTreeMap<String, PathBuf> = BTreeMap::new();
    for script in scripts {
        let Some(stem) = script.file_stem() else {
            continue;
        };
        let id = stem.to_string_lossy().into_owned();
        if stem.to_str().is_none() {
            tracing::warn!(path = %script.display(), id = %id, "script name is not UTF-8");
        }
        if let Some(first) = by_id.get(&id) {
            let (first, second) = if first <= &script {
                (first.clone(), script)
            } else {
                (script, first.clone())
            };
            return Err(DiscoveryError::DuplicateIdentifier { id, first, second });
        }
        by_id.insert(id, script);
    }

    let expected_dir = config.expected_dir();
    let output_dir = config.output_dir();
    let golden_ext = config.golden_extension();
    let cases: Vec<TestCase> = by_id
        .into_iter()
        .filter(|(id, _)| filter.is_none_or(|re| re.is_match(id)))
        .map(|(id, script)| {
            let artifact = artifact_name(&id, golden_ext);
            TestCase {
                expected: expected_dir.join(&artifact),
                captured: output_dir.join(&artifact),
                id,
                script,
            }
        })
        .collect();

    tracing::debug!(root = %root.display(), count = cases.len(), "discovered cases");
    Ok(cases)
}

fn artifact_name(id: &str, ext: &str) -> String {
    if ext.is_empty() {
        id.to_string()
    } else {
        format!("{id}.{ext}")
    }
}

fn collect_scripts(
    dir: &Path,
    config: &HarnessConfig,
    skip: &[PathBuf],
    scripts: &mut Vec<PathBuf>,
) -> Result<(), DiscoveryError> {
    let io_err = |source: std::io::Error| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();

        if path.is_dir() {
            if config.recursive && !is_skipped(&path, skip) {
                collect_scripts(&path, config, skip, scripts)?;
            }
        } else if path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(config.extension())
        {
            scripts.push(path);
        }
    }
    Ok(())
}

fn is_skipped(dir: &Path, skip: &[PathBuf]) -> bool {
    dir.canonicalize()
        .map(|dir| skip.contains(&dir))
        .unwrap_or(false)
}
