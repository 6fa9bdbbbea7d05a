//! Harness configuration.
//!
//! Defines the settings that locate test cases, golden files and captured
//! output, and that control how the binary under test is invoked. Settings are
//! read from `goldrun.yaml` / `goldrun.toml` and overridden from the command line.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-case timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Root document for a harness configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// The binary under test. Supports `${VAR}` interpolation.
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Arguments passed before the script path (e.g. `["-f"]`).
    /// Supports `${VAR}` interpolation.
    #[serde(default)]
    pub args: Vec<String>,

    /// Directory scanned for test-case scripts.
    #[serde(default = "default_case_root")]
    pub case_root: PathBuf,

    /// Directory holding golden files (default: `<case_root>/expected_output`).
    #[serde(default)]
    pub expected_dir: Option<PathBuf>,

    /// Directory receiving captured output (default: `<case_root>/output`).
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// File extension identifying test-case scripts.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// File extension of golden and captured output files.
    #[serde(default = "default_golden_extension")]
    pub golden_extension: String,

    /// Per-case wall-clock timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Number of cases executed concurrently. `0` uses the available parallelism.
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Scan subdirectories of the case root as well.
    #[serde(default)]
    pub recursive: bool,

    /// Treat an empty suite as a configuration error instead of `0/0 passed`.
    #[serde(default)]
    pub fail_on_empty: bool,

    /// Extra environment variables for the binary under test.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether the binary under test inherits the harness environment.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,
}

fn default_case_root() -> PathBuf {
    PathBuf::from("test_scripts")
}

fn default_extension() -> String {
    "squat".to_string()
}

fn default_golden_extension() -> String {
    "out".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_jobs() -> usize {
    1
}

fn default_inherit_env() -> bool {
    true
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            case_root: default_case_root(),
            expected_dir: None,
            output_dir: None,
            extension: default_extension(),
            golden_extension: default_golden_extension(),
            timeout: default_timeout(),
            jobs: default_jobs(),
            recursive: false,
            fail_on_empty: false,
            env: HashMap::new(),
            inherit_env: default_inherit_env(),
        }
    }
}

impl HarnessConfig {
    /// Directory holding golden files.
    pub fn expected_dir(&self) -> PathBuf {
        self.expected_dir
            .clone()
            .unwrap_or_else(|| self.case_root.join("expected_output"))
    }

    /// Directory receiving captured output.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.case_root.join("output"))
    }

    /// Script extension without a leading dot.
    pub fn extension(&self) -> &str {
        self.extension.trim_start_matches('.')
    }

    /// Golden/captured extension without a leading dot.
    pub fn golden_extension(&self) -> &str {
        self.golden_extension.trim_start_matches('.')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Effective worker count, resolving `0` to the machine's parallelism.
    pub fn worker_count(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }

    /// Resolve relative paths against `base` (the directory of the config file).
    pub fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        self.case_root = resolve(&self.case_root);
        self.expected_dir = self.expected_dir.as_ref().map(resolve);
        self.output_dir = self.output_dir.as_ref().map(resolve);
        // Bare names like `python3` are looked up on PATH, only paths get rebased.
        if let Some(binary) = &self.binary
            && binary.components().count() > 1
        {
            self.binary = Some(resolve(binary));
        }
    }
}

/// Generate the JSON schema for [`HarnessConfig`].
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(HarnessConfig)
}
