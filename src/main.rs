mod compare;
mod config;
mod discovery;
mod env;
mod executor;
mod loader;
mod report;
mod runner;

use clap::{Args, Parser, Subcommand, ValueEnum};
use config::HarnessConfig;
use discovery::DiscoveryError;
use loader::ConfigError;
use regex::Regex;
use report::{OutputFormat, Reporter};
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit status when any case failed or errored.
const EXIT_FAILED: i32 = 1;
/// Exit status for configuration errors; no case was run.
const EXIT_CONFIG: i32 = 2;

#[derive(Clone, Copy, Default, ValueEnum)]
enum ColorChoice {
    /// Color when stdout is a terminal and NO_COLOR is unset
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Parser)]
#[command(name = "goldrun")]
#[command(about = "A golden-output test harness for script-driven executables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every command that discovers cases.
#[derive(Args)]
struct HarnessArgs {
    /// Config file (default: goldrun.yaml, goldrun.yml or goldrun.toml in the current directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Binary under test
    #[arg(long)]
    binary: Option<PathBuf>,
    /// Argument passed to the binary before the script path (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Directory containing test-case scripts
    #[arg(long)]
    case_root: Option<PathBuf>,
    /// Directory containing golden files
    #[arg(long)]
    expected_dir: Option<PathBuf>,
    /// Directory receiving captured output
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Script file extension
    #[arg(long)]
    extension: Option<String>,
    /// Scan subdirectories of the case root
    #[arg(long)]
    recursive: bool,
    /// Only run cases whose identifier matches this regex
    #[arg(short, long)]
    filter: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every case and compare against golden files
    Run {
        #[command(flatten)]
        harness: HarnessArgs,
        /// Per-case timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Number of cases to run concurrently (0 = available parallelism)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Treat a suite with no cases as a configuration error
        #[arg(long)]
        fail_on_empty: bool,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// When to color the report
        #[arg(long, default_value = "auto")]
        color: ColorChoice,
        /// Show mismatch details and the binary's stderr for failing cases
        #[arg(short, long)]
        verbose: bool,
    },
    /// List discovered cases without running them
    List {
        #[command(flatten)]
        harness: HarnessArgs,
    },
    /// Scaffold a config file
    Init {
        /// Output path for the new config file
        #[arg(default_value = "goldrun.yaml")]
        path: PathBuf,
    },
    /// Output the config file schema
    Schema,
}

/// Errors that abort a run before any case executes.
#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("no test cases found in {}", .0.display())]
    EmptySuite(PathBuf),
}

fn main() {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Command::Run { verbose: true, .. });
    init_logging(verbose);

    match cli.command {
        Command::Run {
            harness,
            timeout,
            jobs,
            fail_on_empty,
            output,
            color,
            verbose,
        } => {
            let prepared = build_config(&harness).and_then(|mut config| {
                if let Some(timeout) = timeout {
                    config.timeout = timeout;
                }
                if let Some(jobs) = jobs {
                    config.jobs = jobs;
                }
                config.fail_on_empty |= fail_on_empty;
                let config = loader::finalize(config)?;
                let cases = discover(&config, harness.filter.as_deref())?;
                if cases.is_empty() && config.fail_on_empty {
                    return Err(CliError::EmptySuite(config.case_root.clone()));
                }
                Ok((config, cases))
            });
            let (config, cases) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_CONFIG);
                }
            };

            let use_color = match color {
                ColorChoice::Always => true,
                ColorChoice::Never => false,
                ColorChoice::Auto => {
                    std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
                }
            };
            let reporter = Reporter::new(std::io::stdout().lock(), std::io::stderr(), output)
                .color(use_color && output == OutputFormat::Human)
                .verbose(verbose);

            let executor = executor::Executor::from_config(&config);
            let summary =
                match runner::run_suite(&executor, &cases, config.worker_count(), reporter) {
                    Ok(summary) => summary,
                    Err(e) => {
                        eprintln!("error: failed to write report: {e}");
                        std::process::exit(EXIT_FAILED);
                    }
                };

            tracing::info!(
                passed = summary.passed,
                total = summary.total,
                ratio = summary.pass_ratio(),
                elapsed = ?summary.duration,
                "run complete"
            );
            if !summary.is_success() {
                std::process::exit(EXIT_FAILED);
            }
        }
        Command::List { harness } => {
            let listed = build_config(&harness).and_then(|config| {
                let cases = discover(&config, harness.filter.as_deref())?;
                Ok(cases)
            });
            let cases = match listed {
                Ok(cases) => cases,
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(EXIT_CONFIG);
                }
            };

            let total = cases.len();
            let mut missing = 0;
            for (idx, case) in cases.iter().enumerate() {
                if case.expected.is_file() {
                    println!("{}/{total} {} ({})", idx + 1, case.id, case.script.display());
                } else {
                    missing += 1;
                    println!(
                        "{}/{total} {} ({}) [no golden]",
                        idx + 1,
                        case.id,
                        case.script.display()
                    );
                }
            }
            println!("\n{total} case(s), {missing} without golden");
        }
        Command::Init { path } => {
            let template = r#"# goldrun configuration
#
# The binary under test is invoked as: <binary> <args...> <script>
binary: target/release/vm
args: ["-f"]

case_root: test_scripts
# expected_dir: test_scripts/expected_output
# output_dir: test_scripts/output
extension: squat
golden_extension: out

# Per-case timeout in seconds
timeout: 10
# Cases run concurrently (1 = sequential, 0 = available parallelism)
jobs: 1

# env:
#   RUST_LOG: warn
"#;
            if path.exists() {
                eprintln!("error: file already exists: {}", path.display());
                std::process::exit(EXIT_FAILED);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
                && let Err(e) = fs::create_dir_all(parent)
            {
                eprintln!("error: failed to create directory: {e}");
                std::process::exit(EXIT_FAILED);
            }
            if let Err(e) = fs::write(&path, template) {
                eprintln!("error: failed to write file: {e}");
                std::process::exit(EXIT_FAILED);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = config::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: failed to serialize schema: {e}");
                    std::process::exit(EXIT_FAILED);
                }
            }
        }
    }
}

/// Logs go to stderr so stdout carries only the report.
fn init_logging(verbose: bool) {
    let default = if verbose { "goldrun=debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Load the config file and apply command-line overrides.
fn build_config(harness: &HarnessArgs) -> Result<HarnessConfig, CliError> {
    let mut config = match &harness.config {
        Some(path) => loader::load_config(path)?,
        None => loader::load_config_in(Path::new("."))?,
    };

    if let Some(binary) = &harness.binary {
        config.binary = Some(binary.clone());
    }
    if !harness.args.is_empty() {
        config.args = harness.args.clone();
    }
    if let Some(root) = &harness.case_root {
        config.case_root = root.clone();
    }
    if let Some(dir) = &harness.expected_dir {
        config.expected_dir = Some(dir.clone());
    }
    if let Some(dir) = &harness.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if let Some(ext) = &harness.extension {
        config.extension = ext.clone();
    }
    config.recursive |= harness.recursive;
    Ok(config)
}

fn discover(
    config: &HarnessConfig,
    filter: Option<&str>,
) -> Result<Vec<discovery::TestCase>, CliError> {
    let filter = filter
        .map(Regex::new)
        .transpose()
        .map_err(ConfigError::from)?;
    Ok(discovery::discover(config, filter.as_ref())?)
}
