//! Run controller.
//!
//! Drives discovered cases through the executor and comparator and feeds the
//! reporter, either one case at a time or on a bounded pool of workers.

use crate::compare::classify;
use crate::discovery::TestCase;
use crate::executor::Executor;
use crate::report::{CaseRecord, Reporter, RunSummary};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

/// Run every case and return the summary.
///
/// With `jobs <= 1` each case is executed and compared before the next starts.
/// Otherwise up to `jobs` cases run concurrently; the reporter still prints in
/// discovery order.
pub fn run_suite<W: Write, D: Write>(
    executor: &Executor,
    cases: &[TestCase],
    jobs: usize,
    mut reporter: Reporter<W, D>,
) -> io::Result<RunSummary> {
    reporter.begin(cases.len());

    if jobs <= 1 || cases.len() <= 1 {
        for (idx, case) in cases.iter().enumerate() {
            reporter.record(run_case(executor, idx, case))?;
        }
        return reporter.finish();
    }

    let workers = jobs.min(cases.len());
    tracing::debug!(workers, cases = cases.len(), "running cases in parallel");
    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            s.spawn(move || {
                loop {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(case) = cases.get(idx) else {
                        break;
                    };
                    if tx.send(run_case(executor, idx, case)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        // This thread is the only writer into the reporter.
        for record in rx {
            reporter.record(record)?;
        }
        Ok::<(), io::Error>(())
    })?;

    reporter.finish()
}

fn run_case(executor: &Executor, idx: usize, case: &TestCase) -> CaseRecord {
    let execution = executor.execute(case);
    let outcome = classify(case, &execution);
    tracing::debug!(
        case = %case.id,
        outcome = ?outcome,
        termination = ?execution.termination,
        bytes = execution.stdout_len,
        artifact = execution.artifact_written,
        "case finished"
    );
    CaseRecord {
        index: idx + 1,
        id: case.id.clone(),
        outcome,
        termination: execution.termination,
        duration: execution.duration,
        stderr: String::from_utf8_lossy(&execution.stderr).into_owned(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::compare::{CaseError, Outcome};
    use crate::config::HarnessConfig;
    use crate::discovery::discover;
    use crate::report::OutputFormat;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    /// Write a case script (a shell script) and optionally its golden file.
    fn write_case(root: &Path, id: &str, body: &str, golden: Option<&str>) {
        std::fs::write(root.join(format!("{id}.squat")), body).unwrap();
        if let Some(golden) = golden {
            let dir = root.join("expected_output");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(format!("{id}.out")), golden).unwrap();
        }
    }

    fn config_for(root: &Path) -> HarnessConfig {
        HarnessConfig {
            binary: Some(PathBuf::from("sh")),
            case_root: root.to_path_buf(),
            ..HarnessConfig::default()
        }
    }

    fn run(config: &HarnessConfig, executor: &Executor) -> (String, RunSummary) {
        let cases = discover(config, None).unwrap();
        let mut out = Vec::new();
        let reporter = Reporter::new(&mut out, io::sink(), OutputFormat::Human);
        let summary = run_suite(executor, &cases, config.worker_count(), reporter).unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn single_passing_case() {
        let dir = tempdir().unwrap();
        write_case(dir.path(), "add", "printf '3\\n'\n", Some("3\n"));
        let config = config_for(dir.path());

        let (out, summary) = run(&config, &Executor::from_config(&config));

        assert_eq!(out, "Test 1/1 (add) passed\n1/1 passed\n");
        assert!(summary.is_success());
    }

    #[test]
    fn mixed_outcomes_are_reported_in_order() {
        let dir = tempdir().unwrap();
        write_case(dir.path(), "a", "echo 1\n", Some("1\n"));
        write_case(dir.path(), "b", "echo 6\n", Some("5\n"));
        write_case(dir.path(), "c", "echo 7\n", None);
        let config = config_for(dir.path());

        let (out, summary) = run(&config, &Executor::from_config(&config));

        assert_eq!(
            out,
            "Test 1/3 (a) passed\nTest 2/3 (b) failed\nTest 3/3 (c) failed (no golden recorded)\n1/3 passed\n"
        );
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errored, 1);
        assert!(!summary.is_success());
    }

    #[test]
    fn timeout_does_not_abort_the_run() {
        let dir = tempdir().unwrap();
        write_case(dir.path(), "a_slow", "sleep 30\n", Some(""));
        write_case(dir.path(), "b_fast", "echo ok\n", Some("ok\n"));
        let config = config_for(dir.path());
        let executor = Executor::from_config(&config).with_timeout(Duration::from_millis(300));

        let (_, summary) = run(&config, &executor);

        assert_eq!(summary.total, 2);
        assert!(matches!(
            summary.cases[0].outcome,
            Outcome::Error(CaseError::TimedOut(_))
        ));
        assert_eq!(summary.cases[1].outcome, Outcome::Pass);
    }

    #[test]
    fn parallel_run_keeps_discovery_order() {
        let dir = tempdir().unwrap();
        // Earlier cases sleep longer so they finish last.
        write_case(dir.path(), "a", "sleep 0.4\necho a\n", Some("a\n"));
        write_case(dir.path(), "b", "sleep 0.2\necho b\n", Some("b\n"));
        write_case(dir.path(), "c", "echo c\n", Some("c\n"));
        write_case(dir.path(), "d", "echo d\n", Some("x\n"));
        let config = HarnessConfig {
            jobs: 4,
            ..config_for(dir.path())
        };

        let start = Instant::now();
        let (out, summary) = run(&config, &Executor::from_config(&config));

        assert_eq!(
            out,
            "Test 1/4 (a) passed\nTest 2/4 (b) passed\nTest 3/4 (c) passed\nTest 4/4 (d) failed\n3/4 passed\n"
        );
        assert_eq!(summary.passed, 3);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let dir = tempdir().unwrap();
        for i in 0..6 {
            let golden = if i % 2 == 0 { format!("{i}\n") } else { "no\n".to_string() };
            write_case(dir.path(), &format!("case{i}"), &format!("echo {i}\n"), Some(golden.as_str()));
        }
        let sequential = config_for(dir.path());
        let parallel = HarnessConfig {
            jobs: 3,
            ..config_for(dir.path())
        };

        let (seq_out, _) = run(&sequential, &Executor::from_config(&sequential));
        let (par_out, _) = run(&parallel, &Executor::from_config(&parallel));

        assert_eq!(seq_out, par_out);
    }

    #[test]
    fn repeated_runs_are_idempotent() {
        let dir = tempdir().unwrap();
        write_case(dir.path(), "a", "echo 1\n", Some("1\n"));
        write_case(dir.path(), "b", "echo 2\n", Some("3\n"));
        let config = config_for(dir.path());
        let executor = Executor::from_config(&config);

        let (first, first_summary) = run(&config, &executor);
        let (second, second_summary) = run(&config, &executor);

        assert_eq!(first, second);
        assert_eq!(first_summary.passed, second_summary.passed);
    }

    #[test]
    fn empty_suite_reports_zero_of_zero() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());

        let (out, summary) = run(&config, &Executor::from_config(&config));

        assert_eq!(out, "0/0 passed\n");
        assert!(summary.is_success());
    }
}
