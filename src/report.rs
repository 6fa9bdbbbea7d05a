//! Run reporting.
//!
//! The [`Reporter`] receives case results in any order, prints them strictly
//! in discovery order and builds the final [`RunSummary`].

use crate::compare::Outcome;
use crate::executor::Termination;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::{Duration, Instant};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// Lines of the binary's stderr shown for a failing case in verbose mode.
const STDERR_TAIL_LINES: usize = 10;

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Report rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable progress lines
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

/// Everything reported about one case.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CaseRecord {
    /// 1-based position in discovery order.
    pub index: usize,
    pub id: String,
    pub outcome: Outcome,
    pub termination: Termination,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    /// Standard error of the binary under test (lossy UTF-8).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// Final result of a run, in discovery order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub cases: Vec<CaseRecord>,
}

impl RunSummary {
    /// The process-level result: every case passed.
    pub fn is_success(&self) -> bool {
        self.passed == self.total
    }

    /// Fraction of cases that passed; `1.0` for an empty run.
    pub fn pass_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

/// Accumulates case records and prints them in index order.
///
/// `out` receives the report proper; `diag` receives verbose diagnostics so
/// that the report stays one line per case.
pub struct Reporter<W: Write, D: Write> {
    out: W,
    diag: D,
    format: OutputFormat,
    color: bool,
    verbose: bool,
    total: usize,
    next: usize,
    pending: BTreeMap<usize, CaseRecord>,
    records: Vec<CaseRecord>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl<W: Write, D: Write> Reporter<W, D> {
    pub fn new(out: W, diag: D, format: OutputFormat) -> Self {
        Self {
            out,
            diag,
            format,
            color: false,
            verbose: false,
            total: 0,
            next: 1,
            pending: BTreeMap::new(),
            records: Vec::new(),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub fn color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Start a run of `total` cases.
    pub fn begin(&mut self, total: usize) {
        self.total = total;
        self.next = 1;
        self.pending.clear();
        self.records.clear();
        self.started_at = Utc::now();
        self.clock = Instant::now();
    }

    /// Record a finished case. Lines are flushed as soon as every earlier
    /// index has been recorded.
    pub fn record(&mut self, record: CaseRecord) -> io::Result<()> {
        self.pending.insert(record.index, record);
        while let Some(record) = self.pending.remove(&self.next) {
            if self.format == OutputFormat::Human {
                self.print_case(&record)?;
            }
            self.records.push(record);
            self.next += 1;
        }
        Ok(())
    }

    /// Print the summary and return it.
    pub fn finish(mut self) -> io::Result<RunSummary> {
        // Anything still pending means an index was skipped; flush in order anyway.
        let stragglers = std::mem::take(&mut self.pending);
        for (_, record) in stragglers {
            if self.format == OutputFormat::Human {
                self.print_case(&record)?;
            }
            self.records.push(record);
        }

        let passed = self.records.iter().filter(|r| r.outcome.is_pass()).count();
        let failed = self
            .records
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Fail(_)))
            .count();
        let errored = self
            .records
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Error(_)))
            .count();
        let summary = RunSummary {
            started_at: self.started_at,
            duration: self.clock.elapsed(),
            total: self.total.max(self.records.len()),
            passed,
            failed,
            errored,
            cases: std::mem::take(&mut self.records),
        };

        match self.format {
            OutputFormat::Human => {
                writeln!(self.out, "{}/{} passed", summary.passed, summary.total)?;
            }
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(&summary).map_err(io::Error::other)?;
                writeln!(self.out, "{json}")?;
            }
            OutputFormat::Junit => {
                write!(self.out, "{}", format_junit_xml(&summary))?;
            }
        }
        self.out.flush()?;
        Ok(summary)
    }

    fn print_case(&mut self, record: &CaseRecord) -> io::Result<()> {
        let prefix = format!("Test {}/{} ({})", record.index, self.total, record.id);
        let (status, color) = match &record.outcome {
            Outcome::Pass => ("passed".to_string(), GREEN),
            Outcome::Fail(_) => ("failed".to_string(), RED),
            Outcome::Error(e) => (format!("failed ({e})"), YELLOW),
        };
        if self.color {
            writeln!(self.out, "{color}{prefix} {status}{RESET}")?;
        } else {
            writeln!(self.out, "{prefix} {status}")?;
        }
        self.out.flush()?;

        if self.verbose && !record.outcome.is_pass() {
            self.print_details(record)?;
        }
        Ok(())
    }

    fn print_details(&mut self, record: &CaseRecord) -> io::Result<()> {
        if let Outcome::Fail(mismatch) = &record.outcome {
            writeln!(self.diag, "  {}: {mismatch}", record.id)?;
        }
        match &record.termination {
            Termination::Exited(code) => writeln!(self.diag, "  {}: exit code {code}", record.id)?,
            Termination::Signaled(signal) => {
                writeln!(self.diag, "  {}: terminated by signal {signal}", record.id)?
            }
            _ => {}
        }
        if !record.stderr.is_empty() {
            writeln!(self.diag, "  {}: stderr:", record.id)?;
            let lines: Vec<&str> = record.stderr.lines().collect();
            let skip = lines.len().saturating_sub(STDERR_TAIL_LINES);
            for line in &lines[skip..] {
                writeln!(self.diag, "    {line}")?;
            }
        }
        self.diag.flush()
    }
}

/// Format a run as JUnit XML.
fn format_junit_xml(summary: &RunSummary) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\">",
        summary.total,
        summary.failed,
        summary.errored,
        summary.duration.as_secs_f64()
    );
    let _ = writeln!(
        xml,
        "  <testsuite name=\"goldrun\" tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\" timestamp=\"{}\">",
        summary.total,
        summary.failed,
        summary.errored,
        summary.duration.as_secs_f64(),
        summary.started_at.format("%Y-%m-%dT%H:%M:%S")
    );

    for case in &summary.cases {
        let _ = write!(
            xml,
            "    <testcase name=\"{}\" time=\"{:.3}\"",
            escape_xml(&case.id),
            case.duration.as_secs_f64()
        );
        match &case.outcome {
            Outcome::Pass => xml.push_str("/>\n"),
            Outcome::Fail(mismatch) => {
                xml.push_str(">\n");
                let _ = writeln!(
                    xml,
                    "      <failure message=\"{}\"/>",
                    escape_xml(&mismatch.to_string())
                );
                push_system_err(&mut xml, &case.stderr);
                xml.push_str("    </testcase>\n");
            }
            Outcome::Error(error) => {
                xml.push_str(">\n");
                let _ = writeln!(
                    xml,
                    "      <error message=\"{}\"/>",
                    escape_xml(&error.to_string())
                );
                push_system_err(&mut xml, &case.stderr);
                xml.push_str("    </testcase>\n");
            }
        }
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

fn push_system_err(xml: &mut String, stderr: &str) {
    if !stderr.is_empty() {
        let _ = writeln!(xml, "      <system-err>{}</system-err>", escape_xml(stderr));
    }
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
