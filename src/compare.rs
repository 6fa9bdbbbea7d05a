//! Golden comparison.
//!
//! Compares a case's captured output with its golden file byte for byte and
//! classifies the result. No normalization of any kind is applied.

use crate::discovery::TestCase;
use crate::executor::{ExecutionResult, Termination};
use serde::Serialize;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Classification of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum Outcome {
    /// Captured bytes equal the golden bytes.
    Pass,
    /// Both artifacts exist and differ.
    Fail(Mismatch),
    /// The comparison could not be performed.
    Error(CaseError),
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }
}

/// Where captured output first diverges from the golden file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    /// Byte offset of the first difference.
    pub offset: usize,
    /// 1-based line of the first difference.
    pub line: usize,
    pub expected_len: usize,
    pub actual_len: usize,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "output differs at byte {} (line {}): expected {} bytes, got {}",
            self.offset, self.line, self.expected_len, self.actual_len
        )
    }
}

/// Why a case could not be compared.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum CaseError {
    #[error("no golden recorded")]
    MissingGolden,
    #[error("no output produced")]
    NoOutput,
    #[error("timed out after {}s", .0.as_secs_f64())]
    TimedOut(#[serde(serialize_with = "crate::report::serialize_duration")] Duration),
    #[error("{0}")]
    SpawnFailed(String),
    #[error("{0}")]
    Io(String),
}

/// Classify a case from its execution result.
///
/// Execution errors short-circuit to ERROR; otherwise the artifacts on disk
/// are compared.
pub fn classify(case: &TestCase, execution: &ExecutionResult) -> Outcome {
    match &execution.termination {
        Termination::TimedOut(after) => Outcome::Error(CaseError::TimedOut(*after)),
        Termination::SpawnFailed(reason) => Outcome::Error(CaseError::SpawnFailed(reason.clone())),
        Termination::CaptureFailed(reason) => Outcome::Error(CaseError::Io(reason.clone())),
        Termination::Exited(_) | Termination::Signaled(_) => {
            compare_artifacts(&case.captured, &case.expected)
        }
    }
}

/// Compare a captured artifact with its golden file.
pub fn compare_artifacts(captured: &Path, expected: &Path) -> Outcome {
    let expected_bytes = match read_artifact(expected) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Outcome::Error(CaseError::MissingGolden),
        Err(e) => {
            return Outcome::Error(CaseError::Io(format!(
                "failed to read {}: {e}",
                expected.display()
            )));
        }
    };
    let actual_bytes = match read_artifact(captured) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Outcome::Error(CaseError::NoOutput),
        Err(e) => {
            return Outcome::Error(CaseError::Io(format!(
                "failed to read {}: {e}",
                captured.display()
            )));
        }
    };

    match first_difference(&expected_bytes, &actual_bytes) {
        None => Outcome::Pass,
        Some(offset) => {
            let line = 1 + expected_bytes[..offset.min(expected_bytes.len())]
                .iter()
                .filter(|&&b| b == b'\n')
                .count();
            tracing::debug!(captured = %captured.display(), offset, "golden mismatch");
            Outcome::Fail(Mismatch {
                offset,
                line,
                expected_len: expected_bytes.len(),
                actual_len: actual_bytes.len(),
            })
        }
    }
}

/// `Ok(None)` if the file does not exist.
fn read_artifact(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn first_difference(expected: &[u8], actual: &[u8]) -> Option<usize> {
    if expected == actual {
        return None;
    }
    let common = expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| expected.len().min(actual.len()));
    Some(common)
}
