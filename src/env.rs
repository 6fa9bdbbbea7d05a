//! Environment variable interpolation for configuration values.

use std::collections::HashMap;
use thiserror::Error;

/// Error produced while expanding `${VAR}` references.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpolateError {
    #[error("unclosed variable reference: ${{{0}")]
    Unclosed(String),
    #[error("environment variable '{0}' is not set")]
    Unset(String),
}

/// Expand `${VAR}` references in `s`.
///
/// Variables are looked up in `overrides` first (the harness `env` table), then
/// in the process environment. `$$` produces a literal `$`.
pub fn interpolate(s: &str, overrides: &HashMap<String, String>) -> Result<String, InterpolateError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(InterpolateError::Unclosed(name)),
                    }
                }
                let value = overrides
                    .get(&name)
                    .cloned()
                    .or_else(|| std::env::var(&name).ok())
                    .ok_or(InterpolateError::Unset(name))?;
                result.push_str(&value);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_process_environment() {
        // SAFETY: only this test touches GOLDRUN_ENV_TEST_VAR
        unsafe {
            std::env::set_var("GOLDRUN_ENV_TEST_VAR", "release");
        }
        let empty = HashMap::new();
        assert_eq!(
            interpolate("target/${GOLDRUN_ENV_TEST_VAR}/vm", &empty).unwrap(),
            "target/release/vm"
        );
        assert_eq!(interpolate("plain", &empty).unwrap(), "plain");
        assert_eq!(interpolate("", &empty).unwrap(), "");
    }

    #[test]
    fn overrides_take_precedence() {
        let mut overrides = HashMap::new();
        overrides.insert("PATH".to_string(), "/custom".to_string());
        assert_eq!(interpolate("${PATH}", &overrides).unwrap(), "/custom");
    }

    #[test]
    fn dollar_escapes_and_lone_dollars() {
        let empty = HashMap::new();
        assert_eq!(interpolate("$${HOME}", &empty).unwrap(), "${HOME}");
        assert_eq!(interpolate("cost: $5", &empty).unwrap(), "cost: $5");
        assert_eq!(interpolate("end$", &empty).unwrap(), "end$");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let result = interpolate("${GOLDRUN_SURELY_UNSET_12345}", &HashMap::new());
        assert_eq!(
            result,
            Err(InterpolateError::Unset("GOLDRUN_SURELY_UNSET_12345".to_string()))
        );
    }

    #[test]
    fn unclosed_reference_is_an_error() {
        let result = interpolate("${UNCLOSED", &HashMap::new());
        assert_eq!(result, Err(InterpolateError::Unclosed("UNCLOSED".to_string())));
    }
}
