//! Exit classification for failed invocations.
//!
//! After a non-zero exit, the attempt's stderr is matched against the
//! unit's retry and ignore specs in declaration order. A retry match
//! repeats the invocation after the declared sleep, up to the spec's
//! attempt budget; an ignore match overrides the exit to success and
//! records the spec's signals mapping.

use regex::Regex;
use tracing::warn;

use crate::config::{IgnoreSpec, RetrySpec};

/// Outcome of classifying one failed attempt.
#[derive(Debug)]
pub enum Classification<'a> {
    /// Re-run after the spec's sleep interval.
    Retry(&'a RetrySpec),
    /// Treat the failure as success, writing the spec's signals file.
    Ignore(&'a IgnoreSpec),
    /// Genuine failure.
    Fail,
}

/// Classifies a failed attempt. `attempt` is the 1-based number of
/// invocations performed so far.
pub fn classify<'a>(
    stderr: &str,
    attempt: u32,
    retries: &'a [RetrySpec],
    ignores: &'a [IgnoreSpec],
) -> Classification<'a> {
    for spec in retries {
        if attempt >= spec.max_attempts {
            continue;
        }
        if spec
            .retryable_errors
            .iter()
            .any(|pattern| matches_stderr(pattern, stderr))
        {
            return Classification::Retry(spec);
        }
    }

    for spec in ignores {
        let (deny, allow): (Vec<&String>, Vec<&String>) = spec
            .ignorable_errors
            .iter()
            .partition(|p| p.starts_with('!'));

        if deny
            .iter()
            .any(|pattern| matches_stderr(&pattern[1..], stderr))
        {
            continue;
        }
        if allow.iter().any(|pattern| matches_stderr(pattern, stderr)) {
            return Classification::Ignore(spec);
        }
    }

    Classification::Fail
}

/// Specs match across lines, so `(?s)` turns `.` into "anything".
fn matches_stderr(pattern: &str, stderr: &str) -> bool {
    match Regex::new(&format!("(?s){pattern}")) {
        Ok(re) => re.is_match(stderr),
        Err(e) => {
            warn!("invalid error pattern {pattern:?}: {e}");
            false
        }
    }
}
