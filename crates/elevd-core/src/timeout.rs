//! Grant expiration computation.
//!
//! The effective timeout starts from the configured base and takes the
//! maximum of every matching override: an override may be keyed by the
//! principal's identifier, its account name, or any of its group
//! memberships (by identifier or name). Override values that do not parse
//! as integers are skipped without surfacing an error.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::policy::PolicySubject;

/// Computes the effective grant duration in minutes for a subject.
///
/// Maximum-of-matches: with base 10 and an override of 30 for one of the
/// subject's groups, the result is 30; with applicable overrides 15 and 45,
/// the result is 45. An override below the running maximum never lowers it.
#[must_use]
pub fn effective_timeout_minutes(
    subject: &PolicySubject,
    base_minutes: u32,
    overrides: &HashMap<String, String>,
) -> u32 {
    let mut minutes = base_minutes;

    for (key, value) in overrides {
        if !subject.matches(key) {
            continue;
        }
        match value.trim().parse::<u32>() {
            Ok(parsed) => minutes = minutes.max(parsed),
            Err(_) => {
                debug!(key, value, "skipping unparsable timeout override");
            },
        }
    }

    minutes
}

/// Converts an effective timeout into an absolute expiration timestamp.
#[must_use]
pub fn expiration_from(now: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
    now + Duration::minutes(i64::from(minutes))
}
