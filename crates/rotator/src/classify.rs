//! Failure classification for upstream responses
//!
//! Maps an HTTP status (plus `Retry-After` header and body) to the failure
//! class the rotator acts on. Rate-limit responses from the upstream do not
//! always carry a header, so the body is searched for the wait hints the
//! upstream is known to emit (`FLOOD_WAIT_N`, "a wait of N seconds",
//! "retry after N").

use std::time::Duration;

use connector::FailureClass;

/// Quarantine applied to a rate-limited resource when no wait hint is found.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Body markers followed by a wait in seconds.
const WAIT_MARKERS: &[&str] = &["flood_wait_", "wait of ", "retry after "];

/// Classify a non-success upstream response.
///
/// 401/403 are `AuthRequired` (the credential itself is rejected), 429 is
/// `RateLimited` with the best wait hint available, everything else is
/// `Transient`.
pub fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> FailureClass {
    match status {
        401 | 403 => FailureClass::AuthRequired,
        429 => FailureClass::RateLimited {
            retry_after: rate_limit_wait(retry_after, body),
        },
        _ => FailureClass::Transient,
    }
}

/// Resolve the wait for a rate-limited response: header first, then body hints.
pub fn rate_limit_wait(retry_after: Option<&str>, body: &str) -> Duration {
    retry_after
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or_else(|| wait_hint(body))
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
}

/// Search a response body for a wait in seconds.
fn wait_hint(body: &str) -> Option<u64> {
    let lower = body.to_lowercase();
    WAIT_MARKERS
        .iter()
        .find_map(|marker| digits_after(&lower, marker))
}

fn digits_after(haystack: &str, marker: &str) -> Option<u64> {
    let start = haystack.find(marker)? + marker.len();
    let digits: String = haystack[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
