use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::speech::interface::SpeechError;

/// Per-request limits for network adapters. Both knobs default to off:
/// no timeout and no retries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestPolicy {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
}

impl RequestPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Runs a request closure under `policy`, retrying transient failures with
/// exponential backoff.
/// Retries on:
/// - Network errors and timeouts
/// - 429 Too Many Requests
/// - 5xx Server Errors
///
/// Anything else (400, 401, 404, malformed payloads) is returned immediately.
pub async fn run_with_policy<T, F, Fut>(
    policy: &RequestPolicy,
    label: &str,
    mut task: F,
) -> Result<T, SpeechError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SpeechError>>,
{
    let mut attempt = 0;
    let mut delay = Duration::from_millis(1000);

    loop {
        attempt += 1;
        let outcome = match policy.timeout() {
            Some(limit) => match tokio::time::timeout(limit, task()).await {
                Ok(result) => result,
                Err(_) => Err(SpeechError::Timeout(format!(
                    "{} took longer than {:?}",
                    label, limit
                ))),
            },
            None => task().await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if attempt > policy.max_retries || !e.is_transient() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "[HTTP] {} failed: {}, retrying in {:?} (attempt {}/{})",
                    label,
                    e,
                    delay,
                    attempt,
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(60)); // Cap at 60s
            }
        }
    }
}

/// Turns a non-success HTTP reply into a `SpeechError::Transport` carrying
/// the status and the body text.
pub async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, SpeechError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SpeechError::Transport {
        message: format!("server returned {}: {}", status, body.trim()),
        status: Some(status.as_u16()),
    })
}
