//! Bounded retries for calls to the verifier, beacon, ledger and feed history.
//!
//! Every call is sent at most `max_retries + 1` times. Between attempts the
//! client waits for an exponentially growing delay, shortened by a random
//! fraction, unless the collaborator names its own delay through
//! `Retry-After-Ms` or `Retry-After` (honoured only below one minute).
//!
//! Transient statuses are 408, 429 and 5xx. A collaborator can override that
//! with `x-should-retry: true|false`. 409 stays terminal since it is how the
//! ledger reports a commitment it already holds.
//!
//! All attempts of one call share an `Idempotency-Key` and carry their
//! zero-based position in `X-Retry-Count`.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use uuid::Uuid;

const SERVER_HINT_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Largest fraction shaved off a computed delay (0.25 keeps 75-100%).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// How a call ended.
///
/// Error responses are never folded into `Success`; callers read the body of
/// an `HttpError` to build their own error.
#[derive(Debug)]
pub enum RetryOutcome {
    Success(Response),
    /// A non-2xx response that was terminal or the last one allowed.
    HttpError(Response),
    /// Transport failures persisted through `attempts` sends.
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
    /// The first send failed in a way retrying cannot fix.
    NonRetryable(reqwest::Error),
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[must_use]
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn forced_retry(headers: &HeaderMap) -> Option<bool> {
    let value = headers.get("x-should-retry")?.to_str().ok()?;
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[must_use]
pub fn should_retry(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::CONFLICT {
        return false;
    }
    forced_retry(headers).unwrap_or_else(|| is_transient_status(status))
}

fn within_ceiling(delay: Duration) -> Option<Duration> {
    (delay > Duration::ZERO && delay < SERVER_HINT_CEILING).then_some(delay)
}

/// Delay requested by the collaborator, if any usable one was sent.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let from_millis = header("retry-after-ms")
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|ms| (0.0..60_000.0).contains(ms))
        .and_then(|ms| within_ceiling(Duration::from_secs_f64(ms / 1000.0)));
    if from_millis.is_some() {
        return from_millis;
    }

    header("retry-after")
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .and_then(|secs| within_ceiling(Duration::from_secs(secs)))
}

/// Delay before retry number `step + 1`, ignoring server hints.
#[must_use]
pub fn backoff_delay(step: u32, config: &RetryConfig) -> Duration {
    let growth = 2_f64.powi(i32::try_from(step.min(30)).unwrap_or(30));
    let ceiling = config.max_delay.as_secs_f64();
    let full = (config.initial_delay.as_secs_f64() * growth).min(ceiling);

    let shave = rand::random::<f64>() * config.jitter_factor.clamp(0.0, 1.0);
    Duration::from_secs_f64(full * (1.0 - shave))
}

#[must_use]
pub fn retry_delay(step: u32, config: &RetryConfig, headers: Option<&HeaderMap>) -> Duration {
    headers
        .and_then(parse_retry_after)
        .unwrap_or_else(|| backoff_delay(step, config))
}

#[must_use]
pub fn new_idempotency_key() -> String {
    format!("verigreen-{}", Uuid::new_v4())
}

fn stamp(builder: RequestBuilder, attempt: u32, key: &str) -> RequestBuilder {
    builder
        .header("X-Retry-Count", attempt.to_string())
        .header("Idempotency-Key", key)
}

fn transport_is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

/// What to do after one attempt.
enum Step {
    Done(RetryOutcome),
    Wait(Duration),
}

fn judge(attempt: u32, config: &RetryConfig, result: Result<Response, reqwest::Error>) -> Step {
    let last = attempt + 1 >= config.attempts();
    match result {
        Ok(response) if response.status().is_success() => {
            Step::Done(RetryOutcome::Success(response))
        }
        Ok(response) => {
            if last || !should_retry(response.status(), response.headers()) {
                return Step::Done(RetryOutcome::HttpError(response));
            }
            let delay = retry_delay(attempt, config, Some(response.headers()));
            tracing::debug!(
                status = %response.status(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Collaborator returned a transient status; retrying"
            );
            Step::Wait(delay)
        }
        Err(source) => {
            if !last && transport_is_transient(&source) {
                let delay = retry_delay(attempt, config, None);
                tracing::debug!(
                    error = %source,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Collaborator unreachable; retrying"
                );
                return Step::Wait(delay);
            }
            let outcome = if attempt == 0 {
                RetryOutcome::NonRetryable(source)
            } else {
                RetryOutcome::ConnectionError {
                    attempts: attempt + 1,
                    source,
                }
            };
            Step::Done(outcome)
        }
    }
}

/// Sends the request produced by `build_request`, retrying transient failures.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let key = new_idempotency_key();
    let mut attempt = 0;
    loop {
        let result = stamp(build_request(), attempt, &key).send().await;
        match judge(attempt, config, result) {
            Step::Done(outcome) => return outcome,
            Step::Wait(delay) => {
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}


#[cfg(test)]
mod wire_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    async fn post(server: &MockServer, route: &str, config: &RetryConfig) -> RetryOutcome {
        let client = reqwest::Client::new();
        let url = format!("{}{route}", server.uri());
        send_with_retry(|| client.post(&url), config).await
    }

    #[tokio::test]
    async fn recovers_after_transient_unavailability() {
        let server = MockServer::start().await;
        let calls = AtomicU32::new(0);
        Mock::given(method("POST"))
            .and(path("/grid"))
            .respond_with(move |_: &Request| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200)
                }
            })
            .expect(2)
            .mount(&server)
            .await;

        let outcome = post(&server, "/grid", &quick()).await;
        assert!(outcome.is_success(), "got {outcome:?}");
    }

    #[tokio::test]
    async fn gives_back_last_error_response_when_budget_is_spent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/grid"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        match post(&server, "/grid", &quick()).await {
            RetryOutcome::HttpError(response) => {
                assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            }
            other => panic!("expected HttpError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ledger_conflict_is_sent_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commitments"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = post(&server, "/commitments", &quick()).await;
        assert!(matches!(outcome, RetryOutcome::HttpError(ref r) if r.status() == 409));
    }

    #[tokio::test]
    async fn no_retry_budget_means_one_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/grid"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = RetryConfig {
            max_retries: 0,
            ..quick()
        };
        assert!(matches!(
            post(&server, "/grid", &config).await,
            RetryOutcome::HttpError(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_host_reports_attempt_count() {
        // Nothing listens on port 1.
        let client = reqwest::Client::new();
        let outcome = send_with_retry(|| client.post("http://127.0.0.1:1/grid"), &quick()).await;
        match outcome {
            RetryOutcome::ConnectionError { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected ConnectionError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attempts_share_key_and_count_up() {
        let server = MockServer::start().await;
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        Mock::given(method("POST"))
            .and(path("/grid"))
            .respond_with(move |req: &Request| {
                let read = |name: &str| {
                    req.headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_owned()
                };
                let mut seen = sink.lock().unwrap();
                seen.push((read("Idempotency-Key"), read("X-Retry-Count")));
                if seen.len() < 3 {
                    ResponseTemplate::new(500)
                } else {
                    ResponseTemplate::new(200)
                }
            })
            .expect(3)
            .mount(&server)
            .await;

        assert!(post(&server, "/grid", &quick()).await.is_success());

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(key, _)| key == &seen[0].0));
        assert!(seen[0].0.starts_with("verigreen-"));
        let counts: Vec<&str> = seen.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(counts, ["0", "1", "2"]);
    }
}
