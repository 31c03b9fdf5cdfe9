//! HTTP client for the verifiable randomness beacon.
//!
//! Submission is fire-and-acknowledge: the beacon answers `POST {base}/requests`
//! straight away and publishes the random value later on the feed.

use serde::{Deserialize, Serialize};
use url::Url;
use verigreen_types::RequestNonce;

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::{ClientFut, HttpSettings, RandomnessBeacon, build_http_client, endpoint};

#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("beacon unreachable after {attempts} attempt(s): {message}")]
    Unreachable { attempts: u32, message: String },
    #[error("beacon rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed beacon acknowledgement: {0}")]
    Malformed(String),
}

/// Synchronous acknowledgement of a randomness request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BeaconAck {
    /// Present when the beacon assigns a sequence number up front.
    #[serde(default)]
    pub sequence: Option<u64>,
}

#[derive(Serialize)]
struct BeaconRequest {
    nonce: RequestNonce,
    upper_bound: u64,
}

#[derive(Debug, Clone)]
pub struct HttpBeacon {
    client: reqwest::Client,
    requests_url: Url,
    retry: RetryConfig,
}

impl HttpBeacon {
    pub fn new(base_url: &Url, settings: &HttpSettings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(settings)?,
            requests_url: endpoint(base_url, &["requests"]),
            retry: RetryConfig::default(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, nonce: RequestNonce, upper_bound: u64) -> Result<BeaconAck, BeaconError> {
        let body = BeaconRequest { nonce, upper_bound };
        let outcome = send_with_retry(
            || self.client.post(self.requests_url.clone()).json(&body),
            &self.retry,
        )
        .await;

        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                let status = response.status().as_u16();
                let body = crate::read_capped_error_body(response).await;
                return Err(BeaconError::Rejected { status, body });
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(BeaconError::Unreachable {
                    attempts,
                    message: source.to_string(),
                });
            }
            RetryOutcome::NonRetryable(source) => {
                return Err(BeaconError::Unreachable {
                    attempts: 1,
                    message: source.to_string(),
                });
            }
        };

        // An empty 2xx body is a bare acknowledgement.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BeaconError::Malformed(e.to_string()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BeaconAck::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| BeaconError::Malformed(e.to_string()))
    }
}

impl RandomnessBeacon for HttpBeacon {
    fn submit(
        &self,
        nonce: RequestNonce,
        upper_bound: u64,
    ) -> ClientFut<'_, BeaconAck, BeaconError> {
        Box::pin(self.send(nonce, upper_bound))
    }
}
