//! HTTP client for the external vegetation verifier.
//!
//! `POST {base}/verify` with `{bounds, claimant}`; the verifier answers with the
//! computed grid. Health math happens entirely on the verifier side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use verigreen_types::{BoundingBox, Cell, ClaimantAddress, ContentRef, VerificationGrid};

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::{ClientFut, HttpSettings, VerificationGridSource, build_http_client, endpoint};

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier unreachable after {attempts} attempt(s): {message}")]
    Unreachable { attempts: u32, message: String },
    #[error("verifier returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed verifier response: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    bounds: [f64; 4],
    claimant: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    cells: Vec<Cell>,
    #[serde(alias = "cid")]
    content_ref: String,
    #[serde(alias = "processing_time")]
    processing_time_secs: f64,
    #[serde(alias = "generated_at")]
    timestamp: DateTime<Utc>,
}

impl From<VerifyResponse> for VerificationGrid {
    fn from(value: VerifyResponse) -> Self {
        VerificationGrid {
            cells: value.cells,
            content_ref: ContentRef::new(value.content_ref),
            processing_time_secs: value.processing_time_secs,
            generated_at: value.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpVerifier {
    client: reqwest::Client,
    verify_url: Url,
    retry: RetryConfig,
}

impl HttpVerifier {
    pub fn new(base_url: &Url, settings: &HttpSettings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(settings)?,
            verify_url: endpoint(base_url, &["verify"]),
            retry: RetryConfig::default(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch(
        &self,
        bounds: &BoundingBox,
        claimant: &ClaimantAddress,
    ) -> Result<VerificationGrid, VerifierError> {
        let body = VerifyRequest {
            bounds: bounds.coords(),
            claimant: claimant.as_str(),
        };

        let outcome = send_with_retry(
            || self.client.post(self.verify_url.clone()).json(&body),
            &self.retry,
        )
        .await;

        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                let status = response.status().as_u16();
                let body = crate::read_capped_error_body(response).await;
                return Err(VerifierError::Status { status, body });
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(VerifierError::Unreachable {
                    attempts,
                    message: source.to_string(),
                });
            }
            RetryOutcome::NonRetryable(source) => {
                return Err(VerifierError::Unreachable {
                    attempts: 1,
                    message: source.to_string(),
                });
            }
        };

        let payload: VerifyResponse = response
            .json()
            .await
            .map_err(|e| VerifierError::Malformed(e.to_string()))?;

        let grid = VerificationGrid::from(payload);
        tracing::debug!(
            claimant = %claimant,
            cells = grid.len(),
            content_ref = %grid.content_ref,
            "Fetched verification grid"
        );
        Ok(grid)
    }
}

impl VerificationGridSource for HttpVerifier {
    fn fetch_grid<'a>(
        &'a self,
        bounds: &'a BoundingBox,
        claimant: &'a ClaimantAddress,
    ) -> ClientFut<'a, VerificationGrid, VerifierError> {
        Box::pin(self.fetch(bounds, claimant))
    }
}
