//! HTTP client for the authoritative ledger.
//!
//! One call is one attempt. Retrying transient failures is the committer's job,
//! so this client only classifies what went wrong.

use serde::{Deserialize, Serialize};
use url::Url;
use verigreen_types::{ClaimantAddress, CommitmentHash, LedgerReceipt, ParcelId};

use crate::retry::is_transient_status;
use crate::{ClientFut, HttpSettings, Ledger, build_http_client, endpoint};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Network trouble or a 408/429/5xx. Safe to try again.
    #[error("transient ledger failure: {0}")]
    Transient(String),
    #[error("claim was never registered on the ledger")]
    ClaimNotRegistered,
    #[error("parcel already has a verified commitment")]
    AlreadyVerified,
    #[error("ledger rejected commitment ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl LedgerError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    claimant: &'a str,
    parcel_id: &'a str,
    commitment_hash: CommitmentHash,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    commitments_url: Url,
}

impl HttpLedger {
    pub fn new(base_url: &Url, settings: &HttpSettings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(settings)?,
            commitments_url: endpoint(base_url, &["commitments"]),
        })
    }

    async fn commit(
        &self,
        claimant: &ClaimantAddress,
        parcel: &ParcelId,
        commitment: CommitmentHash,
    ) -> Result<LedgerReceipt, LedgerError> {
        let body = CommitRequest {
            claimant: claimant.as_str(),
            parcel_id: parcel.as_str(),
            commitment_hash: commitment,
        };

        // Same commitment, same key: lets the ledger collapse our own retries.
        let response = self
            .client
            .post(self.commitments_url.clone())
            .header("Idempotency-Key", format!("verigreen-{}", commitment.to_hex()))
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<LedgerReceipt>()
                .await
                .map_err(|e| LedgerError::Rejected {
                    status: status.as_u16(),
                    message: format!("unreadable receipt: {e}"),
                });
        }

        let text = crate::read_capped_error_body(response).await;
        Err(classify_rejection(status, &text))
    }
}

fn classify_rejection(status: reqwest::StatusCode, body: &str) -> LedgerError {
    let detail = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error);

    match detail.as_ref().map(|d| d.code.as_str()) {
        Some("claim_not_registered") => return LedgerError::ClaimNotRegistered,
        Some("already_verified") => return LedgerError::AlreadyVerified,
        _ => {}
    }

    if status == reqwest::StatusCode::CONFLICT {
        return LedgerError::AlreadyVerified;
    }

    let message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| body.to_string());
    if is_transient_status(status) {
        return LedgerError::Transient(format!("{status}: {message}"));
    }
    LedgerError::Rejected {
        status: status.as_u16(),
        message,
    }
}

impl Ledger for HttpLedger {
    fn submit_commitment<'a>(
        &'a self,
        claimant: &'a ClaimantAddress,
        parcel: &'a ParcelId,
        commitment: CommitmentHash,
    ) -> ClientFut<'a, LedgerReceipt, LedgerError> {
        Box::pin(self.commit(claimant, parcel, commitment))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn ledger_for(server: &MockServer) -> HttpLedger {
        let base = Url::parse(&server.uri()).unwrap();
        HttpLedger::new(&base, &HttpSettings::insecure(Some(Duration::from_secs(5)))).unwrap()
    }

    fn ids() -> (ClaimantAddress, ParcelId) {
        (
            ClaimantAddress::new("0x00000000000000000000000000000000000000bb").unwrap(),
            ParcelId::new("parcel-7").unwrap(),
        )
    }

    async fn submit_against(response: ResponseTemplate) -> Result<LedgerReceipt, LedgerError> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commitments"))
            .respond_with(response)
            .expect(1)
            .mount(&server)
            .await;
        let (claimant, parcel) = ids();
        ledger_for(&server)
            .submit_commitment(&claimant, &parcel, CommitmentHash::from_bytes([3; 32]))
            .await
    }

    #[tokio::test]
    async fn returns_receipt_on_success() {
        let server = MockServer::start().await;
        let commitment = CommitmentHash::from_bytes([9; 32]);
        Mock::given(method("POST"))
            .and(path("/commitments"))
            .and(header(
                "Idempotency-Key",
                format!("verigreen-{}", commitment.to_hex()).as_str(),
            ))
            .and(body_json(json!({
                "claimant": "0x00000000000000000000000000000000000000bb",
                "parcel_id": "parcel-7",
                "commitment_hash": commitment.to_hex()
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"transaction_ref": "0xfeed", "block_number": 12})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (claimant, parcel) = ids();
        let receipt = ledger_for(&server)
            .submit_commitment(&claimant, &parcel, commitment)
            .await
            .unwrap();
        assert_eq!(receipt.transaction_ref, "0xfeed");
        assert_eq!(receipt.block_number, Some(12));
    }

    #[tokio::test]
    async fn unregistered_claim_is_typed() {
        let err = submit_against(
            ResponseTemplate::new(422)
                .set_body_json(json!({"error": {"code": "claim_not_registered"}})),
        )
        .await
        .unwrap_err();
        assert_eq!(err, LedgerError::ClaimNotRegistered);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn duplicate_is_a_conflict() {
        let err = submit_against(ResponseTemplate::new(409).set_body_string("duplicate"))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyVerified);

        let err = submit_against(
            ResponseTemplate::new(400).set_body_json(
                json!({"error": {"code": "already_verified", "message": "parcel done"}}),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyVerified);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let err = submit_against(ResponseTemplate::new(503).set_body_string("nonce too low"))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }

    #[tokio::test]
    async fn other_client_errors_are_rejections() {
        let err = submit_against(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"code": "bad_hash", "message": "odd length"}})),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Rejected {
                status: 400,
                message: "odd length".to_string()
            }
        );
    }
}
