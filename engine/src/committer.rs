//! Commitment of passing verdicts to the ledger.

use std::sync::Arc;

use verigreen_clients::retry::{RetryConfig, backoff_delay};
use verigreen_clients::{Ledger, LedgerError};
use verigreen_types::{Claim, LedgerReceipt, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("refusing to commit a verdict that did not pass")]
    VerdictNotValid,
    #[error("claim was never registered on the ledger")]
    ClaimNotRegistered,
    #[error("parcel already has a verified commitment on the ledger")]
    AlreadyVerified,
    #[error("ledger still failing after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("ledger rejected commitment ({status}): {message}")]
    Rejected { status: u16, message: String },
}

pub struct LedgerCommitter {
    ledger: Arc<dyn Ledger>,
    retry: RetryConfig,
}

impl LedgerCommitter {
    /// `retry.max_retries` bounds re-submissions after transient failures.
    pub fn new(ledger: Arc<dyn Ledger>, retry: RetryConfig) -> Self {
        Self { ledger, retry }
    }

    /// Submit a passing verdict and wait for the ledger's receipt.
    ///
    /// Only transient failures are retried. A missing registration or an existing
    /// verification is final for this claim.
    pub async fn commit(
        &self,
        claim: &Claim,
        verdict: &Verdict,
    ) -> Result<LedgerReceipt, CommitError> {
        if !verdict.valid {
            return Err(CommitError::VerdictNotValid);
        }

        let mut attempt = 0u32;
        loop {
            let result = self
                .ledger
                .submit_commitment(claim.claimant(), claim.parcel(), verdict.commitment)
                .await;

            match result {
                Ok(receipt) => {
                    tracing::info!(
                        claimant = %claim.claimant(),
                        parcel = %claim.parcel(),
                        transaction_ref = %receipt.transaction_ref,
                        attempt = attempt + 1,
                        "Commitment included on ledger"
                    );
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = backoff_delay(attempt, &self.retry);
                    attempt += 1;
                    tracing::warn!(
                        claimant = %claim.claimant(),
                        parcel = %claim.parcel(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Transient ledger failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LedgerError::Transient(reason)) => {
                    return Err(CommitError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: reason,
                    });
                }
                Err(LedgerError::ClaimNotRegistered) => {
                    return Err(CommitError::ClaimNotRegistered);
                }
                Err(LedgerError::AlreadyVerified) => return Err(CommitError::AlreadyVerified),
                Err(LedgerError::Rejected { status, message }) => {
                    return Err(CommitError::Rejected { status, message });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use verigreen_clients::ClientFut;
    use verigreen_types::{
        BoundingBox, ClaimantAddress, CommitmentHash, EventMarker, ParcelId, Sample,
    };

    use super::*;

    /// Replays scripted results, counting calls.
    struct ScriptedLedger {
        script: Mutex<VecDeque<Result<LedgerReceipt, LedgerError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedLedger {
        fn new(script: Vec<Result<LedgerReceipt, LedgerError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl Ledger for ScriptedLedger {
        fn submit_commitment<'a>(
            &'a self,
            _claimant: &'a ClaimantAddress,
            _parcel: &'a ParcelId,
            _commitment: CommitmentHash,
        ) -> ClientFut<'a, LedgerReceipt, LedgerError> {
            *self.calls.lock().unwrap() += 1;
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LedgerError::Transient("script exhausted".into())));
            Box::pin(async move { next })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_factor: 0.0,
        }
    }

    fn claim_and_verdict(valid: bool) -> (Claim, Verdict) {
        let claim = Claim::new(
            ClaimantAddress::new("0x2222222222222222222222222222222222222222").unwrap(),
            ParcelId::new("parcel-2").unwrap(),
            BoundingBox::new([0.0, 0.0, 1.0, 1.0]).unwrap(),
            Utc::now(),
            EventMarker::new(5),
        );
        let verdict = Verdict {
            valid,
            commitment: CommitmentHash::from_bytes([1; 32]),
            sample: Sample::new(vec![0]),
            checks: Vec::new(),
            claim: claim.clone(),
        };
        (claim, verdict)
    }

    fn receipt() -> LedgerReceipt {
        LedgerReceipt {
            transaction_ref: "0xabc".into(),
            block_number: Some(1),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let ledger = ScriptedLedger::new(vec![
            Err(LedgerError::Transient("nonce too low".into())),
            Err(LedgerError::Transient("503".into())),
            Ok(receipt()),
        ]);
        let committer = LedgerCommitter::new(ledger.clone(), fast_retry(3));
        let (claim, verdict) = claim_and_verdict(true);

        assert_eq!(committer.commit(&claim, &verdict).await.unwrap(), receipt());
        assert_eq!(ledger.calls(), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let ledger = ScriptedLedger::new(Vec::new());
        let committer = LedgerCommitter::new(ledger.clone(), fast_retry(2));
        let (claim, verdict) = claim_and_verdict(true);

        let err = committer.commit(&claim, &verdict).await.unwrap_err();
        assert!(
            matches!(err, CommitError::RetriesExhausted { attempts: 3, .. }),
            "got {err:?}"
        );
        assert_eq!(ledger.calls(), 3);
    }

    #[tokio::test]
    async fn unregistered_claim_is_not_retried() {
        let ledger = ScriptedLedger::new(vec![Err(LedgerError::ClaimNotRegistered)]);
        let committer = LedgerCommitter::new(ledger.clone(), fast_retry(3));
        let (claim, verdict) = claim_and_verdict(true);

        assert_eq!(
            committer.commit(&claim, &verdict).await.unwrap_err(),
            CommitError::ClaimNotRegistered
        );
        assert_eq!(ledger.calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_verification_is_a_conflict() {
        let ledger = ScriptedLedger::new(vec![Err(LedgerError::AlreadyVerified)]);
        let committer = LedgerCommitter::new(ledger.clone(), fast_retry(3));
        let (claim, verdict) = claim_and_verdict(true);

        assert_eq!(
            committer.commit(&claim, &verdict).await.unwrap_err(),
            CommitError::AlreadyVerified
        );
        assert_eq!(ledger.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_commitment_is_not_retried() {
        let rejection = LedgerError::Rejected {
            status: 400,
            message: "bad commitment".into(),
        };
        assert!(!rejection.is_retryable());
        let ledger = ScriptedLedger::new(vec![Err(rejection), Ok(receipt())]);
        let committer = LedgerCommitter::new(ledger.clone(), fast_retry(3));
        let (claim, verdict) = claim_and_verdict(true);

        assert_eq!(
            committer.commit(&claim, &verdict).await.unwrap_err(),
            CommitError::Rejected {
                status: 400,
                message: "bad commitment".into(),
            }
        );
        assert_eq!(ledger.calls(), 1);
    }

    #[tokio::test]
    async fn failing_verdict_never_reaches_ledger() {
        let ledger = ScriptedLedger::new(vec![Ok(receipt())]);
        let committer = LedgerCommitter::new(ledger.clone(), fast_retry(3));
        let (claim, verdict) = claim_and_verdict(false);

        assert_eq!(
            committer.commit(&claim, &verdict).await.unwrap_err(),
            CommitError::VerdictNotValid
        );
        assert_eq!(ledger.calls(), 0);
    }
}
