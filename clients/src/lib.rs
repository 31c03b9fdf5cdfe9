//! Clients for the collaborators a claim pipeline talks to.
//!
//! # Architecture
//!
//! Each collaborator is a trait so the engine can run against test doubles:
//!
//! - [`VerificationGridSource`] - computes the per-cell health grid for a parcel
//! - [`RandomnessBeacon`] - accepts randomness requests; results arrive later on the feed
//! - [`Ledger`] - accepts commitment hashes and returns an inclusion receipt
//! - [`FeedTransport`] - opens the notification feed and serves historical events
//!
//! The HTTP implementations live in [`verifier`], [`beacon`], [`ledger`] and [`feed`].
//! All of them share one hardened `reqwest` client configuration and the
//! [`retry`] policy.

pub mod beacon;
pub mod feed;
pub mod ledger;
pub mod retry;
mod sse;
pub mod verifier;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use url::Url;
use verigreen_types::{
    BoundingBox, ClaimantAddress, CommitmentHash, EventKind, EventMarker, FeedEvent,
    LedgerReceipt, ParcelId, RequestNonce, VerificationGrid,
};

pub use beacon::{BeaconAck, BeaconError, HttpBeacon};
pub use feed::{FeedError, HttpFeed};
pub use ledger::{HttpLedger, LedgerError};
pub use verifier::{HttpVerifier, VerifierError};

/// Boxed future returned by collaborator trait methods.
pub type ClientFut<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

pub trait VerificationGridSource: Send + Sync {
    fn fetch_grid<'a>(
        &'a self,
        bounds: &'a BoundingBox,
        claimant: &'a ClaimantAddress,
    ) -> ClientFut<'a, VerificationGrid, VerifierError>;
}

/// Request side of the randomness beacon.
///
/// `submit` only acknowledges the request. The random value itself is delivered
/// later as a feed event carrying the same nonce (or the sequence it was assigned).
pub trait RandomnessBeacon: Send + Sync {
    fn submit(&self, nonce: RequestNonce, upper_bound: u64)
    -> ClientFut<'_, BeaconAck, BeaconError>;
}

pub trait Ledger: Send + Sync {
    fn submit_commitment<'a>(
        &'a self,
        claimant: &'a ClaimantAddress,
        parcel: &'a ParcelId,
        commitment: CommitmentHash,
    ) -> ClientFut<'a, LedgerReceipt, LedgerError>;
}

/// A live connection to the notification feed.
pub trait FeedStream: Send {
    /// Next event in delivery order. `Ok(None)` means the server closed the stream.
    fn next_event(&mut self) -> ClientFut<'_, Option<FeedEvent>, FeedError>;
}

pub trait FeedTransport: Send + Sync {
    fn connect<'a>(
        &'a self,
        kinds: &'a [EventKind],
    ) -> ClientFut<'a, Box<dyn FeedStream>, FeedError>;

    /// Events of `kind` with markers in `from..=to`. Not a subscription; nothing is retained.
    fn historical_events(
        &self,
        kind: EventKind,
        from: EventMarker,
        to: EventMarker,
    ) -> ClientFut<'_, Vec<FeedEvent>, FeedError>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const IDLE_CONNECTIONS_PER_HOST: usize = 32;
const IDLE_CONNECTION_TTL: Duration = Duration::from_secs(90);

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Transport settings shared by every collaborator client.
#[derive(Clone)]
pub struct HttpSettings {
    /// Whole-request timeout. `None` for streaming connections, which use an idle timeout instead.
    pub request_timeout: Option<Duration>,
    /// Permit plain `http://` endpoints. Off in production; local mock servers need it.
    pub allow_insecure_http: bool,
    /// Sent as `Authorization: Bearer <token>` on every request.
    pub api_token: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(60)),
            allow_insecure_http: false,
            api_token: None,
        }
    }
}

// Manual Debug impl to keep tokens out of logs.
impl fmt::Debug for HttpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSettings")
            .field("request_timeout", &self.request_timeout)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .field(
                "api_token",
                &if self.api_token.is_some() { "[REDACTED]" } else { "None" },
            )
            .finish()
    }
}

impl HttpSettings {
    /// Settings for a local or test endpoint reachable over plain HTTP.
    #[must_use]
    pub fn insecure(request_timeout: Option<Duration>) -> Self {
        Self {
            request_timeout,
            allow_insecure_http: true,
            api_token: None,
        }
    }
}

fn base_client_builder(settings: &HttpSettings) -> reqwest::ClientBuilder {
    use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

    let mut headers = HeaderMap::new();
    headers.insert("X-Verigreen-Host-OS", HeaderValue::from_static(std::env::consts::OS));
    if let Some(token) = &settings.api_token {
        if let Ok(mut bearer) = HeaderValue::from_str(&format!("Bearer {token}")) {
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
        } else {
            tracing::warn!("Ignoring API token containing invalid header characters");
        }
    }

    // Never follow redirects.
    let builder = reqwest::Client::builder()
        .user_agent(concat!("verigreen/", env!("CARGO_PKG_VERSION")))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::none())
        .https_only(!settings.allow_insecure_http)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Some(KEEPALIVE_IDLE))
        .pool_max_idle_per_host(IDLE_CONNECTIONS_PER_HOST)
        .pool_idle_timeout(Some(IDLE_CONNECTION_TTL));

    match settings.request_timeout {
        Some(timeout) => builder.timeout(timeout),
        None => builder,
    }
}

pub fn build_http_client(settings: &HttpSettings) -> Result<reqwest::Client, reqwest::Error> {
    base_client_builder(settings).build()
}

/// Append path segments to a base URL, tolerating a trailing slash on the base.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Error body text for diagnostics, cut off after a fixed size.
pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::TryStreamExt;

    let mut collected: Vec<u8> = Vec::new();
    let mut chunks = response.bytes_stream();
    let mut cut = false;
    while let Ok(Some(chunk)) = chunks.try_next().await {
        let room = MAX_ERROR_BODY_BYTES - collected.len();
        if chunk.len() > room {
            collected.extend_from_slice(&chunk[..room]);
            cut = true;
            break;
        }
        collected.extend_from_slice(&chunk);
    }

    let text = String::from_utf8_lossy(&collected);
    if cut {
        format!("{text}...(truncated)")
    } else {
        text.into_owned()
    }
}
