//! Notification feed over Server-Sent Events.
//!
//! `GET {base}/events?kinds=a,b` opens a live stream where every `data:` frame is
//! one JSON [`FeedEvent`]. `GET {base}/events/history` serves past events for backfill.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use url::Url;
use verigreen_types::{EventKind, EventMarker, FeedEvent};

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::sse::{MAX_BAD_PAYLOADS, MAX_BUFFERED_BYTES, frame_data, take_frame};
use crate::{ClientFut, FeedStream, FeedTransport, HttpSettings, build_http_client, endpoint};

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed connection failed: {0}")]
    Connect(String),
    #[error("feed returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("feed stream interrupted: {0}")]
    Stream(String),
    #[error("feed idle for {}s", .0.as_secs())]
    IdleTimeout(Duration),
    #[error("feed frame exceeded maximum size (4 MiB)")]
    BufferOverflow,
    #[error("invalid feed payload: {0}")]
    Malformed(String),
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

#[derive(Debug, Clone)]
pub struct HttpFeed {
    stream_client: reqwest::Client,
    history_client: reqwest::Client,
    base_url: Url,
    idle_timeout: Duration,
    retry: RetryConfig,
}

impl HttpFeed {
    /// `settings.request_timeout` applies to history queries only; the live stream
    /// is bounded by the idle timeout instead.
    pub fn new(base_url: &Url, settings: &HttpSettings) -> Result<Self, reqwest::Error> {
        let stream_settings = HttpSettings {
            request_timeout: None,
            ..settings.clone()
        };
        Ok(Self {
            stream_client: build_http_client(&stream_settings)?,
            history_client: build_http_client(settings)?,
            base_url: base_url.clone(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            retry: RetryConfig::default(),
        })
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn open(&self, kinds: &[EventKind]) -> Result<Box<dyn FeedStream>, FeedError> {
        let mut url = endpoint(&self.base_url, &["events"]);
        let kinds = kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        url.query_pairs_mut().append_pair("kinds", &kinds);

        let response = self
            .stream_client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = crate::read_capped_error_body(response).await;
            return Err(FeedError::Status { status, body });
        }

        tracing::debug!(kinds = %kinds, "Feed stream opened");
        let bytes: ByteStream = Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        Ok(Box::new(SseFeedStream::new(bytes, self.idle_timeout)))
    }

    async fn history(
        &self,
        kind: EventKind,
        from: EventMarker,
        to: EventMarker,
    ) -> Result<Vec<FeedEvent>, FeedError> {
        let mut url = endpoint(&self.base_url, &["events", "history"]);
        url.query_pairs_mut()
            .append_pair("kind", kind.as_str())
            .append_pair("from", &from.value().to_string())
            .append_pair("to", &to.value().to_string());

        let outcome =
            send_with_retry(|| self.history_client.get(url.clone()), &self.retry).await;
        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                let status = response.status().as_u16();
                let body = crate::read_capped_error_body(response).await;
                return Err(FeedError::Status { status, body });
            }
            RetryOutcome::ConnectionError { source, .. } | RetryOutcome::NonRetryable(source) => {
                return Err(FeedError::Connect(source.to_string()));
            }
        };

        let events: Vec<FeedEvent> = response
            .json()
            .await
            .map_err(|e| FeedError::Malformed(e.to_string()))?;
        Ok(events
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect())
    }
}

impl FeedTransport for HttpFeed {
    fn connect<'a>(
        &'a self,
        kinds: &'a [EventKind],
    ) -> ClientFut<'a, Box<dyn FeedStream>, FeedError> {
        Box::pin(self.open(kinds))
    }

    fn historical_events(
        &self,
        kind: EventKind,
        from: EventMarker,
        to: EventMarker,
    ) -> ClientFut<'_, Vec<FeedEvent>, FeedError> {
        Box::pin(self.history(kind, from, to))
    }
}

/// Incremental SSE decoder over a byte stream.
struct SseFeedStream {
    bytes: ByteStream,
    buffer: Vec<u8>,
    ready: VecDeque<FeedEvent>,
    parse_errors: usize,
    idle_timeout: Duration,
    finished: bool,
}

impl SseFeedStream {
    fn new(bytes: ByteStream, idle_timeout: Duration) -> Self {
        Self {
            bytes,
            buffer: Vec::new(),
            ready: VecDeque::new(),
            parse_errors: 0,
            idle_timeout,
            finished: false,
        }
    }

    async fn next(&mut self) -> Result<Option<FeedEvent>, FeedError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }

            let Ok(next) = tokio::time::timeout(self.idle_timeout, self.bytes.next()).await else {
                return Err(FeedError::IdleTimeout(self.idle_timeout));
            };
            let Some(chunk) = next else {
                self.finished = true;
                continue;
            };
            let chunk = chunk.map_err(|e| FeedError::Stream(e.to_string()))?;
            self.buffer.extend_from_slice(&chunk);

            if self.buffer.len() > MAX_BUFFERED_BYTES {
                return Err(FeedError::BufferOverflow);
            }

            self.decode_buffered()?;
        }
    }

    fn decode_buffered(&mut self) -> Result<(), FeedError> {
        while let Some(frame) = take_frame(&mut self.buffer) {
            if frame.is_empty() {
                continue;
            }
            let Ok(frame) = std::str::from_utf8(&frame) else {
                return Err(FeedError::Malformed(
                    "received invalid UTF-8 from feed".to_string(),
                ));
            };
            let Some(data) = frame_data(frame) else {
                continue;
            };

            match parse_feed_payload(&data) {
                Ok(Some(event)) => {
                    self.parse_errors = 0;
                    self.ready.push_back(event);
                }
                Ok(None) => {}
                Err(e) => {
                    self.parse_errors = self.parse_errors.saturating_add(1);
                    tracing::warn!(%e, payload_bytes = data.len(), "Invalid feed payload");
                    if self.parse_errors >= MAX_BAD_PAYLOADS {
                        return Err(FeedError::Malformed(e.to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// `Ok(None)` for well-formed events of a kind this client does not model.
fn parse_feed_payload(data: &str) -> Result<Option<FeedEvent>, serde_json::Error> {
    let json: serde_json::Value = serde_json::from_str(data)?;
    let kind = json.get("kind").and_then(serde_json::Value::as_str);
    if let Some(kind) = kind
        && kind.parse::<EventKind>().is_err()
    {
        tracing::trace!(kind, "Skipping unmodelled feed event");
        return Ok(None);
    }
    serde_json::from_value(json).map(Some)
}

impl FeedStream for SseFeedStream {
    fn next_event(&mut self) -> ClientFut<'_, Option<FeedEvent>, FeedError> {
        Box::pin(self.next())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const CLAIM_FRAME: &str = r#"data: {"kind":"claim_submitted","claimant":"0x00000000000000000000000000000000000000aa","parcel_id":"p-1","coordinates":[0,0,1,1],"marker":1}"#;
    const FULFILLED_FRAME: &str =
        r#"data: {"kind":"randomness_fulfilled","sequence":4,"value":99,"marker":2}"#;

    fn feed_for(server: &MockServer) -> HttpFeed {
        let base = Url::parse(&server.uri()).unwrap();
        HttpFeed::new(&base, &HttpSettings::insecure(Some(Duration::from_secs(5))))
            .unwrap()
            .with_idle_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            })
    }

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(|c| Ok(c.to_vec())),
        ))
    }

    #[tokio::test]
    async fn streams_events_in_delivery_order() {
        let server = MockServer::start().await;
        let body = format!(": hello\n\n{CLAIM_FRAME}\n\nevent: x\n{FULFILLED_FRAME}\r\n\r\n");
        Mock::given(method("GET"))
            .and(path("/events"))
            .and(query_param("kinds", "claim_submitted,randomness_fulfilled"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let feed = feed_for(&server);
        let mut stream = feed
            .connect(&[EventKind::ClaimSubmitted, EventKind::RandomnessFulfilled])
            .await
            .unwrap();

        let first = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind(), EventKind::ClaimSubmitted);
        assert_eq!(first.marker(), EventMarker::new(1));
        let second = stream.next_event().await.unwrap().unwrap();
        assert_eq!(second.kind(), EventKind::RandomnessFulfilled);
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_surfaces_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
            .mount(&server)
            .await;

        let feed = feed_for(&server);
        let Err(err) = feed.connect(&[EventKind::ClaimSubmitted]).await else {
            panic!("expected connect failure");
        };
        assert!(
            matches!(err, FeedError::Status { status: 503, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let mut stream = SseFeedStream::new(
            byte_stream(vec![
                b"data: {\"kind\":\"randomness_requested\",",
                b"\"nonce\":\"0x0000000000000000000000000000000000000000000000000000000000000001\",",
                b"\"sequence\":3,\"marker\":8}\n\n",
            ]),
            Duration::from_secs(1),
        );

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::RandomnessRequested);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_kinds_are_skipped() {
        let mut stream = SseFeedStream::new(
            byte_stream(vec![
                b"data: {\"kind\":\"block_mined\",\"height\":1}\n\n",
                b"data: {\"kind\":\"randomness_fulfilled\",\"sequence\":1,\"value\":5,\"marker\":3}\n\n",
            ]),
            Duration::from_secs(1),
        );

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.marker(), EventMarker::new(3));
    }

    #[tokio::test]
    async fn repeated_garbage_fails_the_stream() {
        let mut stream = SseFeedStream::new(
            byte_stream(vec![b"data: {\n\ndata: nope\n\ndata: ]\n\n"]),
            Duration::from_secs(1),
        );

        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_stream_hits_idle_timeout() {
        let pending: ByteStream = Box::pin(futures_util::stream::pending());
        let mut stream = SseFeedStream::new(pending, Duration::from_millis(20));

        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, FeedError::IdleTimeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn history_filters_by_kind_and_passes_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/history"))
            .and(query_param("kind", "claim_submitted"))
            .and(query_param("from", "10"))
            .and(query_param("to", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"kind": "claim_submitted", "claimant": "0x00000000000000000000000000000000000000aa",
                 "parcel_id": "p-1", "coordinates": ["0", "0", "1", "1"], "marker": 11},
                {"kind": "randomness_fulfilled", "sequence": 1, "value": 2, "marker": 12}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let events = feed_for(&server)
            .historical_events(
                EventKind::ClaimSubmitted,
                EventMarker::new(10),
                EventMarker::new(20),
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].marker(), EventMarker::new(11));
    }
}
