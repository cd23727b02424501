//! Server-sent-events binding of the realtime transport.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use shared::{errors::ChannelError, models::Position};
use tracing::{debug, trace, warn};
use url::Url;

use super::transport::{Handshake, InboundFrame, Transport, TransportSession};
use crate::http::{self, endpoint};

/// Header carrying the connecting subject id.
pub const IDENTITY_HEADER: &str = "X-Vigil-Identity";
/// Header carrying the connecting role.
pub const ROLE_HEADER: &str = "X-Vigil-Role";

/// Longest line the decoder buffers before discarding it.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the server sent none.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Last `id:` field of the event.
    pub id: Option<String>,
}

/// Incremental SSE decoder.
///
/// Accepts arbitrary network chunks; events split across chunks, multi-line
/// `data:` fields and CRLF line endings are all handled. A line longer than
/// the configured limit is discarded together with the event it belongs to.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    max_line: usize,
    discarding: bool,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    ready: VecDeque<SseEvent>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_line_limit(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    /// Decoder with the default [`MAX_LINE_BYTES`] limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that discards lines longer than `max_line` bytes.
    pub fn with_line_limit(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
            event: None,
            data: Vec::new(),
            id: None,
            ready: VecDeque::new(),
        }
    }

    /// Feeds one network chunk; completed events become available through
    /// [`SseDecoder::next_event`].
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        let mut consumed = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buffer[cursor..].iter().position(|byte| *byte == b'\n') {
            let end = cursor + offset;
            let mut line = &self.buffer[consumed..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end + 1;
            cursor = consumed;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.process_line(&line);
        }
        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            warn!(target: "vigil::channel", limit = self.max_line, "discarding oversized SSE line");
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
            self.event = None;
            self.data.clear();
            self.id = None;
        }
    }

    /// Next completed event, in arrival order.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        self.ready.pop_front()
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => trace!(target: "vigil::channel", field, "ignoring unknown SSE field"),
        }
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() && self.event.is_none() {
            return;
        }
        self.ready.push_back(SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
            id: self.id.take(),
        });
        self.data.clear();
    }
}

#[derive(Debug, Deserialize)]
struct ReadyPayload {
    #[serde(rename = "connectionId", alias = "connection_id")]
    connection_id: String,
}

/// SSE transport against the Vigil realtime API.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    base_url: Url,
}

impl SseTransport {
    /// Transport against the API at `base_url`.
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl Transport for SseTransport {
    type Session = SseSession;

    async fn connect(&self, handshake: Handshake) -> Result<SseSession, ChannelError> {
        let url = endpoint(&self.base_url, "api/realtime/stream")
            .map_err(|err| ChannelError::Protocol(format!("invalid stream endpoint: {err}")))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&handshake.token.value)
            .header(IDENTITY_HEADER, &handshake.identity.subject_id)
            .header(ROLE_HEADER, &handshake.identity.role)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|err| ChannelError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(http::channel_error_from(response).await);
        }

        let mut session = SseSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: handshake.token.value,
            connection_id: String::new(),
            stream: response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|err| ChannelError::Network(err.to_string()))
                })
                .boxed(),
            decoder: SseDecoder::new(),
            finished: false,
        };

        loop {
            let Some(event) = session.next_event().await? else {
                return Err(ChannelError::Protocol(
                    "stream ended before the ready event".into(),
                ));
            };
            match event.event.as_str() {
                "ready" => {
                    let ready: ReadyPayload = serde_json::from_str(&event.data)
                        .map_err(|err| ChannelError::Protocol(format!("invalid ready event: {err}")))?;
                    debug!(target: "vigil::channel", connection_id = %ready.connection_id, "realtime session established");
                    session.connection_id = ready.connection_id;
                    return Ok(session);
                }
                "disconnect" => {
                    return Err(ChannelError::Server {
                        status: 503,
                        message: event.data,
                    });
                }
                other => trace!(target: "vigil::channel", event = other, "ignoring event before ready"),
            }
        }
    }
}

/// Established SSE session.
pub struct SseSession {
    client: Client,
    base_url: Url,
    token: String,
    connection_id: String,
    stream: BoxStream<'static, Result<Vec<u8>, ChannelError>>,
    decoder: SseDecoder,
    finished: bool,
}

impl std::fmt::Debug for SseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseSession")
            .field("base_url", &self.base_url.as_str())
            .field("connection_id", &self.connection_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl SseSession {
    /// Identifier the server assigned in its `ready` event.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Cancel-safe: a chunk is fed into the decoder in the same poll that
    /// yields it.
    async fn next_event(&mut self) -> Result<Option<SseEvent>, ChannelError> {
        loop {
            if let Some(event) = self.decoder.next_event() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(err)) => {
                    self.finished = true;
                    return Err(err);
                }
                None => {
                    self.finished = true;
                    // Flush an event missing its trailing blank line.
                    self.decoder.push(b"\n\n");
                }
            }
        }
    }

    fn subscriptions_url(&self) -> Result<Url, ChannelError> {
        endpoint(&self.base_url, "api/realtime/subscriptions")
            .map_err(|err| ChannelError::Protocol(format!("invalid subscriptions endpoint: {err}")))
    }

    async fn send(token: &str, request: reqwest::RequestBuilder) -> Result<(), ChannelError> {
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ChannelError::Network(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(http::channel_error_from(response).await)
        }
    }
}

#[async_trait]
impl TransportSession for SseSession {
    async fn subscribe(&mut self, scope: &str) -> Result<(), ChannelError> {
        let url = self.subscriptions_url()?;
        let body = json!({ "connectionId": self.connection_id, "scope": scope });
        Self::send(&self.token, self.client.post(url).json(&body)).await
    }

    async fn unsubscribe(&mut self, scope: &str) -> Result<(), ChannelError> {
        let mut url = self.subscriptions_url()?;
        url.path_segments_mut()
            .map_err(|()| ChannelError::Protocol("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(&self.connection_id)
            .push(scope);
        Self::send(&self.token, self.client.delete(url)).await
    }

    async fn publish_location(&mut self, position: Position) -> Result<(), ChannelError> {
        let url = endpoint(&self.base_url, "api/locations/me")
            .map_err(|err| ChannelError::Protocol(format!("invalid location endpoint: {err}")))?;
        let body = json!({ "lat": position.latitude, "lng": position.longitude });
        Self::send(&self.token, self.client.post(url).json(&body)).await
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, ChannelError>> {
        loop {
            let event = match self.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            };
            match event.event.as_str() {
                "location" | "message" => {
                    // Undecodable JSON still goes through validation so it is
                    // reported as a data-quality drop.
                    let value = serde_json::from_str(&event.data)
                        .unwrap_or(serde_json::Value::String(event.data));
                    return Some(Ok(InboundFrame::Location(value)));
                }
                "disconnect" => {
                    self.finished = true;
                    return Some(Ok(InboundFrame::Closed { reason: event.data }));
                }
                "heartbeat" | "ping" => return Some(Ok(InboundFrame::Heartbeat)),
                other => trace!(target: "vigil::channel", event = other, "ignoring SSE event"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SseDecoder) -> Vec<SseEvent> {
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: loc");
        decoder.push(b"ation\ndata: {\"id\":");
        assert!(decoder.next_event().is_none());
        decoder.push(b"\"r1\"}\n\nevent: ready\ndata: {}\n\n");

        let events = drain(&mut decoder);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "location");
        assert_eq!(events[0].data, r#"{"id":"r1"}"#);
        assert_eq!(events[1].event, "ready");
    }

    #[test]
    fn handles_crlf_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"id: 7\r\ndata: first\r\ndata: second\r\n\r\n");
        let events = drain(&mut decoder);
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".into(),
                data: "first\nsecond".into(),
                id: Some("7".into()),
            }]
        );
    }

    #[test]
    fn comments_and_blank_runs_are_ignored() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": keep-alive\n\n\n\nevent: heartbeat\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "heartbeat");
        assert!(events[0].data.is_empty());
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut decoder = SseDecoder::new();
        for byte in b"event: location\r\ndata: {\"id\":\"r1\"}\r\n\r\n" {
            decoder.push(std::slice::from_ref(byte));
        }
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "location");
        assert_eq!(events[0].data, r#"{"id":"r1"}"#);
    }

    #[test]
    fn oversized_line_is_discarded_with_its_event() {
        let mut decoder = SseDecoder::with_line_limit(16);
        decoder.push(b"event: location\ndata: ");
        for _ in 0..10 {
            decoder.push(b"xxxxxxxxxxxxxxxxxxxxxxxx");
        }
        assert!(decoder.buffer.len() <= 16 + 24);
        decoder.push(b"still the same line\n\n");
        assert!(decoder.next_event().is_none());

        decoder.push(b"event: heartbeat\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "heartbeat");
    }

    #[test]
    fn utf8_split_inside_a_character() {
        let payload = "data: Zoë\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        decoder.push(&payload[..split]);
        decoder.push(&payload[split..]);
        assert_eq!(drain(&mut decoder)[0].data, "Zoë");
    }
}
