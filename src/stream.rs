//! Incremental text generation over server-sent events.
//!
//! [`SseEvents`] turns a response body into `data:` payloads. [`TextStream`]
//! turns those payloads into text chunks and is what callers iterate.

use std::io::{self, BufRead};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{GatewayError, NetworkError, NetworkErrorKind};
use crate::extract::{block_reason, stream_chunk_text};
use crate::retry::safe_error_detail;

/// `data:` payloads of an event stream, one item per dispatched event.
pub struct SseEvents {
    reader: Box<dyn BufRead + Send>,
    finished: bool,
}

impl SseEvents {
    pub fn new(reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            reader,
            finished: false,
        }
    }
}

impl Iterator for SseEvents {
    type Item = Result<String, NetworkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut data: Option<String> = None;
        let mut buf = String::new();
        loop {
            buf.clear();
            match self.reader.read_line(&mut buf) {
                Ok(0) => {
                    self.finished = true;
                    return data.map(Ok);
                }
                Ok(_) => {}
                Err(err) => {
                    self.finished = true;
                    return Some(Err(read_error(&err)));
                }
            }

            let line = buf.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                match data.take() {
                    Some(payload) => return Some(Ok(payload)),
                    None => continue,
                }
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field != "data" {
                continue;
            }
            match data.as_mut() {
                Some(payload) => {
                    payload.push('\n');
                    payload.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }
}

fn read_error(err: &io::Error) -> NetworkError {
    let kind = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
        _ => NetworkErrorKind::Other,
    };
    NetworkError::new(kind, format!("stream read failed: {err}"))
}

enum Event {
    Text(String),
    Blocked(String),
    Nothing,
}

fn parse_event(model: &str, data: &str) -> Result<Event, GatewayError> {
    let envelope: Value = serde_json::from_str(data).map_err(|err| GatewayError::InvalidJson {
        model: model.to_string(),
        message: err.to_string(),
    })?;

    // Errors raised after the stream opened arrive in-band.
    if let Some(err) = envelope.get("error").filter(|e| e.is_object()) {
        let status = err
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(500);
        return Err(GatewayError::Http {
            model: model.to_string(),
            status,
            detail: safe_error_detail(data.as_bytes()),
        });
    }

    if let Some(chunk) = stream_chunk_text(&envelope) {
        return Ok(Event::Text(chunk));
    }
    Ok(match block_reason(&envelope) {
        Some(reason) => Event::Blocked(reason),
        None => Event::Nothing,
    })
}

/// Text chunks from one model, in arrival order.
///
/// A stream returned by the gateway has already produced its first chunk, so
/// an error item can only follow delivered text. After an error item the
/// stream ends.
pub struct TextStream {
    model: String,
    pending: Option<String>,
    events: Option<SseEvents>,
    chunks: usize,
}

impl TextStream {
    /// Whole text delivered as a single chunk.
    pub fn single(model: impl Into<String>, text: String) -> Self {
        Self {
            model: model.into(),
            pending: Some(text),
            events: None,
            chunks: 0,
        }
    }

    /// Read events until the first text chunk. A stream that ends first is an
    /// empty response, carrying the block reason when the provider sent one.
    pub fn start(model: &str, mut events: SseEvents) -> Result<Self, GatewayError> {
        let mut blocked = None;
        loop {
            let data = match events.next() {
                Some(Ok(data)) => data,
                Some(Err(source)) => {
                    return Err(GatewayError::Network {
                        model: model.to_string(),
                        source,
                    })
                }
                None => {
                    return Err(GatewayError::EmptyResponse {
                        model: model.to_string(),
                        reason: match blocked {
                            Some(reason) => format!("stream ended without text (blockReason={reason})"),
                            None => "stream ended without text".to_string(),
                        },
                    })
                }
            };
            match parse_event(model, &data)? {
                Event::Text(chunk) => {
                    return Ok(Self {
                        model: model.to_string(),
                        pending: Some(chunk),
                        events: Some(events),
                        chunks: 0,
                    })
                }
                Event::Blocked(reason) => blocked = Some(reason),
                Event::Nothing => {}
            }
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Drain the stream into one string.
    pub fn collect_text(self) -> Result<String, GatewayError> {
        self.collect()
    }

    fn deliver(&mut self, chunk: String) -> Option<Result<String, GatewayError>> {
        self.chunks += 1;
        Some(Ok(chunk))
    }

    fn fail(&mut self, err: GatewayError) -> Option<Result<String, GatewayError>> {
        self.events = None;
        info!(model = %self.model, chunks = self.chunks, "stream failed: {err}");
        Some(Err(err))
    }
}

impl Iterator for TextStream {
    type Item = Result<String, GatewayError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chunk) = self.pending.take() {
            return self.deliver(chunk);
        }
        loop {
            let next = self.events.as_mut()?.next();
            let data = match next {
                Some(Ok(data)) => data,
                Some(Err(source)) => {
                    let model = self.model.clone();
                    return self.fail(GatewayError::Network { model, source });
                }
                None => {
                    self.events = None;
                    debug!(model = %self.model, chunks = self.chunks, "stream finished");
                    return None;
                }
            };
            match parse_event(&self.model, &data) {
                Ok(Event::Text(chunk)) => return self.deliver(chunk),
                Ok(Event::Blocked(_) | Event::Nothing) => {}
                Err(err) => return self.fail(err),
            }
        }
    }
}
