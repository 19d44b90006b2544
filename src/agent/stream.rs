//! Streaming response decoding.
//!
//! Providers stream either SSE (`data: {...}`) or newline-delimited JSON.
//! Both are handled line by line: raw bytes are split into lines, then each
//! line is decoded into a JSON event or silently dropped as protocol noise.

use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use tracing::{debug, warn};

use super::providers::ProviderError;

/// Prefix stripped from SSE lines.
const DATA_PREFIX: &str = "data:";
/// End-of-stream sentinel.
const DONE_MARKER: &str = "[DONE]";
/// In-band keep-alive emitted by some gateways while the model is busy.
const PROCESSING_MARKER: &str = "PROCESSING";
/// In-band error marker; logged, never fatal.
const ERROR_MARKER: &str = "[ERROR]";

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value, ProviderError>> + Send>>;

/// Turns raw response lines into parsed JSON events.
#[derive(Debug, Default)]
pub struct StreamLineDecoder {
    /// Lines dropped because they were not valid JSON.
    malformed: usize,
}

impl StreamLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line. `None` means the line carried no event.
    pub fn decode(&mut self, raw: &str) -> Option<Value> {
        let line = raw.trim();
        let line = line.strip_prefix(DATA_PREFIX).unwrap_or(line).trim();

        if line.is_empty() {
            return None;
        }
        if line.ends_with(DONE_MARKER) || line.ends_with(PROCESSING_MARKER) {
            return None;
        }
        if line.ends_with(ERROR_MARKER) {
            warn!("Provider reported an in-band error: {}", line);
            return None;
        }

        match serde_json::from_str::<Value>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                // Vendor keep-alives sometimes arrive as bare words.
                if !line.contains(PROCESSING_MARKER) {
                    self.malformed += 1;
                    warn!("Skipping malformed stream line ({}): {}", e, line);
                }
                None
            }
        }
    }

    pub fn malformed_count(&self) -> usize {
        self.malformed
    }
}

/// Lazily decode a line stream into JSON events.
///
/// Transport errors are passed through; everything else that is not a JSON
/// event is absorbed.
pub fn decode_stream(lines: LineStream) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut decoder = StreamLineDecoder::new();
        let mut lines = lines;
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Some(event) = decoder.decode(&line) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
        if decoder.malformed_count() > 0 {
            debug!("Stream finished with {} malformed lines", decoder.malformed_count());
        }
    })
}

/// Split a byte stream into lines.
///
/// Bytes are buffered until a newline so multi-byte UTF-8 sequences split
/// across network chunks are decoded intact. A trailing partial line is
/// emitted when the stream closes.
pub fn split_lines<S, B, E>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut bytes = Box::pin(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(chunk.as_ref());

                    // Process complete lines
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        yield Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
                    }
                }
                Err(e) => {
                    yield Err(ProviderError::Stream(e.to_string()));
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            yield Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
    })
}
