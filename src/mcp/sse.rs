//! Event Stream Parser
//!
//! Incremental decoder for `text/event-stream` bodies. Bytes are fed in
//! arbitrary chunks; complete records come out as [`SseEvent`]s.
//!
//! Framing rules:
//! - lines are split on `\n`, a trailing `\r` is stripped
//! - `event:` sets the pending event name, `data:` accumulates pending data
//!   (values trimmed, multiple data lines joined with `\n`)
//! - any other line, including `:` comments, is ignored
//! - a blank line ends the record when both the name and the data are
//!   non-empty; the record is emitted and the pending state reset. Otherwise
//!   the pending fields carry over into the next record
//! - at end of stream a partially accumulated record is still emitted
//!
//! The parser never fails on malformed input.

use futures_util::stream::{self, Stream, StreamExt};
use std::{collections::VecDeque, pin::Pin};
use tracing::trace;

use super::errors::{MCPError, MCPResult};

/// One decoded event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name from the `event:` line
    pub event: String,
    /// Payload from the `data:` line(s)
    pub data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Incremental event-stream parser, one per connection
#[derive(Debug, Default)]
pub struct SseParser {
    /// Bytes of the current, not yet terminated line
    buffer: Vec<u8>,
    /// Pending event name
    event: String,
    /// Pending data
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every record completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Signal end of stream, flushing any partially accumulated record
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.take_record()
    }

    /// Whether a record is partially accumulated
    pub fn has_pending(&self) -> bool {
        !self.event.is_empty() || !self.data.is_empty() || !self.buffer.is_empty()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.take_record();
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value.trim());
        } else {
            trace!("Ignoring event-stream line: {}", line);
        }
        None
    }

    fn take_record(&mut self) -> Option<SseEvent> {
        if self.event.is_empty() || self.data.is_empty() {
            if !self.data.is_empty() {
                trace!("Holding event-stream data without an event name");
            }
            return None;
        }
        Some(SseEvent {
            event: std::mem::take(&mut self.event),
            data: std::mem::take(&mut self.data),
        })
    }
}

/// Parse a complete event-stream body
pub fn parse_events(input: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.feed(input.as_bytes());
    events.extend(parser.finish());
    events
}

struct EventStreamState<S> {
    source: Pin<Box<S>>,
    parser: SseParser,
    queue: VecDeque<SseEvent>,
    finished: bool,
}

/// Turn a byte-chunk stream into a lazy stream of events.
///
/// A read error is yielded once and ends the stream; the partial record at
/// that point is discarded. A clean end flushes the partial record.
pub fn event_stream<S, B, E>(source: S) -> impl Stream<Item = MCPResult<SseEvent>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<MCPError>,
{
    let state = EventStreamState {
        source: Box::pin(source),
        parser: SseParser::new(),
        queue: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.source.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.feed(chunk.as_ref());
                    state.queue.extend(events);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err.into()), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.parser.finish();
                    state.queue.extend(tail);
                }
            }
        }
    })
}
