//! Server-sent-events framing.
//!
//! The decoder is fed raw body chunks and yields complete frames. Chunk
//! boundaries may fall anywhere, including inside a CRLF pair.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};

use crate::transport::{FrameStream, StreamError};

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Frames without an explicit event type default to `message`.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    after_cr: bool,
    data: String,
    event: Option<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &b in chunk {
            match b {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = b == b'\r';
                    let line = std::mem::take(&mut self.line);
                    if let Some(frame) = self.process_line(&line) {
                        frames.push(frame);
                    }
                }
                _ => {
                    self.after_cr = false;
                    self.line.push(b);
                }
            }
        }
        frames
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<SseFrame> {
        if raw.is_empty() {
            return self.dispatch();
        }
        let line = String::from_utf8_lossy(raw);
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        data.pop();
        Some(SseFrame { id, event, data })
    }
}

/// Turn a byte-chunk body into a stream of frames. A body error ends the
/// stream with [`StreamError::Disconnected`].
pub fn frames<S, B, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (body.boxed(), SseDecoder::new(), VecDeque::new(), false);
    futures::stream::unfold(state, |(mut body, mut decoder, mut pending, done)| async move {
        loop {
            if let Some(frame) = pending.pop_front() {
                return Some((Ok(frame), (body, decoder, pending, done)));
            }
            if done {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => pending.extend(decoder.feed(chunk.as_ref())),
                Some(Err(e)) => {
                    let err = StreamError::Disconnected(e.to_string());
                    return Some((Err(err), (body, decoder, pending, true)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
