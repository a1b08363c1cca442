//! Turns a streamed response body into timestamped output-unit arrivals.
//!
//! Frames are newline-delimited. SSE framing (`data: ...` + blank line) and
//! bare NDJSON both work:
//! - blank lines, `:` comments and `event:`/`id:`/`retry:` fields are skipped
//! - `data: [DONE]` ends the stream and is not a unit
//! - every other non-empty line is one output unit
//!
//! A unit is stamped with the receive time of the chunk that completed its line.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Instant;

const DONE_SENTINEL: &[u8] = b"[DONE]";

/// Longest unterminated line buffered before the body is rejected.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Why a body could not be turned into arrivals.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StreamError<E> {
    #[error("body read failed: {0}")]
    Body(E),

    #[error("line exceeds {0} bytes without a newline")]
    LineTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Unit,
    Done,
    Skip,
}

pub fn classify_line(line: &[u8]) -> Frame {
    let line = line.trim_ascii();
    if line.is_empty() || line.starts_with(b":") {
        return Frame::Skip;
    }
    if let Some(data) = line.strip_prefix(b"data:") {
        return if data.trim_ascii() == DONE_SENTINEL {
            Frame::Done
        } else {
            Frame::Unit
        };
    }
    if line.starts_with(b"event:") || line.starts_with(b"id:") || line.starts_with(b"retry:") {
        return Frame::Skip;
    }
    Frame::Unit
}

/// Splits arbitrary chunk boundaries back into lines.
#[derive(Debug)]
pub struct FrameDecoder {
    partial: Vec<u8>,
    max_line: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line,
        }
    }

    /// Frames for every line completed by `chunk`, in order. `Skip` is dropped.
    ///
    /// Fails once the unterminated tail would grow past `max_line` bytes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, usize> {
        let mut out = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let frame = if self.partial.is_empty() {
                classify_line(&rest[..pos])
            } else {
                self.partial.extend_from_slice(&rest[..pos]);
                let f = classify_line(&self.partial);
                self.partial.clear();
                f
            };
            if frame != Frame::Skip {
                out.push(frame);
            }
            rest = &rest[pos + 1..];
        }
        if self.partial.len() + rest.len() > self.max_line {
            self.partial.clear();
            return Err(self.max_line);
        }
        self.partial.extend_from_slice(rest);
        Ok(out)
    }

    /// Trailing line without a terminating newline, if any.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.partial.is_empty() {
            return None;
        }
        let f = classify_line(&self.partial);
        self.partial.clear();
        (f != Frame::Skip).then_some(f)
    }
}

/// Receipt of one output unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalEvent {
    /// 0 for the first unit
    pub index: u64,
    pub at: Instant,
}

/// Pulls chunks from a body stream and yields one [`ArrivalEvent`] per unit.
pub struct StreamReader<S> {
    body: S,
    decoder: FrameDecoder,
    ready: VecDeque<ArrivalEvent>,
    units: u64,
    last_chunk_at: Option<Instant>,
    finished: bool,
}

impl<S, E> StreamReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            units: 0,
            last_chunk_at: None,
            finished: false,
        }
    }

    /// `Ok(None)` once the body ends or the sentinel is seen.
    pub async fn next_event(&mut self) -> Result<Option<ArrivalEvent>, StreamError<E>> {
        loop {
            if let Some(ev) = self.ready.pop_front() {
                return Ok(Some(ev));
            }
            if self.finished {
                return Ok(None);
            }

            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(StreamError::Body)?;
                    let now = Instant::now();
                    self.last_chunk_at = Some(now);
                    let frames = self.decoder.feed(&chunk).map_err(StreamError::LineTooLong)?;
                    self.push_frames(frames, now);
                }
                None => {
                    if let (Some(frame), Some(at)) = (self.decoder.finish(), self.last_chunk_at) {
                        self.push_frames([frame], at);
                    }
                    self.finished = true;
                }
            }
        }
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    fn push_frames(&mut self, frames: impl IntoIterator<Item = Frame>, at: Instant) {
        for f in frames {
            match f {
                Frame::Unit => {
                    self.ready.push_back(ArrivalEvent {
                        index: self.units,
                        at,
                    });
                    self.units += 1;
                }
                Frame::Done => {
                    self.finished = true;
                    return;
                }
                Frame::Skip => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn drain<S, E>(r: &mut StreamReader<S>) -> Vec<ArrivalEvent>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Debug,
    {
        let mut out = Vec::new();
        while let Some(ev) = r.next_event().await.unwrap() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn classify() {
        assert_eq!(classify_line(b"data: {\"text\":\"a\"}"), Frame::Unit);
        assert_eq!(classify_line(b"data: [DONE]\r"), Frame::Done);
        assert_eq!(classify_line(b"data:[DONE]"), Frame::Done);
        assert_eq!(classify_line(b""), Frame::Skip);
        assert_eq!(classify_line(b"   \r"), Frame::Skip);
        assert_eq!(classify_line(b": keep-alive"), Frame::Skip);
        assert_eq!(classify_line(b"event: message"), Frame::Skip);
        assert_eq!(classify_line(b"{\"token\": 1}"), Frame::Unit);
    }

    #[test]
    fn decoder_joins_split_lines() {
        let mut d = FrameDecoder::new();
        assert!(d.feed(b"data: {\"te").unwrap().is_empty());
        assert_eq!(d.feed(b"xt\":\"a\"}\n\ndata: [DO").unwrap(), vec![Frame::Unit]);
        assert_eq!(d.feed(b"NE]\n\n").unwrap(), vec![Frame::Done]);
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn decoder_trailing_line() {
        let mut d = FrameDecoder::new();
        assert_eq!(d.feed(b"{\"a\":1}\n{\"a\":2}").unwrap(), vec![Frame::Unit]);
        assert_eq!(d.finish(), Some(Frame::Unit));
        assert_eq!(d.finish(), None);
    }

    #[tokio::test]
    async fn sse_units_counted_and_done_not() {
        let mut r = StreamReader::new(chunks(&[
            "data: {\"t\":\"a\"}\n\n",
            "data: {\"t\":\"b\"}\n\ndata: {\"t\":\"c\"}\n\n",
            "data: [DONE]\n\n",
        ]));
        let evs = drain(&mut r).await;
        assert_eq!(evs.len(), 3);
        assert_eq!(r.units(), 3);
        assert_eq!(evs.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        // b and c came in one chunk
        assert_eq!(evs[1].at, evs[2].at);
        assert!(evs[0].at <= evs[1].at);
    }

    #[tokio::test]
    async fn nothing_after_sentinel() {
        let mut r = StreamReader::new(chunks(&["data: x\n", "data: [DONE]\n", "data: late\n"]));
        assert_eq!(drain(&mut r).await.len(), 1);
    }

    #[tokio::test]
    async fn empty_body_yields_nothing() {
        let mut r = StreamReader::new(chunks(&[]));
        assert!(drain(&mut r).await.is_empty());

        let mut r = StreamReader::new(chunks(&["data: [DONE]\n\n"]));
        assert!(drain(&mut r).await.is_empty());
    }

    #[tokio::test]
    async fn unterminated_last_line_counts() {
        let mut r = StreamReader::new(chunks(&["{\"a\":1}\n", "{\"a\":2}"]));
        assert_eq!(drain(&mut r).await.len(), 2);
    }

    #[tokio::test]
    async fn body_error_surfaces() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err("connection reset"),
        ]);
        let mut r = StreamReader::new(body);
        assert!(r.next_event().await.unwrap().is_some());
        assert_eq!(r.next_event().await.unwrap_err(), StreamError::Body("connection reset"));
    }

    #[test]
    fn decoder_caps_unterminated_line() {
        let mut d = FrameDecoder::with_max_line(16);
        assert!(d.feed(b"data: 0123456").unwrap().is_empty());
        // terminated lines of any length are fine
        assert_eq!(d.feed(b"789abcdefghij\n").unwrap(), vec![Frame::Unit]);
        assert!(d.feed(b"data: 01234").unwrap().is_empty());
        assert_eq!(d.feed(b"56789abcdef"), Err(16));
    }

    #[tokio::test]
    async fn endless_line_is_an_error() {
        let body = stream::iter(
            std::iter::repeat(Bytes::from_static(&[b'x'; 4096]))
                .take(MAX_LINE_BYTES / 4096 + 1)
                .map(Ok::<_, Infallible>),
        );
        let mut r = StreamReader::new(body);
        assert_eq!(r.next_event().await.unwrap_err(), StreamError::LineTooLong(MAX_LINE_BYTES));
        assert_eq!(r.units(), 0);
    }
}
