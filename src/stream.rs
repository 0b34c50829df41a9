//! Incremental decoder for the model proxy's `data: {json}` line stream.
//!
//! Network reads are not aligned with frame boundaries, so the parser keeps a
//! text buffer between reads and only ever acts on complete lines.

use crate::error::ChatError;
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

// Alias for the stream type handed to the chat engine
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
    // Bytes of a UTF-8 sequence cut off by a read boundary
    pending: Vec<u8>,
    done: bool,
}

enum LineOutcome {
    Skip,
    Delta(String),
    Done,
    Incomplete,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `data: [DONE]` has been seen; nothing is emitted after that.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consumes one network read and returns the deltas it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        let text = self.decode(chunk);
        self.buffer.push_str(&text);

        let mut deltas = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            match classify(&line) {
                LineOutcome::Skip => {}
                LineOutcome::Delta(delta) => deltas.push(delta),
                LineOutcome::Done => {
                    log::info!("Stream finished with [DONE]");
                    self.done = true;
                    break;
                }
                LineOutcome::Incomplete => {
                    // Put the line back and wait for the next read
                    line.push('\n');
                    self.buffer.insert_str(0, &line);
                    break;
                }
            }
        }
        deltas
    }

    /// Best-effort pass over whatever is left once the server closes the stream.
    pub fn finish(&mut self) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        let mut rest = std::mem::take(&mut self.buffer);
        if !self.pending.is_empty() {
            rest.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }

        let mut deltas = Vec::new();
        for raw in rest.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            match classify(line) {
                LineOutcome::Delta(delta) => deltas.push(delta),
                LineOutcome::Done => {
                    self.done = true;
                    break;
                }
                LineOutcome::Incomplete => {
                    log::warn!("Discarding malformed trailing frame: {}", line)
                }
                LineOutcome::Skip => {}
            }
        }
        deltas
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(e) if e.error_len().is_none() => {
                // Truncated multi-byte character at the end; keep it for later
                let valid = e.valid_up_to();
                self.pending = bytes[valid..].to_vec();
                String::from_utf8_lossy(&bytes[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}

fn classify(line: &str) -> LineOutcome {
    if line.trim().is_empty() || line.starts_with(':') {
        return LineOutcome::Skip;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Skip;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return LineOutcome::Done;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(frame) => match frame.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            Some(content) if !content.is_empty() => LineOutcome::Delta(content.to_string()),
            _ => LineOutcome::Skip,
        },
        Err(_) => LineOutcome::Incomplete,
    }
}

struct DeltaState<S> {
    body: Pin<Box<S>>,
    parser: FrameParser,
    queue: VecDeque<String>,
    closed: bool,
}

/// Wraps a raw body stream into a pull-based stream of content deltas.
///
/// A read error ends the stream after yielding it; malformed frames never do.
pub fn deltas<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DeltaState {
        body: Box::pin(body),
        parser: FrameParser::new(),
        queue: VecDeque::new(),
        closed: false,
    };

    let stream = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.queue.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.closed || state.parser.is_done() {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    log::debug!("Received {} bytes from model proxy", chunk.as_ref().len());
                    let parsed = state.parser.feed(chunk.as_ref());
                    state.queue.extend(parsed);
                }
                Some(Err(e)) => {
                    state.closed = true;
                    return Some((Err(ChatError::Stream(e.to_string())), state));
                }
                None => {
                    state.closed = true;
                    let parsed = state.parser.finish();
                    state.queue.extend(parsed);
                }
            }
        }
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn parse_in_pieces(input: &[u8], cuts: &[usize]) -> Vec<String> {
        let mut parser = FrameParser::new();
        let mut out = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            out.extend(parser.feed(&input[start..cut]));
            start = cut;
        }
        out.extend(parser.feed(&input[start..]));
        out.extend(parser.finish());
        out
    }

    fn sample_stream() -> String {
        let mut s = String::new();
        s.push_str(": keep-alive\n\n");
        s.push_str(&frame("Photo"));
        s.push_str("event: ping\n");
        s.push_str(&frame("synthesis "));
        s.push_str("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n");
        s.push_str(&frame("turns light — into «sugar» ✓"));
        s.push_str("data: [DONE]\n");
        s
    }

    #[test]
    fn ignores_comments_blank_and_unknown_lines() {
        let deltas = parse_in_pieces(sample_stream().as_bytes(), &[]);
        assert_eq!(deltas, ["Photo", "synthesis ", "turns light — into «sugar» ✓"]);
    }

    #[test]
    fn any_single_split_point_gives_same_deltas() {
        let input = sample_stream();
        let bytes = input.as_bytes();
        let whole = parse_in_pieces(bytes, &[]);
        for cut in 1..bytes.len() {
            assert_eq!(parse_in_pieces(bytes, &[cut]), whole, "split at byte {cut}");
        }
    }

    #[test]
    fn byte_by_byte_feeding_gives_same_deltas() {
        let input = sample_stream();
        let bytes = input.as_bytes();
        let cuts: Vec<usize> = (1..bytes.len()).collect();
        assert_eq!(parse_in_pieces(bytes, &cuts), parse_in_pieces(bytes, &[]));
    }

    #[test]
    fn json_split_mid_frame_is_parsed_once_complete() {
        let line = frame("hello");
        let middle = line.len() / 2;
        let mut parser = FrameParser::new();

        assert!(parser.feed(line[..middle].as_bytes()).is_empty());
        assert_eq!(parser.feed(line[middle..].as_bytes()), ["hello"]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn done_stops_emission_even_with_trailing_garbage() {
        let mut input = frame("a");
        input.push_str("data: [DONE]\n");
        input.push_str(&frame("never"));
        input.push_str("data: {broken");

        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(input.as_bytes()), ["a"]);
        assert!(parser.is_done());
        assert!(parser.feed(frame("late").as_bytes()).is_empty());
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn done_sentinel_tolerates_surrounding_whitespace() {
        let mut parser = FrameParser::new();
        parser.feed(b"data:  [DONE]  \r\n");
        assert!(parser.is_done());
    }

    #[test]
    fn trailing_frame_without_newline_is_flushed_at_close() {
        let mut parser = FrameParser::new();
        let line = frame("tail");
        let unterminated = line.trim_end();
        assert!(parser.feed(unterminated.as_bytes()).is_empty());
        assert_eq!(parser.finish(), ["tail"]);
    }

    #[test]
    fn malformed_line_delays_but_does_not_lose_later_frames() {
        let mut parser = FrameParser::new();
        let mut input = frame("one");
        input.push_str("data: {\"choices\": oops}\n");
        input.push_str(&frame("two"));

        assert_eq!(parser.feed(input.as_bytes()), ["one"]);
        assert!(parser.feed(frame("three").as_bytes()).is_empty());
        assert_eq!(parser.finish(), ["two", "three"]);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let input = frame("win").replace('\n', "\r\n");
        assert_eq!(parse_in_pieces(input.as_bytes(), &[]), ["win"]);
    }

    #[test]
    fn non_object_json_is_skipped() {
        let mut parser = FrameParser::new();
        let mut input = String::from("data: 42\n");
        input.push_str(&frame("ok"));
        assert_eq!(parser.feed(input.as_bytes()), ["ok"]);
    }

    #[tokio::test]
    async fn delta_stream_yields_across_reads() {
        let line = frame("streamed");
        let (a, b) = line.split_at(9);
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(frame("first ").into_bytes()),
            Ok(a.as_bytes().to_vec()),
            Ok(b.as_bytes().to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
            Ok(frame("ignored").into_bytes()),
        ];

        let collected: Vec<String> = deltas(stream::iter(chunks))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(collected, ["first ", "streamed"]);
    }

    #[tokio::test]
    async fn delta_stream_surfaces_read_errors() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(frame("partial").into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut stream = deltas(stream::iter(chunks));

        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        assert!(matches!(stream.next().await, Some(Err(ChatError::Stream(_)))));
        assert!(stream.next().await.is_none());
    }
}
