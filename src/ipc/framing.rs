//! Reassembly of PyON messages from the agent's byte stream.
//!
//! # Wire Format
//!
//! ```text
//! > PyON 1 <type>\n
//! <payload>\n
//! ---\n
//! ```
//!
//! The header line may be preceded by the agent's `> ` prompt. A payload
//! starting with `{` or `[` ends where its brackets balance (brackets inside
//! quoted strings do not count); any other payload is a single line. A
//! header followed directly by another header or by `---` carries an empty
//! payload. The `---` terminator is optional. Lines that are not headers
//! (the greeting banner, bare prompts, blank lines) are skipped.
//!
//! [`FrameDecoder`] is the synchronous core and accepts bytes in arbitrary
//! chunks. [`FrameReader`] drives it from a [`Transport`].

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use super::transport::{Transport, TransportError};
use crate::pyon::{self, SyntaxError, Value};

/// Maximum frame size (64MB) to prevent OOM from a misbehaving agent.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Size of each socket read.
const READ_CHUNK_SIZE: usize = 16 * 1024;

const HEADER_MAGIC: &str = "PyON";
const TERMINATOR: &[u8] = b"---";

/// Framing error types.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The stream stalled or closed with a message half-received.
    #[error("Incomplete frame: {buffered} bytes buffered when the stream stopped")]
    Incomplete { buffered: usize },

    /// A single message grew past the configured limit.
    #[error("Frame exceeds maximum size of {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Frame is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

/// One complete message: type tag plus unparsed payload text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_type: String,
    pub payload: String,
}

impl RawMessage {
    /// Decode the payload as PyON.
    pub fn decode(&self) -> Result<Value, SyntaxError> {
        pyon::decode(&self.payload)
    }
}

/// Bracket-depth scanner state for a block payload.
#[derive(Debug, Clone, Default)]
struct BlockScan {
    /// Bytes of the block already examined.
    offset: usize,
    depth: usize,
    quote: Option<u8>,
    escaped: bool,
}

impl BlockScan {
    /// Continue scanning `block` (which starts at the opening bracket).
    /// Returns the block length once the brackets balance.
    fn advance(&mut self, block: &[u8]) -> Option<usize> {
        while self.offset < block.len() {
            let b = block[self.offset];
            self.offset += 1;

            if let Some(quote) = self.quote {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == quote {
                    self.quote = None;
                }
                continue;
            }

            match b {
                b'"' | b'\'' => self.quote = Some(b),
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.offset);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
enum State {
    /// Looking for a `PyON` header line.
    Header,
    /// Header seen; skipping whitespace up to the payload.
    PayloadStart { message_type: String },
    /// Inside a bracketed payload.
    Block { message_type: String, scan: BlockScan },
    /// Payload done; an optional `---` line may follow.
    Trailer,
}

/// Incremental frame decoder.
///
/// Feed bytes with [`push`](Self::push) in whatever chunks they arrive; the
/// messages produced do not depend on how the input was split.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            state: State::Header,
            max_frame_bytes,
        }
    }

    /// Buffer `data` and return every message it completes, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a message exceeds the size limit or a header or
    /// payload is not valid UTF-8. The decoder should be discarded after an
    /// error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, FrameError> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }

        if self.buffer.len() > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                limit: self.max_frame_bytes,
            });
        }
        Ok(messages)
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True while part of a message has been received but not all of it.
    ///
    /// Leftover prompt or banner text does not count.
    pub fn is_mid_frame(&self) -> bool {
        match &self.state {
            State::Header => {
                let pending = strip_prompt(&String::from_utf8_lossy(&self.buffer)).to_string();
                !pending.is_empty()
                    && (pending.starts_with(HEADER_MAGIC) || HEADER_MAGIC.starts_with(&pending))
            }
            State::Trailer => false,
            _ => true,
        }
    }

    /// Flush what is left once the stream has ended.
    ///
    /// A last header with no payload, or with a payload line missing its
    /// newline, still yields its message. The decoder is empty afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Incomplete`] if a bracketed payload or a header
    /// line was cut off.
    pub fn finish(&mut self) -> Result<Vec<RawMessage>, FrameError> {
        let buffered = self.buffer.len();
        let truncated_header = matches!(self.state, State::Header | State::Trailer) && {
            let text = String::from_utf8_lossy(&self.buffer);
            let pending = strip_prompt(&text);
            !pending.is_empty()
                && (pending.starts_with(HEADER_MAGIC) || HEADER_MAGIC.starts_with(pending))
                && parse_header(pending).is_none()
        };
        if truncated_header {
            return Err(FrameError::Incomplete { buffered });
        }

        if !self.buffer.is_empty() && !self.buffer.ends_with(b"\n") {
            self.buffer.extend_from_slice(b"\n");
        }
        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }

        match std::mem::replace(&mut self.state, State::Header) {
            State::PayloadStart { message_type } => messages.push(RawMessage {
                message_type,
                payload: String::new(),
            }),
            State::Block { .. } => return Err(FrameError::Incomplete { buffered }),
            State::Header | State::Trailer => {}
        }
        self.buffer.clear();
        Ok(messages)
    }

    /// True when a header has arrived and nothing of its payload has.
    fn awaits_payload(&self) -> bool {
        matches!(self.state, State::PayloadStart { .. })
            && self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    fn try_extract_one(&mut self) -> Result<Option<RawMessage>, FrameError> {
        loop {
            match &mut self.state {
                State::Header => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    match parse_header(&line) {
                        Some(message_type) => {
                            trace!("Frame header: {}", message_type);
                            self.state = State::PayloadStart { message_type };
                        }
                        None => {
                            if !line.trim().is_empty() {
                                trace!("Skipping non-frame line: {:?}", line.trim_end());
                            }
                        }
                    }
                }

                State::PayloadStart { message_type } => {
                    let skip = self
                        .buffer
                        .iter()
                        .take_while(|b| b.is_ascii_whitespace())
                        .count();
                    self.buffer.advance(skip);
                    let Some(&first) = self.buffer.first() else {
                        return Ok(None);
                    };
                    if first == b'{' || first == b'[' {
                        let message_type = std::mem::take(message_type);
                        self.state = State::Block {
                            message_type,
                            scan: BlockScan::default(),
                        };
                        continue;
                    }

                    // Single-line payload, unless the line opens the next
                    // message or terminates this one
                    let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
                        return Ok(None);
                    };
                    let line = std::str::from_utf8(&self.buffer[..end])?.trim();
                    let message_type = std::mem::take(message_type);
                    let payload = if parse_header(line).is_some() {
                        self.state = State::Header;
                        String::new()
                    } else if line.as_bytes() == TERMINATOR {
                        self.buffer.advance(end + 1);
                        self.state = State::Header;
                        String::new()
                    } else {
                        let payload = line.to_string();
                        self.buffer.advance(end + 1);
                        self.state = State::Trailer;
                        payload
                    };
                    return Ok(Some(RawMessage {
                        message_type,
                        payload,
                    }));
                }

                State::Block { message_type, scan } => {
                    let Some(len) = scan.advance(&self.buffer) else {
                        return Ok(None);
                    };
                    let message_type = std::mem::take(message_type);
                    let chunk = self.buffer.split_to(len);
                    let payload = std::str::from_utf8(&chunk)?.to_string();
                    self.state = State::Trailer;
                    return Ok(Some(RawMessage {
                        message_type,
                        payload,
                    }));
                }

                State::Trailer => {
                    match self.buffer.iter().position(|&b| b == b'\n') {
                        Some(end) => {
                            let line = self.buffer[..end].trim_ascii();
                            if line == TERMINATOR {
                                self.buffer.advance(end + 1);
                                self.state = State::Header;
                            } else if line.is_empty() {
                                // Rest of the payload's last line
                                self.buffer.advance(end + 1);
                            } else {
                                self.state = State::Header;
                            }
                        }
                        None => {
                            let partial = self.buffer.trim_ascii_start();
                            if TERMINATOR.starts_with(partial) && !partial.is_empty() {
                                // Could still become the terminator
                                return Ok(None);
                            }
                            if partial.is_empty() {
                                return Ok(None);
                            }
                            self.state = State::Header;
                        }
                    }
                }
            }
        }
    }

    /// Remove and return the next complete line, without its newline.
    fn take_line(&mut self) -> Result<Option<String>, FrameError> {
        let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = self.buffer.split_to(end + 1);
        let text = std::str::from_utf8(&line[..end])?;
        Ok(Some(text.trim_end_matches('\r').to_string()))
    }
}

/// Strip leading `> ` prompts the agent prints before its output.
fn strip_prompt(line: &str) -> &str {
    line.trim_start_matches(|c: char| c == '>' || c.is_whitespace())
}

/// Extract the message type from a `PyON <version> <type>` header line.
fn parse_header(line: &str) -> Option<String> {
    let mut tokens = strip_prompt(line).split_whitespace();
    if tokens.next()? != HEADER_MAGIC {
        return None;
    }
    let _version = tokens.next()?;
    tokens.next().map(str::to_string)
}

/// Reads [`RawMessage`]s from a [`Transport`].
pub struct FrameReader<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    pending: VecDeque<RawMessage>,
    chunk: Vec<u8>,
    receive_timeout: Duration,
    closed: bool,
}

impl<T: Transport> FrameReader<T> {
    pub fn new(transport: T, receive_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(max_frame_bytes),
            pending: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
            receive_timeout,
            closed: false,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` once the agent has closed the connection and every
    /// buffered message has been returned. A header whose payload never
    /// arrives is returned with an empty payload when the connection closes
    /// or the receive timeout expires.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Incomplete`] if the stream times out or closes with a
    ///   message partially buffered
    /// - [`FrameError::Transport`] with [`TransportError::Timeout`] if nothing
    ///   at all arrived within the receive timeout
    /// - any other transport or framing error
    pub async fn next_message(&mut self) -> Result<Option<RawMessage>, FrameError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            if self.closed {
                return Ok(None);
            }

            let received = self
                .transport
                .receive(&mut self.chunk, self.receive_timeout)
                .await;
            let n = match received {
                Ok(n) => n,
                Err(TransportError::Timeout(ms)) if self.decoder.awaits_payload() => {
                    debug!("No payload {}ms after header, treating it as empty", ms);
                    let messages = self.decoder.finish()?;
                    self.pending.extend(messages);
                    continue;
                }
                Err(TransportError::Timeout(_)) if self.decoder.is_mid_frame() => {
                    return Err(FrameError::Incomplete {
                        buffered: self.decoder.buffered(),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                debug!("Agent closed the connection");
                self.closed = true;
                let messages = self.decoder.finish()?;
                self.pending.extend(messages);
                continue;
            }

            let messages = self.decoder.push(&self.chunk[..n])?;
            self.pending.extend(messages);
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    const TWO_MESSAGES: &str = "Welcome to the Folding@home Client command server.\n\
        > PyON 1 slots\n\
        [{\"id\": \"00\", \"status\": \"RUNNING\", \"description\": \"cpu:4 {[\"}]\n\
        ---\n\
        > PyON 1 checkpoint\n\
        {\"index\": 0,\n \"positions\": [[0.0, 1e-1, -2],\n  [1, 2, 3]]}\n\
        ---\n\
        > ";

    fn message(message_type: &str, payload: &str) -> RawMessage {
        RawMessage {
            message_type: message_type.to_string(),
            payload: payload.to_string(),
        }
    }

    fn expected_two() -> Vec<RawMessage> {
        vec![
            message(
                "slots",
                "[{\"id\": \"00\", \"status\": \"RUNNING\", \"description\": \"cpu:4 {[\"}]",
            ),
            message(
                "checkpoint",
                "{\"index\": 0,\n \"positions\": [[0.0, 1e-1, -2],\n  [1, 2, 3]]}",
            ),
        ]
    }

    #[test]
    fn test_decode_whole_stream() {
        let mut decoder = FrameDecoder::default();
        let messages = decoder.push(TWO_MESSAGES.as_bytes()).unwrap();
        assert_eq!(messages, expected_two());
        assert!(!decoder.is_mid_frame(), "trailing prompt is not a frame");
    }

    #[test]
    fn test_every_split_point_yields_same_messages() {
        let bytes = TWO_MESSAGES.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::default();
            let mut messages = decoder.push(&bytes[..split]).unwrap();
            messages.extend(decoder.push(&bytes[split..]).unwrap());
            assert_eq!(messages, expected_two(), "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = FrameDecoder::default();
        let mut messages = Vec::new();
        for b in TWO_MESSAGES.as_bytes() {
            messages.extend(decoder.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(messages, expected_two());
    }

    #[test]
    fn test_scalar_payload_and_missing_terminator() {
        let mut decoder = FrameDecoder::default();
        let messages = decoder
            .push(b"PyON 1 end\nNone\nPyON 1 slots\r\n[]\r\n")
            .unwrap();
        assert_eq!(messages, vec![message("end", "None"), message("slots", "[]")]);
    }

    #[test]
    fn test_header_without_payload_keeps_next_message() {
        let text = b"PyON 1 end\n> PyON 1 slots\n[]\nPyON 1 end\n---\nPyON 1 units\n[]\n";
        let expected = vec![
            message("end", ""),
            message("slots", "[]"),
            message("end", ""),
            message("units", "[]"),
        ];
        for split in 0..=text.len() {
            let mut decoder = FrameDecoder::default();
            let mut messages = decoder.push(&text[..split]).unwrap();
            messages.extend(decoder.push(&text[split..]).unwrap());
            assert_eq!(messages, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_finish_flushes_trailing_message() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(b"PyON 1 end\n").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), vec![message("end", "")]);
        assert!(!decoder.is_mid_frame());

        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(b"PyON 1 end\nNone").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), vec![message("end", "None")]);

        let mut decoder = FrameDecoder::default();
        decoder.push(b"PyON 1 slots\n[]\n---\n> PyON 1 end").unwrap();
        assert_eq!(decoder.finish().unwrap(), vec![message("end", "")]);

        let mut decoder = FrameDecoder::default();
        decoder.push(b"PyON 1 slots\n[]\n> ").unwrap();
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_finish_rejects_cut_off_frames() {
        let mut decoder = FrameDecoder::default();
        decoder.push(b"PyON 1 topology\n{\"atoms\": [").unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(FrameError::Incomplete { buffered: 11 })
        ));

        let mut decoder = FrameDecoder::default();
        decoder.push(b"> PyO").unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(FrameError::Incomplete { .. })
        ));

        let mut decoder = FrameDecoder::default();
        decoder.push(b"PyON 1 slots\n[]\nPyON 1").unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(FrameError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_single_quoted_brackets_and_escapes() {
        let mut decoder = FrameDecoder::default();
        let text = "PyON 1 info\n{'name': 'a } b', \"q\": \"x \\\" ]\"}\n---\n";
        let messages = decoder.push(text.as_bytes()).unwrap();
        assert_eq!(
            messages,
            vec![message("info", "{'name': 'a } b', \"q\": \"x \\\" ]\"}")]
        );
        assert!(messages[0].decode().is_ok());
    }

    #[test]
    fn test_mid_frame_tracking() {
        let mut decoder = FrameDecoder::default();
        assert!(!decoder.is_mid_frame());

        decoder.push(b"> PyO").unwrap();
        assert!(decoder.is_mid_frame(), "partial header");

        decoder.push(b"N 1 topology\n{\"atoms\": [").unwrap();
        assert!(decoder.is_mid_frame(), "partial block");

        let messages = decoder.push(b"]}\n").unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!decoder.is_mid_frame());

        decoder.push(b"--").unwrap();
        assert!(!decoder.is_mid_frame(), "partial terminator");
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = FrameDecoder::new(32);
        let err = decoder
            .push(b"PyON 1 topology\n{\"atoms\": [\"a very long payload that never ends")
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { limit: 32 }));
    }

    #[test]
    fn test_invalid_utf8_payload() {
        let mut decoder = FrameDecoder::default();
        let err = decoder.push(b"PyON 1 slots\n[\"\xff\"]\n").unwrap_err();
        assert!(matches!(err, FrameError::Encoding(_)));
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header("PyON 1 slots"), Some("slots".to_string()));
        assert_eq!(parse_header("> > PyON 2 units"), Some("units".to_string()));
        assert_eq!(parse_header("PyON 1"), None);
        assert_eq!(parse_header("Welcome"), None);
        assert_eq!(parse_header(""), None);
    }

    /// Scripted transport: each entry is one receive result.
    enum Step {
        Data(&'static [u8]),
        Timeout,
    }

    struct ScriptedTransport {
        steps: VecDeque<Step>,
    }

    impl Transport for ScriptedTransport {
        async fn send(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn receive(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, TransportError> {
            match self.steps.pop_front() {
                Some(Step::Data(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(Step::Timeout) => Err(TransportError::Timeout(10)),
                None => Ok(0),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn reader(steps: Vec<Step>) -> FrameReader<ScriptedTransport> {
        FrameReader::new(
            ScriptedTransport {
                steps: steps.into(),
            },
            Duration::from_millis(10),
            DEFAULT_MAX_FRAME_BYTES,
        )
    }

    #[tokio::test]
    async fn test_reader_reassembles_across_reads() {
        let mut reader = reader(vec![
            Step::Data(b"PyON 1 slots\n[{\"id\": "),
            Step::Data(b"\"0\"}]\n---\nPyON 1 end\n"),
            Step::Data(b"None\n"),
        ]);

        let first = reader.next_message().await.unwrap().unwrap();
        assert_eq!(first, message("slots", "[{\"id\": \"0\"}]"));
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second, message("end", "None"));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_timeout_mid_frame_is_incomplete() {
        let mut reader = reader(vec![Step::Data(b"PyON 1 slots\n[{\"id\""), Step::Timeout]);
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(err, FrameError::Incomplete { buffered: 6 }));
    }

    #[tokio::test]
    async fn test_reader_timeout_between_frames() {
        let mut reader = reader(vec![Step::Data(b"> "), Step::Timeout]);
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Transport(TransportError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_close_after_bare_header() {
        let mut reader = reader(vec![
            Step::Data(b"PyON 1 checkpoint\n[[0, 0, 0]]\n---\n"),
            Step::Data(b"PyON 1 end\n"),
        ]);

        let first = reader.next_message().await.unwrap().unwrap();
        assert_eq!(first, message("checkpoint", "[[0, 0, 0]]"));
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second, message("end", ""));
        assert!(reader.next_message().await.unwrap().is_none());
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_timeout_after_bare_header() {
        let mut reader = reader(vec![
            Step::Data(b"PyON 1 end\n"),
            Step::Timeout,
            Step::Data(b"PyON 1 slots\n[]\n"),
        ]);

        let first = reader.next_message().await.unwrap().unwrap();
        assert_eq!(first, message("end", ""));
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second, message("slots", "[]"));
    }

    #[tokio::test]
    async fn test_reader_close_mid_frame_is_incomplete() {
        let mut reader = reader(vec![Step::Data(b"PyON 1 topology\n{")]);
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(err, FrameError::Incomplete { buffered: 1 }));
    }
}
