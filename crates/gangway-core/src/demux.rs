//! Demultiplexing of container runtime output streams.
//!
//! The runtime's attached exec stream is either multiplexed — an 8-byte
//! header per frame (stream type, three zero bytes, u32 big-endian payload
//! length) followed by the payload — or plain unframed text when the exec
//! was allocated a TTY. The decoder classifies the stream from its first
//! header, parses frames into channel-tagged text chunks, and recovers from
//! corrupted headers by scanning forward for the next parseable one.
//!
//! The decoder core is sans-io: [`FrameDecoder::push`] accepts bytes and
//! returns whatever chunks became parseable, [`FrameDecoder::finish`] flushes
//! the residue. [`demux_stream`] and [`demux_logs`] adapt the decoders onto a
//! [`ByteStream`].

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::DemuxConfig;
use crate::error::{GangwayError, Result};
use crate::runtime::ByteStream;

/// Frame header length: 1 type byte, 3 zero bytes, 4 length bytes.
const HEADER_LEN: usize = 8;

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
}

/// One channel-tagged piece of decoded output.
///
/// Transient: flows straight from the decoder to response emission, never
/// persisted. The timestamp is capture time, except for log lines carrying
/// their own RFC3339 prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemuxedChunk {
    pub channel: Channel,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl DemuxedChunk {
    fn now(channel: Channel, data: impl Into<String>) -> Self {
        Self {
            channel,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Not enough evidence yet to classify the stream.
    Undetermined,
    /// Header-framed multiplexed stream.
    Framed,
    /// Plain text; everything is stdout.
    Unframed,
}

/// Sans-io decoder for a (possibly) multiplexed byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    mode: Mode,
    chunk_size: usize,
    max_buffer_bytes: usize,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(cfg: &DemuxConfig) -> Self {
        Self {
            buf: BytesMut::new(),
            mode: Mode::Undetermined,
            chunk_size: cfg.chunk_size.max(1),
            max_buffer_bytes: cfg.max_buffer_bytes,
            max_frame_bytes: cfg.max_frame_bytes,
        }
    }

    /// Feed bytes in; get back every chunk that became parseable.
    ///
    /// Fails with [`GangwayError::StreamCorrupt`] if the internal buffer
    /// would exceed the configured ceiling without draining — the bound on
    /// memory under a broken or malicious upstream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxedChunk>> {
        self.buf.extend_from_slice(data);

        let chunks = self.drain(false);

        if self.buf.len() > self.max_buffer_bytes {
            return Err(GangwayError::StreamCorrupt {
                buffered: self.buf.len(),
                limit: self.max_buffer_bytes,
            });
        }
        Ok(chunks)
    }

    /// Flush whatever remains at end of stream as one final stdout chunk.
    pub fn finish(&mut self) -> Vec<DemuxedChunk> {
        let mut chunks = self.drain(true);
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            chunks.push(DemuxedChunk::now(
                Channel::Stdout,
                String::from_utf8_lossy(&rest),
            ));
        }
        chunks
    }

    fn drain(&mut self, at_end: bool) -> Vec<DemuxedChunk> {
        let mut chunks = Vec::new();

        if self.mode == Mode::Undetermined {
            if self.buf.len() < HEADER_LEN && !at_end {
                return chunks;
            }
            self.mode = self.classify();
        }

        match self.mode {
            Mode::Unframed => {
                while !self.buf.is_empty() {
                    let take = utf8_cut(&self.buf, self.chunk_size);
                    let piece = self.buf.split_to(take);
                    chunks.push(DemuxedChunk::now(
                        Channel::Stdout,
                        String::from_utf8_lossy(&piece),
                    ));
                }
            }
            Mode::Framed => self.drain_framed(&mut chunks),
            Mode::Undetermined => {}
        }

        chunks
    }

    /// Classify from the first header, cross-validating a second one at the
    /// position the first frame's declared length implies when enough bytes
    /// are buffered. One consistent header alone is accepted as evidence.
    fn classify(&self) -> Mode {
        let Some(len) = self.parse_header(0) else {
            return Mode::Unframed;
        };
        let second_at = HEADER_LEN + len;
        if self.buf.len() >= second_at + HEADER_LEN && self.parse_header(second_at).is_none() {
            return Mode::Unframed;
        }
        Mode::Framed
    }

    /// Declared payload length if a valid header starts at `offset`.
    fn parse_header(&self, offset: usize) -> Option<usize> {
        if self.buf.len() < offset + HEADER_LEN {
            return None;
        }
        let h = &self.buf[offset..offset + HEADER_LEN];
        if !matches!(h[0], 1 | 2) || h[1] != 0 || h[2] != 0 || h[3] != 0 {
            return None;
        }
        let len = u32::from_be_bytes([h[4], h[5], h[6], h[7]]) as usize;
        (len <= self.max_frame_bytes).then_some(len)
    }

    fn drain_framed(&mut self, chunks: &mut Vec<DemuxedChunk>) {
        loop {
            if self.buf.len() < HEADER_LEN {
                return;
            }

            match self.parse_header(0) {
                Some(len) => {
                    if self.buf.len() < HEADER_LEN + len {
                        // Incomplete trailing frame; wait for more bytes.
                        return;
                    }
                    let channel = if self.buf[0] == 2 {
                        Channel::Stderr
                    } else {
                        Channel::Stdout
                    };
                    self.buf.advance(HEADER_LEN);
                    let payload = self.buf.split_to(len);
                    let mut rest = &payload[..];
                    while !rest.is_empty() {
                        let take = utf8_cut(rest, self.chunk_size);
                        let (piece, tail) = rest.split_at(take);
                        chunks.push(DemuxedChunk::now(
                            channel,
                            String::from_utf8_lossy(piece),
                        ));
                        rest = tail;
                    }
                }
                None => {
                    // Corrupt header: scan forward for the next valid one and
                    // emit the skipped span verbatim (recovery, not failure).
                    match self.scan_for_header() {
                        Some(skip) => {
                            let skipped = self.buf.split_to(skip);
                            chunks.push(DemuxedChunk::now(
                                Channel::Stdout,
                                String::from_utf8_lossy(&skipped),
                            ));
                        }
                        None => {
                            // No header anywhere: the rest of the stream is
                            // treated as plain text from here on.
                            let rest = self.buf.split();
                            chunks.push(DemuxedChunk::now(
                                Channel::Stdout,
                                String::from_utf8_lossy(&rest),
                            ));
                            self.mode = Mode::Unframed;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Offset of the next valid header strictly after position 0.
    fn scan_for_header(&self) -> Option<usize> {
        (1..self.buf.len().saturating_sub(HEADER_LEN - 1))
            .find(|&i| self.parse_header(i).is_some())
    }
}

/// Sans-io decoder for newline-delimited log output.
///
/// Each line may carry an RFC3339 timestamp prefix followed by whitespace;
/// when present it becomes the chunk timestamp and is stripped from the
/// data. Partial trailing lines are buffered across pushes.
#[derive(Debug)]
pub struct LogDecoder {
    buf: BytesMut,
    chunk_size: usize,
    max_buffer_bytes: usize,
}

impl LogDecoder {
    pub fn new(cfg: &DemuxConfig) -> Self {
        Self {
            buf: BytesMut::new(),
            chunk_size: cfg.chunk_size.max(1),
            max_buffer_bytes: cfg.max_buffer_bytes,
        }
    }

    /// Feed bytes in; get back a chunk per completed line.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxedChunk>> {
        self.buf.extend_from_slice(data);

        let mut chunks = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            self.emit_line(&line, &mut chunks);
        }

        if self.buf.len() > self.max_buffer_bytes {
            return Err(GangwayError::StreamCorrupt {
                buffered: self.buf.len(),
                limit: self.max_buffer_bytes,
            });
        }
        Ok(chunks)
    }

    /// Emit the unterminated trailing line, if any.
    pub fn finish(&mut self) -> Vec<DemuxedChunk> {
        let mut chunks = Vec::new();
        if !self.buf.is_empty() {
            let line = self.buf.split();
            self.emit_line(&line, &mut chunks);
        }
        chunks
    }

    fn emit_line(&self, raw: &[u8], chunks: &mut Vec<DemuxedChunk>) {
        let text = String::from_utf8_lossy(raw);
        let (timestamp, data) = split_log_timestamp(&text);

        let mut rest = data;
        loop {
            let take = utf8_cut(rest.as_bytes(), self.chunk_size);
            let (piece, tail) = rest.split_at(take);
            chunks.push(DemuxedChunk {
                channel: Channel::Stdout,
                data: piece.to_string(),
                timestamp,
            });
            if tail.is_empty() {
                break;
            }
            rest = tail;
        }
    }
}

/// Cut point for the next emitted chunk: at most `limit` bytes, never
/// splitting a UTF-8 sequence. When no boundary exists at or before the
/// limit the cut advances to the next one, so a single character wider
/// than the limit is taken whole.
fn utf8_cut(data: &[u8], limit: usize) -> usize {
    if limit >= data.len() {
        return data.len();
    }
    let is_continuation = |b: u8| b & 0xC0 == 0x80;
    let mut cut = limit;
    while cut > 0 && is_continuation(data[cut]) {
        cut -= 1;
    }
    if cut > 0 {
        return cut;
    }
    let mut cut = limit;
    while cut < data.len() && is_continuation(data[cut]) {
        cut += 1;
    }
    cut
}

/// Split an optional leading RFC3339 timestamp off a log line.
fn split_log_timestamp(line: &str) -> (DateTime<Utc>, &str) {
    if let Some((first, rest)) = line.split_once(char::is_whitespace) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(first) {
            return (ts.with_timezone(&Utc), rest);
        }
    }
    (Utc::now(), line)
}

struct DemuxState<D> {
    source: ByteStream,
    decoder: D,
    pending: VecDeque<DemuxedChunk>,
    done: bool,
}

/// Turn a raw runtime byte stream into a lazy sequence of channel-tagged
/// chunks. Finite; not restartable.
pub fn demux_stream(
    source: ByteStream,
    cfg: &DemuxConfig,
) -> impl Stream<Item = Result<DemuxedChunk>> + Send {
    let decoder = FrameDecoder::new(cfg);
    drive(DemuxState {
        source,
        decoder,
        pending: VecDeque::new(),
        done: false,
    })
}

/// Turn a raw log byte stream into a lazy sequence of timestamped lines.
pub fn demux_logs(
    source: ByteStream,
    cfg: &DemuxConfig,
) -> impl Stream<Item = Result<DemuxedChunk>> + Send {
    let decoder = LogDecoder::new(cfg);
    drive(DemuxState {
        source,
        decoder,
        pending: VecDeque::new(),
        done: false,
    })
}

/// Shared push/finish contract of the two decoders.
trait ChunkDecoder: Send {
    fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxedChunk>>;
    fn finish(&mut self) -> Vec<DemuxedChunk>;
}

impl ChunkDecoder for FrameDecoder {
    fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxedChunk>> {
        FrameDecoder::push(self, data)
    }
    fn finish(&mut self) -> Vec<DemuxedChunk> {
        FrameDecoder::finish(self)
    }
}

impl ChunkDecoder for LogDecoder {
    fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxedChunk>> {
        LogDecoder::push(self, data)
    }
    fn finish(&mut self) -> Vec<DemuxedChunk> {
        LogDecoder::finish(self)
    }
}

fn drive<D: ChunkDecoder + 'static>(
    state: DemuxState<D>,
) -> impl Stream<Item = Result<DemuxedChunk>> + Send {
    futures::stream::unfold(Some(state), |state| async move {
        let mut st = state?;
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), Some(st)));
            }
            if st.done {
                return None;
            }
            match st.source.next().await {
                Some(Ok(bytes)) => match st.decoder.push(&bytes) {
                    Ok(chunks) => st.pending.extend(chunks),
                    // Corruption ends the stream after this error item.
                    Err(err) => return Some((Err(err), None)),
                },
                Some(Err(err)) => {
                    return Some((Err(GangwayError::runtime(err.to_string())), None))
                }
                None => {
                    st.done = true;
                    let tail = st.decoder.finish();
                    st.pending.extend(tail);
                }
            }
        }
    })
}
