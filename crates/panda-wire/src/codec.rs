//! `Content-Length` framing.
//!
//! Frames use the HTTP-like header section shared by DAP and LSP:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```
//!
//! Decoding is incremental: [`FrameCodec::feed`] accepts whatever the socket
//! produced and yields every message that is complete so far.

use std::iter::FusedIterator;

use serde::Serialize;
use serde_json::Value;

/// Maximum accepted body size (in bytes).
///
/// Bodies announcing more than this are skipped without being buffered, so a
/// hostile or corrupted `Content-Length` cannot force a huge allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Maximum size of the header section before the `\r\n\r\n` separator.
pub const MAX_HEADER_BYTES: usize = 8 * 1024; // 8 KiB

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Serialize `message` as JSON and frame it.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    Ok(encode_raw(&body))
}

/// Frame an already serialized JSON body.
pub fn encode_raw(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

#[derive(Debug)]
pub struct FrameCodec {
    buf: Vec<u8>,
    /// Body bytes of an oversized frame that still have to be thrown away.
    skip: usize,
    /// Prefix of `buf` already searched for the header terminator.
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            skip: 0,
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Append `chunk` and iterate over the messages that are now complete.
    ///
    /// The iterator is lazy: bytes of messages it has not yielded stay
    /// buffered, and [`FrameCodec::frames`] picks up where it stopped.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        self.frames()
    }

    /// Iterate over complete messages without adding input.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { codec: self }
    }

    /// Number of bytes retained for the next call.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.scanned = 0;
    }

    fn next_value(&mut self) -> Option<Value> {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                self.consume(n);
                self.skip -= n;
                if self.skip > 0 {
                    return None;
                }
            }

            let Some(header_end) = self.find_header_end() else {
                self.bound_header();
                return None;
            };
            let body_start = header_end + HEADER_TERMINATOR.len();

            let Some(len) = parse_content_length(&self.buf[..header_end]) else {
                tracing::debug!(
                    target: "panda.wire",
                    header_len = header_end,
                    "discarding frame header without a usable Content-Length"
                );
                self.consume(body_start);
                continue;
            };

            if len > self.max_frame_bytes {
                tracing::warn!(
                    target: "panda.wire",
                    len,
                    max = self.max_frame_bytes,
                    "skipping frame that exceeds the maximum frame size"
                );
                self.consume(body_start);
                self.skip = len;
                continue;
            }

            let frame_end = body_start + len;
            if self.buf.len() < frame_end {
                return None;
            }

            let decoded = serde_json::from_slice::<Value>(&self.buf[body_start..frame_end]);
            self.consume(frame_end);
            match decoded {
                Ok(value) => return Some(value),
                Err(err) => {
                    tracing::debug!(
                        target: "panda.wire",
                        len,
                        error = %err,
                        "dropping frame with undecodable body"
                    );
                }
            }
        }
    }

    fn find_header_end(&mut self) -> Option<usize> {
        // Re-check the last few bytes in case a terminator straddles two chunks.
        let from = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let found = self.buf[from..]
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
            .map(|pos| from + pos);
        if found.is_none() {
            self.scanned = self.buf.len();
        }
        found
    }

    fn bound_header(&mut self) {
        if self.buf.len() <= MAX_HEADER_BYTES {
            return;
        }
        // Keep a possible partial terminator.
        let discard = self.buf.len() - (HEADER_TERMINATOR.len() - 1);
        tracing::warn!(
            target: "panda.wire",
            discarded = discard,
            "discarding header section that exceeds the maximum header size"
        );
        self.consume(discard);
    }
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;
    header.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("Content-Length") {
            return None;
        }
        value.trim().parse::<usize>().ok()
    })
}

/// Messages decoded from a [`FrameCodec`] buffer.
pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
}

impl Iterator for Frames<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.codec.next_value()
    }
}

impl FusedIterator for Frames<'_> {}
