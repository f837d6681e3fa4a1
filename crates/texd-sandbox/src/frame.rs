// SPDX-License-Identifier: MIT OR Apache-2.0
//! Demultiplexing of the sandbox's combined output stream.
//!
//! When a container runs without a TTY the daemon interleaves stdout and
//! stderr on one connection as framed chunks: an 8-byte header (stream
//! byte, three zero bytes, payload length as a big-endian `u32`) followed
//! by the payload. [`FrameDecoder`] reassembles frames from arbitrarily
//! split byte chunks; [`LineAssembler`] turns payload bytes into whole
//! lines, buffering partials until a newline or end of stream.

/// Frame header length: stream byte, 3 padding bytes, u32 BE length.
pub const HEADER_LEN: usize = 8;

/// Which logical stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard input echo (rare; emitted by some runtimes).
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One demultiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical stream the payload belongs to.
    pub kind: StreamKind,
    /// Raw payload bytes (header stripped).
    pub payload: Vec<u8>,
}

/// Incremental decoder for the framed stream.
///
/// Feed it chunks as they arrive; it returns every frame completed by the
/// chunk and buffers the rest. Bytes that do not form a valid header are
/// skipped one at a time so a corrupt prefix cannot wedge the decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning all frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let kind = StreamKind::from_byte(self.buf[0]);
            let padded = self.buf[1] == 0 && self.buf[2] == 0 && self.buf[3] == 0;
            let Some(kind) = kind.filter(|_| padded) else {
                // Not a header; drop one byte and resync.
                self.buf.remove(0);
                continue;
            };
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..HEADER_LEN + len);
            frames.push(Frame { kind, payload });
        }
        frames
    }

    /// Bytes buffered awaiting a complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Turns payload bytes into whole lines.
///
/// Lines are split on `\n`; a trailing `\r` is stripped so CRLF output
/// reads cleanly. Invalid UTF-8 is replaced, never dropped.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed payload bytes, returning every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                lines.push(take_line(&mut self.partial));
            } else {
                self.partial.push(b);
            }
        }
        lines
    }

    /// Flush the trailing partial line at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(take_line(&mut self.partial))
        }
    }
}

fn take_line(partial: &mut Vec<u8>) -> String {
    if partial.last() == Some(&b'\r') {
        partial.pop();
    }
    let line = String::from_utf8_lossy(partial).into_owned();
    partial.clear();
    line
}

/// Convenience pipeline: framed bytes in, whole lines out.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    decoder: FrameDecoder,
    lines: LineAssembler,
}

impl LogDemuxer {
    /// Create an empty demuxer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw framed bytes, returning completed log lines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for frame in self.decoder.push(chunk) {
            out.extend(self.lines.push(&frame.payload));
        }
        out
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.lines.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![kind, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_frame_decodes() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&frame(1, b"hello"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut dec = FrameDecoder::new();
        let mut bytes = frame(1, b"out");
        bytes.extend(frame(2, b"err"));
        let frames = dec.push(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(frames[1].kind, StreamKind::Stderr);
    }

    #[test]
    fn frame_split_mid_header() {
        let mut dec = FrameDecoder::new();
        let bytes = frame(1, b"split");
        assert!(dec.push(&bytes[..3]).is_empty());
        assert!(dec.push(&bytes[3..6]).is_empty());
        let frames = dec.push(&bytes[6..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"split");
    }

    #[test]
    fn frame_split_mid_payload() {
        let mut dec = FrameDecoder::new();
        let bytes = frame(2, b"abcdefgh");
        assert!(dec.push(&bytes[..10]).is_empty());
        let frames = dec.push(&bytes[10..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"abcdefgh");
    }

    #[test]
    fn empty_payload_frame() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&frame(1, b""));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn corrupt_prefix_resyncs() {
        let mut dec = FrameDecoder::new();
        let mut bytes = vec![0xff, 0x07, 0x99];
        bytes.extend(frame(1, b"recovered"));
        let frames = dec.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"recovered");
    }

    #[test]
    fn assembler_splits_lines() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"one\ntwo\nthr");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        let lines = asm.push(b"ee\n");
        assert_eq!(lines, vec!["three".to_string()]);
        assert!(asm.finish().is_none());
    }

    #[test]
    fn assembler_flushes_partial_at_eof() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"no newline").is_empty());
        assert_eq!(asm.finish().as_deref(), Some("no newline"));
        assert!(asm.finish().is_none());
    }

    #[test]
    fn assembler_strips_carriage_returns() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"dos line\r\nunix line\n");
        assert_eq!(lines, vec!["dos line".to_string(), "unix line".to_string()]);
    }

    #[test]
    fn assembler_replaces_invalid_utf8() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"bad \xff byte\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains('\u{fffd}'));
    }

    #[test]
    fn empty_lines_are_preserved() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"a\n\nb\n");
        assert_eq!(lines, vec!["a".to_string(), String::new(), "b".to_string()]);
    }

    #[test]
    fn demuxer_joins_lines_across_frames() {
        let mut demux = LogDemuxer::new();
        let mut bytes = frame(1, b"This is pdfTeX");
        bytes.extend(frame(1, b", Version 3.14\nOutput "));
        let lines = demux.push(&bytes);
        assert_eq!(lines, vec!["This is pdfTeX, Version 3.14".to_string()]);
        assert_eq!(demux.finish().as_deref(), Some("Output "));
    }

    #[test]
    fn demuxer_interleaves_streams_in_arrival_order() {
        let mut demux = LogDemuxer::new();
        let mut bytes = frame(1, b"stdout line\n");
        bytes.extend(frame(2, b"stderr line\n"));
        let lines = demux.push(&bytes);
        assert_eq!(
            lines,
            vec!["stdout line".to_string(), "stderr line".to_string()]
        );
    }
}
