//! Stdout frame reassembly
//!
//! Child processes write to stdout in arbitrary chunks and often mix log
//! lines with protocol messages. [`FrameBuffer`] accepts raw chunks and
//! yields each complete JSON value exactly once, plus any non-JSON text
//! lines so callers can log them. Both newline-delimited and pretty-printed
//! (brace-balanced, multi-line) JSON are handled; a trailing partial frame
//! stays buffered until more bytes arrive.

use serde_json::Value;

/// Default cap on buffered bytes without a complete frame.
const DEFAULT_MAX_PENDING: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    /// A non-JSON line (log noise)
    Text(String),
}

#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_pending: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_pending,
        }
    }

    /// Append a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drain every complete frame currently buffered.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let consumed = self.scan(&mut frames);
        self.buf.drain(..consumed);

        if self.buf.len() > self.max_pending {
            frames.push(Frame::Text(format!(
                "<discarded {} bytes without a complete frame>",
                self.buf.len()
            )));
            self.buf.clear();
        }
        frames
    }

    /// Drain at end of stream: whatever is left becomes a final frame.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = self.drain();
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim();
        if !text.is_empty() {
            match serde_json::from_str(text) {
                Ok(value) => frames.push(Frame::Json(value)),
                Err(_) => frames.push(Frame::Text(text.to_string())),
            }
        }
        frames
    }

    /// Walk the buffer, pushing frames; returns how many bytes were consumed.
    fn scan(&self, frames: &mut Vec<Frame>) -> usize {
        let buf = &self.buf;
        let mut pos = 0;

        loop {
            while pos < buf.len() && buf[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos >= buf.len() {
                return pos;
            }

            let rest = &buf[pos..];
            if is_open(rest[0]) {
                match balanced_end(rest) {
                    Some(end) => {
                        match serde_json::from_slice::<Value>(&rest[..end]) {
                            Ok(value) => frames.push(Frame::Json(value)),
                            Err(_) => push_text(frames, &rest[..end]),
                        }
                        pos += end;
                    }
                    None => match resync_point(rest) {
                        // An unbalanced bracket in log noise; a complete frame
                        // starts on a later line.
                        Some(skip) => {
                            push_text(frames, &rest[..skip]);
                            pos += skip;
                        }
                        None => return pos,
                    },
                }
                continue;
            }

            // Noise runs to the end of the line or to the next bracket.
            let newline = rest.iter().position(|b| *b == b'\n');
            let bracket = rest.iter().position(|b| is_open(*b));
            match (newline, bracket) {
                (Some(nl), Some(br)) if br < nl => {
                    push_text(frames, &rest[..br]);
                    pos += br;
                }
                (Some(nl), _) => {
                    push_text(frames, &rest[..nl]);
                    pos += nl + 1;
                }
                (None, Some(br)) => {
                    push_text(frames, &rest[..br]);
                    pos += br;
                }
                (None, None) => return pos,
            }
        }
    }
}

fn is_open(b: u8) -> bool {
    b == b'{' || b == b'['
}

fn push_text(frames: &mut Vec<Frame>, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if !text.is_empty() {
        frames.push(Frame::Text(text.to_string()));
    }
}

/// Index just past the bracket that closes `bytes[0]`, ignoring brackets in strings.
fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Offset of the first later line that begins (at column 0) with a complete JSON value.
fn resync_point(bytes: &[u8]) -> Option<usize> {
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i + 1)
        .find(|&start| {
            let line = &bytes[start..];
            !line.is_empty()
                && is_open(line[0])
                && balanced_end(line)
                    .map_or(false, |end| serde_json::from_slice::<Value>(&line[..end]).is_ok())
        })
}
