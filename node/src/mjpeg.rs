//! Motion-JPEG demultiplexing and multipart framing.
//!
//! `rpicam-vid --codec mjpeg -o -` writes back-to-back JPEG images with no
//! container.  [`MjpegFrames`] cuts that byte stream at SOI/EOI markers;
//! [`multipart_part`] wraps each frame for a `multipart/x-mixed-replace`
//! HTTP response.

use std::io::{ErrorKind, Read};

use bytes::Bytes;
use tracing::debug;

/// Start-of-image marker.
const SOI: [u8; 2] = [0xff, 0xd8];
/// End-of-image marker.
const EOI: [u8; 2] = [0xff, 0xd9];

const READ_CHUNK: usize = 64 * 1024;

/// Largest frame kept while waiting for its end marker.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Multipart boundary used by every live feed.
pub const BOUNDARY: &str = "frame";

/// Iterator of JPEG frames read from a raw MJPEG byte stream.
///
/// Ends when the source reaches EOF or fails; a trailing partial frame is
/// dropped.
pub struct MjpegFrames<R> {
    source: R,
    buf: Vec<u8>,
    chunk: Box<[u8]>,
    done: bool,
}

impl<R: Read> MjpegFrames<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(READ_CHUNK),
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
            done: false,
        }
    }

    /// Try to cut one frame out of the buffer.
    fn next_buffered(&mut self) -> Option<Bytes> {
        let Some(mut start) = find(&self.buf, &SOI, 0) else {
            self.discard();
            return None;
        };

        let end = find(&self.buf, &EOI, start + SOI.len());

        // Entropy-coded data never contains a bare SOI, so a second one
        // before the end marker means the earlier frame was truncated.
        let limit = end.unwrap_or(self.buf.len());
        if let Some(restart) = rfind(&self.buf[..limit], &SOI, start + SOI.len()) {
            debug!("Dropping {} bytes of a truncated frame", restart - start);
            start = restart;
        }

        let Some(end) = end else {
            if self.buf.len() - start > MAX_FRAME_BYTES {
                debug!("No end marker within {MAX_FRAME_BYTES} bytes, resynchronising");
                self.discard();
            } else if start > 0 {
                self.buf.drain(..start);
            }
            return None;
        };

        let frame_end = end + EOI.len();
        let frame = Bytes::copy_from_slice(&self.buf[start..frame_end]);
        self.buf.drain(..frame_end);
        Some(frame)
    }

    /// Drop the buffer, except a lone trailing 0xFF that may be the first
    /// half of a split SOI.
    fn discard(&mut self) {
        let keep_ff = self.buf.last() == Some(&SOI[0]);
        self.buf.clear();
        if keep_ff {
            self.buf.push(SOI[0]);
        }
    }

    fn fill(&mut self) -> bool {
        loop {
            match self.source.read(&mut self.chunk) {
                Ok(0) => return false,
                Ok(n) => {
                    self.buf.extend_from_slice(&self.chunk[..n]);
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("MJPEG source read failed: {e}");
                    return false;
                }
            }
        }
    }
}

impl<R: Read> Iterator for MjpegFrames<R> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        loop {
            if let Some(frame) = self.next_buffered() {
                return Some(frame);
            }
            if !self.fill() {
                self.done = true;
                self.buf.clear();
                return None;
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn rfind(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .rposition(|w| w == needle)
        .map(|pos| pos + from)
}

/// `Content-Type` of a live feed response.
pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

/// Wrap one JPEG frame as a multipart body part.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
