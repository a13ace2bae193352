//! MJPEG byte-stream framing.
//!
//! The decoder child writes concatenated JPEGs to its stdout. The framer
//! scans that stream for SOI/EOI marker pairs and hands out complete JPEG
//! buffers, keeping any trailing bytes for the next frame. Memory is
//! bounded: the pre-SOI scan window is truncated and an oversized frame
//! resets the buffer entirely.

use std::io::Read;
use std::time::{Duration, Instant};

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

const READ_CHUNK: usize = 8 * 1024;
const FRAME_BUF_CAPACITY: usize = 64 * 1024;
/// Pre-SOI bytes beyond this are truncated to the trailing tail.
const SOI_SCAN_LIMIT: usize = 100_000;
const SOI_KEEP_TAIL: usize = 10_000;
/// A frame that has not closed by this size is abandoned.
const FRAME_HARD_CAP: usize = 200_000;

/// Why a frame could not be produced.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The stream reached end-of-file (or blew the hard size cap).
    #[error("decoder stream ended")]
    StreamEnded,
    /// No SOI marker within the per-frame deadline.
    #[error("timeout finding SOI marker")]
    SoiTimeout,
    /// No EOI marker within the per-frame deadline.
    #[error("timeout finding EOI marker")]
    EoiTimeout,
    /// Read error on the decoder pipe.
    #[error("decoder read error: {0}")]
    Read(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the stream is finished rather than momentarily corrupt.
    pub fn is_stream_end(&self) -> bool {
        matches!(self, FramingError::StreamEnded)
    }
}

/// Incremental framer over a decoder byte stream.
///
/// Buffers are reused across frames; one framer serves one decoder child.
///
/// # Example
/// ```rust
/// use std::io::Cursor;
/// use std::time::Duration;
/// use camgrid_capture::mjpeg::MjpegFramer;
///
/// let stream = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
/// let mut framer = MjpegFramer::new();
/// let jpeg = framer
///     .next_frame(&mut Cursor::new(stream), Duration::from_millis(150))
///     .unwrap();
/// assert_eq!(jpeg, stream);
/// ```
pub struct MjpegFramer {
    chunk: Vec<u8>,
    pending: Vec<u8>,
}

impl MjpegFramer {
    pub fn new() -> Self {
        Self {
            chunk: vec![0u8; READ_CHUNK],
            pending: Vec::with_capacity(FRAME_BUF_CAPACITY),
        }
    }

    /// Discard buffered bytes so the next call resynchronises on a fresh SOI.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Read until one complete JPEG (SOI through EOI inclusive) is available.
    ///
    /// Trailing bytes past the EOI stay buffered for the next call. On
    /// timeout the partial buffer is discarded; on [`FramingError::StreamEnded`]
    /// the caller should respawn or fall back.
    pub fn next_frame(
        &mut self,
        reader: &mut dyn Read,
        deadline: Duration,
    ) -> Result<Vec<u8>, FramingError> {
        let started = Instant::now();

        // Align the buffer on an SOI marker.
        loop {
            if let Some(at) = find_marker(&self.pending, SOI) {
                self.pending.drain(..at);
                break;
            }
            // Bound memory while scanning garbage between frames.
            if self.pending.len() > SOI_SCAN_LIMIT {
                let cut = self.pending.len() - SOI_KEEP_TAIL;
                self.pending.drain(..cut);
            }
            if started.elapsed() > deadline {
                self.pending.clear();
                return Err(FramingError::SoiTimeout);
            }
            self.fill(reader)?;
        }

        // Scan forward for the closing EOI, remembering how far we looked
        // so appended bytes do not trigger a rescan from the start.
        let mut scanned = SOI.len();
        loop {
            if self.pending.len() > scanned {
                let from = scanned.saturating_sub(1).max(SOI.len() - 1);
                if let Some(at) = find_marker(&self.pending[from..], EOI) {
                    let end = from + at + EOI.len();
                    let jpeg = self.pending[..end].to_vec();
                    self.pending.drain(..end);
                    return Ok(jpeg);
                }
                scanned = self.pending.len();
            }
            if started.elapsed() > deadline {
                self.pending.clear();
                return Err(FramingError::EoiTimeout);
            }
            self.fill(reader)?;
            if self.pending.len() > FRAME_HARD_CAP {
                // Either the stream is corrupt or this is not MJPEG at all;
                // treat it like a stream end so the worker respawns.
                self.pending.clear();
                return Err(FramingError::StreamEnded);
            }
        }
    }

    fn fill(&mut self, reader: &mut dyn Read) -> Result<(), FramingError> {
        let n = reader.read(&mut self.chunk)?;
        if n == 0 {
            return Err(FramingError::StreamEnded);
        }
        self.pending.extend_from_slice(&self.chunk[..n]);
        Ok(())
    }
}

impl Default for MjpegFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DEADLINE: Duration = Duration::from_millis(150);

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut buf = SOI.to_vec();
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&EOI);
        buf
    }

    #[test]
    fn frames_a_single_jpeg() {
        let frame = jpeg(&[1, 2, 3]);
        let mut framer = MjpegFramer::new();
        let out = framer
            .next_frame(&mut Cursor::new(frame.clone()), DEADLINE)
            .unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn skips_garbage_before_soi() {
        let mut stream = vec![0x00, 0x11, 0xFF, 0x22];
        let frame = jpeg(&[9, 9]);
        stream.extend_from_slice(&frame);
        let mut framer = MjpegFramer::new();
        let out = framer.next_frame(&mut Cursor::new(stream), DEADLINE).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn keeps_trailing_bytes_for_the_next_frame() {
        let first = jpeg(&[1]);
        let second = jpeg(&[2]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let mut cursor = Cursor::new(stream);
        let mut framer = MjpegFramer::new();
        assert_eq!(framer.next_frame(&mut cursor, DEADLINE).unwrap(), first);
        // Second frame is already fully buffered; EOF on the reader must
        // not matter.
        assert_eq!(framer.next_frame(&mut cursor, DEADLINE).unwrap(), second);
    }

    #[test]
    fn reassembles_a_frame_split_across_reads() {
        struct TwoPart(Vec<Vec<u8>>);
        impl Read for TwoPart {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.0.pop() {
                    Some(part) => {
                        buf[..part.len()].copy_from_slice(&part);
                        Ok(part.len())
                    }
                    None => Ok(0),
                }
            }
        }
        let frame = jpeg(&[5; 100]);
        let (a, b) = frame.split_at(40);
        let mut reader = TwoPart(vec![b.to_vec(), a.to_vec()]);
        let mut framer = MjpegFramer::new();
        assert_eq!(framer.next_frame(&mut reader, DEADLINE).unwrap(), frame);
    }

    #[test]
    fn eof_reports_stream_ended() {
        let mut framer = MjpegFramer::new();
        let err = framer
            .next_frame(&mut Cursor::new(Vec::new()), DEADLINE)
            .unwrap_err();
        assert!(err.is_stream_end());
    }

    #[test]
    fn oversized_frame_resets_and_reports_stream_end() {
        // An SOI that never closes: hard cap must fire, not the deadline.
        let mut stream = SOI.to_vec();
        stream.extend(std::iter::repeat(0x00).take(FRAME_HARD_CAP + READ_CHUNK));
        let mut framer = MjpegFramer::new();
        let err = framer
            .next_frame(&mut Cursor::new(stream), Duration::from_secs(30))
            .unwrap_err();
        assert!(err.is_stream_end());
    }

    #[test]
    fn soi_timeout_on_a_dribbling_stream() {
        struct Dribble;
        impl Read for Dribble {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                buf[0] = 0x00;
                Ok(1)
            }
        }
        let mut framer = MjpegFramer::new();
        let err = framer
            .next_frame(&mut Dribble, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, FramingError::SoiTimeout));
    }

    #[test]
    fn eoi_timeout_after_soi() {
        struct SoiThenDribble(bool);
        impl Read for SoiThenDribble {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if !self.0 {
                    self.0 = true;
                    buf[..2].copy_from_slice(&SOI);
                    Ok(2)
                } else {
                    buf[0] = 0x00;
                    Ok(1)
                }
            }
        }
        let mut framer = MjpegFramer::new();
        let err = framer
            .next_frame(&mut SoiThenDribble(false), Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, FramingError::EoiTimeout));
    }

    #[test]
    fn pre_soi_garbage_is_truncated_to_a_tail() {
        // Garbage larger than the scan limit followed by a real frame; the
        // truncation must not eat the frame that arrives afterwards.
        let mut stream = vec![0xAAu8; SOI_SCAN_LIMIT + 5_000];
        let frame = jpeg(&[7; 10]);
        stream.extend_from_slice(&frame);
        let mut framer = MjpegFramer::new();
        let out = framer
            .next_frame(&mut Cursor::new(stream), Duration::from_secs(30))
            .unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn marker_split_across_chunk_boundary_is_found() {
        // 0xFF as the last byte of one read, 0xD9 first of the next.
        struct Split(Vec<Vec<u8>>);
        impl Read for Split {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.0.pop() {
                    Some(part) => {
                        buf[..part.len()].copy_from_slice(&part);
                        Ok(part.len())
                    }
                    None => Ok(0),
                }
            }
        }
        let mut first = SOI.to_vec();
        first.extend_from_slice(&[1, 2, 3, 0xFF]);
        let second = vec![0xD9];
        let mut reader = Split(vec![second, first]);
        let mut framer = MjpegFramer::new();
        let out = framer.next_frame(&mut reader, DEADLINE).unwrap();
        assert_eq!(out, jpeg(&[1, 2, 3]));
    }
}
