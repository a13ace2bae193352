use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::frame::Frame;
use crate::now_nanos;

/// Latest-frame surface: single writer, any number of readers.
///
/// Two frame slots are swapped behind atomic indices so the writer never
/// overwrites the slot a reader is looking at, and a monotonic sequence
/// counter lets readers detect new publications without blocking. Old
/// frames are overwritten on each publication; there is no queue and
/// publication always succeeds.
///
/// The `dropped` counter is advisory: the surface itself never drops
/// anything, downstream components increment it when they discard frames.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use camgrid_core::prelude::*;
/// use image::{DynamicImage, RgbaImage};
///
/// let surface = FrameSurface::new();
/// assert!(surface.read_if_new(0).is_none());
///
/// surface.publish(Arc::new(Frame::new(DynamicImage::ImageRgba8(
///     RgbaImage::new(2, 2),
/// ))));
/// let (_frame, seq) = surface.read_if_new(0).expect("new frame");
/// assert_eq!(seq, 1);
/// assert!(surface.read_if_new(seq).is_none());
/// ```
pub struct FrameSurface {
    slots: [RwLock<Option<Arc<Frame>>>; 2],
    write_index: AtomicUsize,
    read_index: AtomicUsize,
    sequence: AtomicU64,
    last_frame_nanos: AtomicU64,
    dropped: AtomicU64,
}

impl FrameSurface {
    /// Create an empty surface.
    pub fn new() -> Self {
        Self {
            slots: [RwLock::new(None), RwLock::new(None)],
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(1),
            sequence: AtomicU64::new(0),
            last_frame_nanos: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish a frame, overwriting whatever the previous publication left.
    ///
    /// Called only by the owning capture worker. Never blocks on readers:
    /// the write slot is by construction not the slot readers index into.
    pub fn publish(&self, frame: Arc<Frame>) {
        let write = self.write_index.load(Ordering::Relaxed);
        *self.slots[write].write() = Some(frame);
        // Swap the indices, then bump the sequence so a reader that
        // observes the new sequence also observes the new read index.
        self.write_index.store(1 - write, Ordering::Relaxed);
        self.read_index.store(write, Ordering::Release);
        self.sequence.fetch_add(1, Ordering::Release);
        self.last_frame_nanos.store(now_nanos(), Ordering::Release);
    }

    /// Most recent frame and its sequence number, if any was published.
    ///
    /// The retry loop guarantees the returned frame is the one published at
    /// the returned sequence even if a publication raced the read.
    pub fn latest(&self) -> Option<(Arc<Frame>, u64)> {
        loop {
            let seq = self.sequence.load(Ordering::Acquire);
            if seq == 0 {
                return None;
            }
            let read = self.read_index.load(Ordering::Acquire);
            let frame = self.slots[read].read().clone();
            if self.sequence.load(Ordering::Acquire) == seq {
                return frame.map(|f| (f, seq));
            }
        }
    }

    /// Return the latest frame only if it is newer than `last_seen`.
    ///
    /// Non-blocking and allocation-free (the `Arc` is cloned). Repeated
    /// calls with the same `last_seen` keep answering `None` until the next
    /// publication.
    pub fn read_if_new(&self, last_seen: u64) -> Option<(Arc<Frame>, u64)> {
        if self.sequence.load(Ordering::Acquire) <= last_seen {
            return None;
        }
        self.latest()
    }

    /// Current sequence number (0 before the first publication).
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Timestamp of the last publication in nanoseconds since the epoch,
    /// or 0 if nothing was published yet.
    pub fn last_frame_nanos(&self) -> u64 {
        self.last_frame_nanos.load(Ordering::Acquire)
    }

    /// Reset the last-frame timestamp to now.
    ///
    /// Used after a worker restart so the stale detector does not
    /// immediately re-trigger on the pre-restart timestamp.
    pub fn touch_last_frame(&self) {
        self.last_frame_nanos.store(now_nanos(), Ordering::Release);
    }

    /// Record a frame discarded downstream of this surface.
    pub fn mark_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames discarded downstream of this surface.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop the held frames and statistics.
    ///
    /// The sequence counter is preserved so readers' `last_seen` values
    /// stay valid across a reset.
    pub fn reset(&self) {
        *self.slots[0].write() = None;
        *self.slots[1].write() = None;
        self.last_frame_nanos.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

impl Default for FrameSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn frame(w: u32, h: u32) -> Arc<Frame> {
        Arc::new(Frame::new(DynamicImage::ImageRgba8(RgbaImage::new(w, h))))
    }

    #[test]
    fn empty_surface_has_nothing_to_read() {
        let surface = FrameSurface::new();
        assert!(surface.latest().is_none());
        assert!(surface.read_if_new(0).is_none());
        assert_eq!(surface.sequence(), 0);
        assert_eq!(surface.last_frame_nanos(), 0);
    }

    #[test]
    fn sequence_advances_monotonically() {
        let surface = FrameSurface::new();
        let mut last_seen = 0;
        for i in 1..=5 {
            surface.publish(frame(i, i));
            let (f, seq) = surface.read_if_new(last_seen).expect("new frame");
            assert!(seq > last_seen);
            assert_eq!(seq, u64::from(i));
            assert_eq!(f.width(), i);
            last_seen = seq;
        }
    }

    #[test]
    fn read_if_new_is_stable_between_publications() {
        let surface = FrameSurface::new();
        surface.publish(frame(2, 2));
        let (_, seq) = surface.read_if_new(0).unwrap();
        assert!(surface.read_if_new(seq).is_none());
        assert!(surface.read_if_new(seq).is_none());
        surface.publish(frame(3, 3));
        let (f, seq2) = surface.read_if_new(seq).unwrap();
        assert_eq!(seq2, seq + 1);
        assert_eq!(f.width(), 3);
    }

    #[test]
    fn latest_always_returns_newest_publication() {
        let surface = FrameSurface::new();
        surface.publish(frame(1, 1));
        surface.publish(frame(2, 2));
        surface.publish(frame(3, 3));
        let (f, seq) = surface.latest().unwrap();
        assert_eq!(seq, 3);
        assert_eq!(f.width(), 3);
    }

    #[test]
    fn publication_stamps_last_frame_time() {
        let surface = FrameSurface::new();
        surface.publish(frame(1, 1));
        assert!(surface.last_frame_nanos() > 0);
    }

    #[test]
    fn dropped_counter_is_advisory() {
        let surface = FrameSurface::new();
        surface.mark_dropped();
        surface.mark_dropped();
        assert_eq!(surface.dropped(), 2);
    }

    #[test]
    fn reset_preserves_sequence() {
        let surface = FrameSurface::new();
        surface.publish(frame(1, 1));
        surface.publish(frame(2, 2));
        surface.reset();
        assert_eq!(surface.sequence(), 2);
        assert_eq!(surface.last_frame_nanos(), 0);
        // A reader at last_seen=0 sees "new" but there is no frame to hand
        // out until the next publication.
        assert!(surface.latest().is_none());
        surface.publish(frame(4, 4));
        let (f, seq) = surface.latest().unwrap();
        assert_eq!(seq, 3);
        assert_eq!(f.width(), 4);
    }
}
