//! Driver-owned ring buffers and their read-only snapshots.
//!
//! Hardware sources deliver audio through a circular buffer the device
//! driver owns and writes. The engine never mutates a ring: each mix cycle
//! takes a [`RingBufferSnapshot`] — payload, clock-to-position mapping, and
//! generation counter — and reads whatever the snapshot says is safe.

use std::sync::{Arc, Mutex, PoisonError};

use crate::format::StreamType;
use crate::timeline::{frames_to_frac, TimelineFunction, TimelineOverflow, TimelineRate, FRAC_ONE};

/// A contiguous readable region of a ring buffer.
///
/// At most two regions cover any frame range (wraparound splits it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRegion {
    /// Absolute frame number of the first frame in this region.
    pub first_frame: i64,
    /// Number of contiguous frames.
    pub frame_count: u32,
    /// Byte offset of the first frame within the ring payload.
    pub byte_offset: usize,
}

/// Read-only view of a driver ring buffer at one instant.
#[derive(Debug, Clone)]
pub struct RingBufferSnapshot {
    payload: Arc<[u8]>,
    frames: u32,
    stream_type: StreamType,
    clock_mono_to_ring_pos: TimelineFunction,
    fence_frames: u32,
    generation: u64,
}

impl RingBufferSnapshot {
    /// The format of the audio in the ring.
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Ring capacity in frames.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Generation of the driver mapping this snapshot was taken from.
    ///
    /// Bumped whenever the driver re-anchors its production timeline, so
    /// consumers can recompute derived transforms lazily.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The mapping from clock-monotonic nanoseconds to the driver's
    /// production position in whole frames.
    pub fn clock_mono_to_ring_pos(&self) -> TimelineFunction {
        self.clock_mono_to_ring_pos
    }

    /// Derives the clock → fractional-source-frame mapping used for
    /// per-link resampling math.
    pub fn clock_mono_to_frac_frames(&self) -> Result<TimelineFunction, TimelineOverflow> {
        let pos = &self.clock_mono_to_ring_pos;
        let frac_rate = TimelineRate::product(
            TimelineRate::new(FRAC_ONE as u64, 1),
            pos.rate(),
        )?;
        Ok(TimelineFunction::new(
            frames_to_frac(pos.subject_time())?,
            pos.reference_time(),
            frac_rate,
        ))
    }

    /// The absolute frame range `[start, end)` that is safe to read at
    /// `now_ns`.
    ///
    /// Frames newer than `produced - fence_frames` may still be in flight;
    /// frames older than `produced - capacity` have been overwritten.
    /// Returns `None` when nothing is safely readable yet.
    pub fn safe_read_range(&self, now_ns: i64) -> Result<Option<(i64, i64)>, TimelineOverflow> {
        let produced = self.clock_mono_to_ring_pos.apply(now_ns)?;
        let end = produced - self.fence_frames as i64;
        let start = (produced - self.frames as i64).max(0);
        if end <= start {
            return Ok(None);
        }
        Ok(Some((start, end)))
    }

    /// Maps an absolute frame range onto 1 or 2 contiguous ring regions.
    ///
    /// The caller is expected to pass a sub-range of
    /// [`safe_read_range`](Self::safe_read_range); frames before zero are
    /// dropped.
    pub fn regions(&self, first_frame: i64, frame_count: i64) -> Vec<RingRegion> {
        let mut regions = Vec::with_capacity(2);
        let first_frame = first_frame.max(0);
        if frame_count <= 0 || self.frames == 0 {
            return regions;
        }

        let bytes_per_frame = self.stream_type.bytes_per_frame();
        let ring_frames = self.frames as i64;
        let mut frame = first_frame;
        let mut remaining = frame_count;
        while remaining > 0 && regions.len() < 2 {
            let ring_index = frame.rem_euclid(ring_frames);
            let until_wrap = ring_frames - ring_index;
            let len = remaining.min(until_wrap);
            regions.push(RingRegion {
                first_frame: frame,
                frame_count: len as u32,
                byte_offset: ring_index as usize * bytes_per_frame,
            });
            frame += len;
            remaining -= len;
        }
        regions
    }

    /// Returns the payload bytes for a region produced by
    /// [`regions`](Self::regions).
    pub fn bytes(&self, region: &RingRegion) -> &[u8] {
        let bytes_per_frame = self.stream_type.bytes_per_frame();
        let start = region.byte_offset;
        let end = start + region.frame_count as usize * bytes_per_frame;
        &self.payload[start..end]
    }
}

struct FeedInner {
    payload: Arc<[u8]>,
    clock_mono_to_ring_pos: Option<TimelineFunction>,
    fence_frames: u32,
    generation: u64,
}

/// Driver-owned handle the engine snapshots each mix cycle.
///
/// The driver (or a test standing in for one) anchors the production
/// timeline with [`start`](Self::start) and replaces payload content as it
/// produces audio. The engine only ever calls
/// [`snapshot`](Self::snapshot).
pub struct RingBufferFeed {
    stream_type: StreamType,
    frames: u32,
    inner: Mutex<FeedInner>,
}

impl RingBufferFeed {
    /// Creates a silent, unanchored feed of `frames` capacity.
    pub fn new(stream_type: StreamType, frames: u32) -> Arc<Self> {
        let bytes = frames as usize * stream_type.bytes_per_frame();
        Arc::new(Self {
            stream_type,
            frames,
            inner: Mutex::new(FeedInner {
                payload: vec![0u8; bytes].into(),
                clock_mono_to_ring_pos: None,
                fence_frames: 0,
                generation: 0,
            }),
        })
    }

    /// The format of the audio in the ring.
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Anchors (or re-anchors) the production timeline, mapping
    /// clock-monotonic nanoseconds to frames produced. Bumps the
    /// generation.
    pub fn start(&self, clock_mono_to_ring_pos: TimelineFunction) {
        let mut inner = self.lock();
        inner.clock_mono_to_ring_pos = Some(clock_mono_to_ring_pos);
        inner.generation += 1;
    }

    /// Sets the fence: how many frames behind the write head remain
    /// unsafe to read.
    pub fn set_fence_frames(&self, fence_frames: u32) {
        let mut inner = self.lock();
        inner.fence_frames = fence_frames;
        inner.generation += 1;
    }

    /// Replaces the ring payload. `bytes` must cover the whole ring.
    pub fn set_payload(&self, bytes: Vec<u8>) {
        assert_eq!(
            bytes.len(),
            self.frames as usize * self.stream_type.bytes_per_frame(),
            "payload must cover the whole ring"
        );
        self.lock().payload = bytes.into();
    }

    /// Takes a read-only snapshot, or `None` if the driver has not
    /// anchored the production timeline yet.
    pub fn snapshot(&self) -> Option<RingBufferSnapshot> {
        let inner = self.lock();
        let clock_mono_to_ring_pos = inner.clock_mono_to_ring_pos?;
        Some(RingBufferSnapshot {
            payload: Arc::clone(&inner.payload),
            frames: self.frames,
            stream_type: self.stream_type,
            clock_mono_to_ring_pos,
            fence_frames: inner.fence_frames,
            generation: inner.generation,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn feed_8k_mono(frames: u32) -> Arc<RingBufferFeed> {
        RingBufferFeed::new(StreamType::new(SampleFormat::I16, 1, 8000), frames)
    }

    /// Production anchored at t=0, 8000 frames per second.
    fn production_at_8k() -> TimelineFunction {
        TimelineFunction::new(0, 0, TimelineRate::new(8000, 1_000_000_000))
    }

    #[test]
    fn test_snapshot_requires_start() {
        let feed = feed_8k_mono(256);
        assert!(feed.snapshot().is_none());
        feed.start(production_at_8k());
        assert!(feed.snapshot().is_some());
    }

    #[test]
    fn test_safe_read_range_tracks_production() {
        let feed = feed_8k_mono(1024);
        feed.start(production_at_8k());
        let snapshot = feed.snapshot().unwrap();

        // At 100ms the driver has produced 800 frames.
        let range = snapshot.safe_read_range(100_000_000).unwrap().unwrap();
        assert_eq!(range, (0, 800));

        // Beyond one ring of audio, the oldest frames are overwritten.
        let range = snapshot.safe_read_range(200_000_000).unwrap().unwrap();
        assert_eq!(range, (576, 1600));
    }

    #[test]
    fn test_safe_read_range_respects_fence() {
        let feed = feed_8k_mono(1024);
        feed.start(production_at_8k());
        feed.set_fence_frames(100);
        let snapshot = feed.snapshot().unwrap();

        let range = snapshot.safe_read_range(100_000_000).unwrap().unwrap();
        assert_eq!(range, (0, 700));
        assert!(snapshot.safe_read_range(0).unwrap().is_none());
    }

    #[test]
    fn test_regions_split_on_wraparound() {
        let feed = feed_8k_mono(100);
        feed.start(production_at_8k());
        let snapshot = feed.snapshot().unwrap();

        // Frames 90..110 wrap: 10 at the tail, 10 at the head.
        let regions = snapshot.regions(90, 20);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].first_frame, 90);
        assert_eq!(regions[0].frame_count, 10);
        assert_eq!(regions[0].byte_offset, 90 * 2);
        assert_eq!(regions[1].first_frame, 100);
        assert_eq!(regions[1].frame_count, 10);
        assert_eq!(regions[1].byte_offset, 0);
    }

    #[test]
    fn test_regions_contiguous() {
        let feed = feed_8k_mono(100);
        feed.start(production_at_8k());
        let snapshot = feed.snapshot().unwrap();

        let regions = snapshot.regions(20, 30);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].frame_count, 30);
        assert_eq!(snapshot.bytes(&regions[0]).len(), 60);
    }

    #[test]
    fn test_generation_bumps_on_restart() {
        let feed = feed_8k_mono(64);
        feed.start(production_at_8k());
        let first = feed.snapshot().unwrap().generation();
        feed.start(production_at_8k());
        assert!(feed.snapshot().unwrap().generation() > first);
    }

    #[test]
    fn test_clock_mono_to_frac_frames() {
        let feed = feed_8k_mono(64);
        feed.start(production_at_8k());
        let snapshot = feed.snapshot().unwrap();
        let frac = snapshot.clock_mono_to_frac_frames().unwrap();
        // 1ms -> 8 frames -> 8 << FRAC_BITS fractional frames.
        assert_eq!(frac.apply(1_000_000).unwrap(), 8 * FRAC_ONE);
    }
}
