//! The pending/finished capture buffer queues.
//!
//! One lock guards both queues; the mix context commits into the front
//! pending buffer while the delivery context pops finished ones. Sequence
//! numbers detect the race where a buffer is flushed out from under an
//! in-flight mix: the late commit is simply dropped.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One capture buffer queued for filling or delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCaptureBuffer {
    /// Monotonically increasing per-stream sequence number.
    pub sequence: u64,
    /// First destination frame within the shared buffer.
    pub offset_frames: u32,
    /// Requested length in frames.
    pub num_frames: u32,
    /// Frames mixed so far; never decreases, never exceeds `num_frames`.
    pub filled_frames: u32,
    /// Capture time of the first mixed frame; `None` until audio lands.
    pub capture_timestamp: Option<i64>,
    /// Set when the first mixed frame follows a timeline break.
    pub discontinuity: bool,
}

/// What the mix context needs to know about the front pending buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrontSnapshot {
    /// Sequence of the buffer the snapshot was taken from.
    pub sequence: u64,
    /// First destination frame within the shared buffer.
    pub offset_frames: u32,
    /// Requested length in frames.
    pub num_frames: u32,
    /// Frames already mixed.
    pub filled_frames: u32,
}

/// Result of committing one mix job into the queue.
#[derive(Debug, Clone, Copy)]
pub enum CommitOutcome {
    /// The job landed in the front buffer.
    Progress {
        /// The buffer filled completely and moved to the finished queue.
        completed: bool,
        /// The finished queue was empty before this buffer arrived; the
        /// committer should schedule a delivery run.
        finished_was_empty: bool,
        /// This commit stamped the buffer's capture timestamp (and
        /// discontinuity flag, when requested).
        stamped_timestamp: bool,
    },
    /// The snapshotted buffer is gone (flushed during the mix); the job's
    /// audio is dropped.
    Raced,
}

struct Inner {
    pending: VecDeque<PendingCaptureBuffer>,
    finished: VecDeque<PendingCaptureBuffer>,
    next_sequence: u64,
}

/// The shared pending/finished queue pair for one capture stream.
pub struct PacketQueue {
    inner: Mutex<Inner>,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    /// Creates an empty queue pair.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                finished: VecDeque::new(),
                next_sequence: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a buffer to the pending queue, assigning its sequence.
    pub fn push_pending(&self, offset_frames: u32, num_frames: u32) -> u64 {
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.pending.push_back(PendingCaptureBuffer {
            sequence,
            offset_frames,
            num_frames,
            filled_frames: 0,
            capture_timestamp: None,
            discontinuity: false,
        });
        sequence
    }

    /// Snapshots the front pending buffer for one mix job.
    pub fn front_snapshot(&self) -> Option<FrontSnapshot> {
        let inner = self.lock();
        inner.pending.front().map(|buffer| FrontSnapshot {
            sequence: buffer.sequence,
            offset_frames: buffer.offset_frames,
            num_frames: buffer.num_frames,
            filled_frames: buffer.filled_frames,
        })
    }

    /// Commits `frames` mixed frames into the buffer identified by
    /// `sequence`.
    ///
    /// Stamps `timestamp` (and `discontinuity`, when set) only on the first
    /// commit into the buffer. Returns [`CommitOutcome::Raced`] when the
    /// buffer is no longer at the front; the caller must re-snapshot and
    /// re-anchor rather than retry.
    pub fn commit_mix(
        &self,
        sequence: u64,
        frames: u32,
        timestamp: i64,
        discontinuity: bool,
    ) -> CommitOutcome {
        let mut inner = self.lock();
        let Some(front) = inner.pending.front_mut() else {
            return CommitOutcome::Raced;
        };
        if front.sequence != sequence {
            return CommitOutcome::Raced;
        }
        let stamped_timestamp = front.capture_timestamp.is_none();
        if stamped_timestamp {
            front.capture_timestamp = Some(timestamp);
            front.discontinuity = discontinuity;
        }
        debug_assert!(front.filled_frames + frames <= front.num_frames);
        front.filled_frames += frames;
        let completed = front.filled_frames >= front.num_frames;
        let mut finished_was_empty = false;
        if completed {
            if let Some(buffer) = inner.pending.pop_front() {
                finished_was_empty = inner.finished.is_empty();
                inner.finished.push_back(buffer);
            }
        }
        CommitOutcome::Progress {
            completed,
            finished_was_empty,
            stamped_timestamp,
        }
    }

    /// Moves every pending buffer to the finished queue with whatever it
    /// holds so far. Used by async stop to hand partial buffers to
    /// delivery.
    pub fn drain_pending_to_finished(&self) {
        let mut inner = self.lock();
        while let Some(buffer) = inner.pending.pop_front() {
            inner.finished.push_back(buffer);
        }
    }

    /// Pops the oldest finished buffer for delivery.
    pub fn pop_finished(&self) -> Option<PendingCaptureBuffer> {
        self.lock().finished.pop_front()
    }

    /// Atomically drains both queues, oldest first: finished buffers, then
    /// pending ones in submission order.
    pub fn flush(&self) -> Vec<PendingCaptureBuffer> {
        let mut inner = self.lock();
        let mut drained: Vec<PendingCaptureBuffer> = inner.finished.drain(..).collect();
        drained.extend(inner.pending.drain(..));
        drained
    }

    /// True when neither queue holds a buffer.
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.pending.is_empty() && inner.finished.is_empty()
    }

    /// Number of buffers waiting to be filled.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of buffers waiting for delivery.
    pub fn finished_len(&self) -> usize {
        self.lock().finished.len()
    }
}
