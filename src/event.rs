//! Client-facing notifications.
//!
//! The engine delivers completed buffers and lifecycle notifications over a
//! tokio mpsc channel handed out at spawn time. Packet payloads are never
//! copied into events: a [`CapturePacket`] references a byte range already
//! resident in the bound shared buffer.

/// One delivered capture buffer.
///
/// References data the mix context has already written into the shared
/// buffer. The referenced region belongs to the client until the stream is
/// flushed or shut down; the engine never reuses it before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePacket {
    /// Monotonically increasing per-stream sequence number.
    pub sequence: u64,

    /// Byte offset of the payload within the shared buffer.
    pub payload_offset: u64,

    /// Byte length of the valid payload.
    ///
    /// Shorter than the requested region when the buffer was delivered
    /// partially filled (flush or async stop).
    pub payload_size: u64,

    /// Capture time of the first frame, in clock-monotonic nanoseconds.
    ///
    /// `None` when no audio landed in this buffer before delivery.
    pub capture_timestamp: Option<i64>,

    /// The payload's timeline is not contiguous with the previous packet
    /// (first packet after a flush, mode change, or re-anchor).
    pub discontinuity: bool,
}

/// Notifications delivered from the engine to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A buffer finished filling (or was flushed) and is ready to read.
    Packet(CapturePacket),

    /// End of a delivery run: emitted after every flush and after async
    /// stop drains its queues.
    EndOfStream,

    /// The stream shut down; no further events follow.
    Shutdown {
        /// Human-readable reason, for logging.
        reason: String,
    },
}
