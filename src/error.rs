//! Error types for capture-mixer.
//!
//! Errors are split into two categories:
//! - **Protocol errors**: rejected synchronously on the triggering request;
//!   the stream keeps running (e.g. `CaptureAt` in the wrong state).
//! - **Fatal errors**: terminate the stream through the engine's single
//!   shutdown path (arithmetic overflow, illegal source links, invalid gain).
//!   The host process and other streams are never affected.

use crate::engine::State;
use crate::timeline::TimelineOverflow;

/// Errors surfaced by the capture engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    /// The operation is not allowed in the engine's current state.
    #[error("{operation} not allowed in state {state:?}")]
    WrongState {
        /// Name of the rejected operation.
        operation: &'static str,
        /// State the engine was in.
        state: State,
    },

    /// The requested channel count is outside the device-advertised bounds.
    #[error("channel count {channels} outside supported range {min}..={max}")]
    ChannelsOutOfRange {
        /// Requested channel count.
        channels: u16,
        /// Minimum supported channel count.
        min: u16,
        /// Maximum supported channel count.
        max: u16,
    },

    /// The requested frame rate is outside the device-advertised bounds.
    #[error("frame rate {frames_per_second}Hz outside supported range {min}..={max}")]
    FrameRateOutOfRange {
        /// Requested frame rate.
        frames_per_second: u32,
        /// Minimum supported frame rate.
        min: u32,
        /// Maximum supported frame rate.
        max: u32,
    },

    /// A payload buffer was bound before the stream format was set.
    #[error("stream format must be set before binding a payload buffer")]
    FormatNotSet,

    /// A payload buffer is already bound; binding is allowed exactly once.
    #[error("payload buffer already bound")]
    BufferAlreadyBound,

    /// The payload buffer cannot hold even a single frame.
    #[error("payload buffer of {bytes} bytes holds no complete frame of {bytes_per_frame} bytes")]
    BufferTooSmall {
        /// Size of the buffer in bytes.
        bytes: usize,
        /// Size of one frame in bytes.
        bytes_per_frame: usize,
    },

    /// The payload buffer size is not a whole multiple of the frame size.
    #[error("payload buffer of {bytes} bytes is not a multiple of the {bytes_per_frame}-byte frame size")]
    BufferMisaligned {
        /// Size of the buffer in bytes.
        bytes: usize,
        /// Size of one frame in bytes.
        bytes_per_frame: usize,
    },

    /// The payload buffer exceeds the addressable 32-bit frame count.
    #[error("payload buffer of {frames} frames exceeds the addressable frame count")]
    BufferTooLarge {
        /// Frame capacity implied by the buffer size.
        frames: u64,
    },

    /// A capture request referenced a region outside the bound buffer, or
    /// was empty.
    #[error("capture range {offset_frames}+{num_frames} invalid for a {capacity_frames}-frame buffer")]
    InvalidCaptureRange {
        /// First destination frame of the request.
        offset_frames: u32,
        /// Number of frames requested.
        num_frames: u32,
        /// Frame capacity of the bound buffer.
        capacity_frames: u32,
    },

    /// Async capture was started with an unusable packet size.
    ///
    /// `frames_per_packet` must be non-zero and no more than half the
    /// buffer capacity so two packets can be in flight without wraparound
    /// collision.
    #[error("frames_per_packet {frames_per_packet} invalid (max {max_frames_per_packet})")]
    InvalidPacketSize {
        /// Requested packet size in frames.
        frames_per_packet: u32,
        /// Largest acceptable packet size for the bound buffer.
        max_frames_per_packet: u32,
    },

    /// Async capture was started while buffers were still queued.
    #[error("pending or finished buffers still queued")]
    QueuesNotEmpty,

    /// The requested gain is outside the device-advertised range.
    ///
    /// Invalid gain is rejected, not clamped, and shuts the stream down.
    #[error("gain {gain_db}dB outside supported range {min}..={max}")]
    GainOutOfRange {
        /// Requested gain in dB.
        gain_db: f32,
        /// Minimum supported gain.
        min: f32,
        /// Maximum supported gain.
        max: f32,
    },

    /// Timeline arithmetic overflowed; fatal to the stream.
    #[error(transparent)]
    Overflow(#[from] TimelineOverflow),

    /// A silence-sentinel device was linked as a capture source.
    ///
    /// Silence sources exist to pace renderers and may never feed a real
    /// capture; detecting one mid-cycle is fatal to the stream.
    #[error("silence-sentinel device linked as capture source")]
    SilenceSourceLinked,

    /// Allocation of buffer bookkeeping failed; fatal to the stream.
    #[error("capture bookkeeping allocation failed")]
    BookkeepingExhausted,

    /// The engine task is gone (shut down or dropped).
    #[error("capture engine unavailable")]
    EngineUnavailable,
}
