//! Configuration types for capture streams.

use std::time::Duration;

/// Gain at or below which a stream is treated as fully muted.
///
/// Sources are not read at all below this threshold; the mix produces
/// silence while frame accounting continues normally.
pub const MUTED_GAIN_DB: f32 = -160.0;

/// Device-advertised capability bounds consumed as configuration.
///
/// Client requests outside these bounds are rejected synchronously.
#[derive(Debug, Clone)]
pub struct DeviceLimits {
    /// Minimum supported channel count.
    pub min_channels: u16,
    /// Maximum supported channel count.
    pub max_channels: u16,
    /// Minimum supported frame rate in Hz.
    pub min_frames_per_second: u32,
    /// Maximum supported frame rate in Hz.
    pub max_frames_per_second: u32,
    /// Minimum settable stream gain in dB.
    pub min_gain_db: f32,
    /// Maximum settable stream gain in dB.
    pub max_gain_db: f32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_channels: 1,
            max_channels: 8,
            min_frames_per_second: 1000,
            max_frames_per_second: 192_000,
            min_gain_db: MUTED_GAIN_DB,
            max_gain_db: 24.0,
        }
    }
}

impl DeviceLimits {
    /// Returns true if the channel count is within the advertised bounds.
    pub fn channels_in_range(&self, channels: u16) -> bool {
        (self.min_channels..=self.max_channels).contains(&channels)
    }

    /// Returns true if the frame rate is within the advertised bounds.
    pub fn frame_rate_in_range(&self, frames_per_second: u32) -> bool {
        (self.min_frames_per_second..=self.max_frames_per_second).contains(&frames_per_second)
    }

    /// Returns true if the gain is within the advertised bounds.
    pub fn gain_in_range(&self, gain_db: f32) -> bool {
        gain_db.is_finite() && gain_db >= self.min_gain_db && gain_db <= self.max_gain_db
    }
}

/// Configuration for engine behavior.
///
/// Use [`EngineConfig::default()`] for sensible defaults, or customize as
/// needed.
///
/// # Example
///
/// ```
/// use capture_mixer::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     settle_margin: Duration::from_millis(5),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Device-advertised capability bounds.
    pub limits: DeviceLimits,

    /// Lower bound on how long a producer source holds already-presented
    /// data before overwriting it.
    ///
    /// Also bounds the size of one mix job: the engine never mixes more
    /// than `min_fence_time / frame_period` frames in a single cycle.
    /// Default: 50ms
    pub min_fence_time: Duration,

    /// Conservative margin added to the pacing timer so sources have
    /// settled by the time the engine wakes to read them.
    /// Default: 2ms
    pub settle_margin: Duration,

    /// Capacity of the control command channel.
    /// Default: 16
    pub command_channel_capacity: usize,

    /// Capacity of the client event channel.
    ///
    /// Large enough that delivery never stalls the mix context under
    /// ordinary consumption. Default: 64
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            min_fence_time: Duration::from_millis(50),
            settle_margin: Duration::from_millis(2),
            command_channel_capacity: 16,
            event_channel_capacity: 64,
        }
    }
}
