//! Stream format types.

use std::time::Duration;

use crate::timeline::{TimelineRate, FRAC_ONE};

/// Nanoseconds per second, the reference unit for all clock math.
pub const NS_PER_SECOND: u64 = 1_000_000_000;

/// PCM sample encodings the engine can produce and consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit samples, silence at `0x80`.
    U8,
    /// Signed 16-bit little-endian samples.
    I16,
    /// 32-bit float samples in `[-1.0, 1.0]`.
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// The format of one audio stream: encoding, channel count, and frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamType {
    /// Sample encoding.
    pub sample_format: SampleFormat,
    /// Number of interleaved channels per frame.
    pub channels: u16,
    /// Frames per second.
    pub frames_per_second: u32,
}

impl StreamType {
    /// Creates a stream type.
    pub fn new(sample_format: SampleFormat, channels: u16, frames_per_second: u32) -> Self {
        Self {
            sample_format,
            channels,
            frames_per_second,
        }
    }

    /// Size of one frame (one sample per channel) in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Duration of a single frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(NS_PER_SECOND / self.frames_per_second as u64)
    }

    /// Rate mapping clock nanoseconds to whole frames.
    pub fn frames_per_ns(&self) -> TimelineRate {
        TimelineRate::new(self.frames_per_second as u64, NS_PER_SECOND)
    }

    /// Rate mapping clock nanoseconds to fractional frames.
    pub fn frac_frames_per_ns(&self) -> TimelineRate {
        TimelineRate::new(
            self.frames_per_second as u64 * FRAC_ONE as u64,
            NS_PER_SECOND,
        )
    }

    /// Rate mapping whole frames to clock nanoseconds.
    pub fn ns_per_frame(&self) -> TimelineRate {
        TimelineRate::new(NS_PER_SECOND, self.frames_per_second as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_frame() {
        let mono8 = StreamType::new(SampleFormat::U8, 1, 8000);
        assert_eq!(mono8.bytes_per_frame(), 1);

        let stereo16 = StreamType::new(SampleFormat::I16, 2, 48000);
        assert_eq!(stereo16.bytes_per_frame(), 4);

        let quad_float = StreamType::new(SampleFormat::F32, 4, 96000);
        assert_eq!(quad_float.bytes_per_frame(), 16);
    }

    #[test]
    fn test_frame_duration() {
        let st = StreamType::new(SampleFormat::I16, 1, 8000);
        assert_eq!(st.frame_duration(), Duration::from_micros(125));
    }

    #[test]
    fn test_frames_per_ns_round_trip() {
        let st = StreamType::new(SampleFormat::I16, 2, 44100);
        let forward = st.frames_per_ns();
        let back = forward.inverse().unwrap();
        // One second of frames maps back to one second.
        assert_eq!(back.scale(44100).unwrap(), 1_000_000_000);
    }
}
