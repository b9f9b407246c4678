//! Conversion from the `f32` intermediate buffer into the destination
//! format.

use crate::format::{SampleFormat, StreamType};

/// Format-specific writer producing destination bytes from mixed samples.
#[derive(Debug, Clone, Copy)]
pub struct OutputWriter {
    stream_type: StreamType,
}

impl OutputWriter {
    /// Creates a writer for the destination stream type.
    pub fn new(stream_type: StreamType) -> Self {
        Self { stream_type }
    }

    /// The byte that fills a silent destination region.
    pub fn silence_byte(&self) -> u8 {
        match self.stream_type.sample_format {
            SampleFormat::U8 => 0x80,
            SampleFormat::I16 | SampleFormat::F32 => 0,
        }
    }

    /// Converts mixed samples into destination bytes, clamping to the
    /// format's range. `samples` length must be a whole number of frames.
    pub fn to_bytes(&self, samples: &[f32], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(samples.len() * self.stream_type.sample_format.bytes_per_sample());
        match self.stream_type.sample_format {
            SampleFormat::U8 => {
                for &s in samples {
                    let clamped = s.clamp(-1.0, 1.0);
                    out.push((128.0 + (clamped * 127.0).round()) as u8);
                }
            }
            SampleFormat::I16 => {
                for &s in samples {
                    let clamped = s.clamp(-1.0, 1.0);
                    let value = (clamped * 32767.0).round() as i16;
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            SampleFormat::F32 => {
                for &s in samples {
                    out.extend_from_slice(&s.clamp(-1.0, 1.0).to_le_bytes());
                }
            }
        }
    }
}
