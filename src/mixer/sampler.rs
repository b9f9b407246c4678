//! Point and linear samplers.

use crate::format::{SampleFormat, StreamType};
use crate::timeline::{FRAC_BITS, FRAC_HALF, FRAC_MASK, FRAC_ONE};

use super::Sampler;

/// One contiguous slice of source audio with its fractional-frame PTS.
#[derive(Debug, Clone, Copy)]
pub struct SourceRegion<'a> {
    /// Interleaved source samples in the source's own format.
    pub bytes: &'a [u8],
    /// Format of the source audio.
    pub stream_type: StreamType,
    /// Fractional-frame PTS of the first frame in `bytes`.
    pub frac_start: i64,
    /// Number of frames in `bytes`.
    pub frame_count: usize,
}

impl SourceRegion<'_> {
    /// Reads one normalized sample, mapping source channels onto the
    /// destination channel: duplicate for mono sources, average for
    /// stereo-to-mono.
    fn read(&self, frame: usize, dest_channel: u16, dest_channels: u16) -> f32 {
        let source_channels = self.stream_type.channels;
        if source_channels == 1 {
            return self.sample(frame, 0);
        }
        if source_channels == 2 && dest_channels == 1 {
            return 0.5 * (self.sample(frame, 0) + self.sample(frame, 1));
        }
        self.sample(frame, dest_channel)
    }

    fn sample(&self, frame: usize, channel: u16) -> f32 {
        let index = frame * self.stream_type.channels as usize + channel as usize;
        match self.stream_type.sample_format {
            SampleFormat::U8 => (self.bytes[index] as f32 - 128.0) / 128.0,
            SampleFormat::I16 => {
                let offset = index * 2;
                let raw = i16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]]);
                raw as f32 / 32768.0
            }
            SampleFormat::F32 => {
                let offset = index * 4;
                f32::from_le_bytes([
                    self.bytes[offset],
                    self.bytes[offset + 1],
                    self.bytes[offset + 2],
                    self.bytes[offset + 3],
                ])
            }
        }
    }
}

/// Writes or accumulates one destination frame.
fn emit(
    dest: &mut [f32],
    dest_channels: u16,
    dest_frame: usize,
    accumulate: bool,
    value: impl Fn(u16) -> f32,
) {
    let base = dest_frame * dest_channels as usize;
    for channel in 0..dest_channels {
        let slot = &mut dest[base + channel as usize];
        let v = value(channel);
        if accumulate {
            *slot += v;
        } else {
            *slot = v;
        }
    }
}

/// Advances the fixed-point source position by one destination frame.
fn advance(
    frac_source_pos: &mut i64,
    step_size: i64,
    rate_modulo: u64,
    denominator: u64,
    src_pos_modulo: &mut u64,
) {
    *frac_source_pos += step_size;
    if rate_modulo != 0 {
        *src_pos_modulo += rate_modulo;
        if *src_pos_modulo >= denominator {
            *src_pos_modulo -= denominator;
            *frac_source_pos += 1;
        }
    }
}

/// Nearest-frame sampler for rate-preserving links.
#[derive(Debug, Default)]
pub struct PointSampler;

impl PointSampler {
    /// Creates a point sampler.
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for PointSampler {
    fn pos_filter_width(&self) -> i64 {
        FRAC_HALF
    }

    fn neg_filter_width(&self) -> i64 {
        FRAC_HALF
    }

    fn mix_region(
        &mut self,
        dest: &mut [f32],
        dest_channels: u16,
        dest_frame_offset: &mut usize,
        dest_frame_count: usize,
        region: &SourceRegion<'_>,
        frac_source_pos: &mut i64,
        step_size: i64,
        rate_modulo: u64,
        denominator: u64,
        src_pos_modulo: &mut u64,
        gain_scale: f32,
        accumulate: bool,
    ) -> bool {
        while *dest_frame_offset < dest_frame_count {
            let rel = *frac_source_pos - region.frac_start;
            let nearest = (rel + FRAC_HALF) >> FRAC_BITS;
            if nearest >= region.frame_count as i64 {
                return true;
            }
            if nearest >= 0 {
                let frame = nearest as usize;
                emit(dest, dest_channels, *dest_frame_offset, accumulate, |ch| {
                    region.read(frame, ch, dest_channels) * gain_scale
                });
            }
            *dest_frame_offset += 1;
            advance(
                frac_source_pos,
                step_size,
                rate_modulo,
                denominator,
                src_pos_modulo,
            );
        }
        false
    }
}

/// Linear-interpolation sampler for rational rate conversion.
#[derive(Debug, Default)]
pub struct LinearSampler;

impl LinearSampler {
    /// Creates a linear sampler.
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for LinearSampler {
    fn pos_filter_width(&self) -> i64 {
        FRAC_ONE
    }

    fn neg_filter_width(&self) -> i64 {
        FRAC_ONE
    }

    fn mix_region(
        &mut self,
        dest: &mut [f32],
        dest_channels: u16,
        dest_frame_offset: &mut usize,
        dest_frame_count: usize,
        region: &SourceRegion<'_>,
        frac_source_pos: &mut i64,
        step_size: i64,
        rate_modulo: u64,
        denominator: u64,
        src_pos_modulo: &mut u64,
        gain_scale: f32,
        accumulate: bool,
    ) -> bool {
        while *dest_frame_offset < dest_frame_count {
            let rel = *frac_source_pos - region.frac_start;
            let floor = rel >> FRAC_BITS;
            if floor >= region.frame_count as i64 {
                return true;
            }
            if floor >= 0 {
                let frame = floor as usize;
                let frac = (rel & FRAC_MASK) as f32 / FRAC_ONE as f32;
                let has_next = frame + 1 < region.frame_count;
                emit(dest, dest_channels, *dest_frame_offset, accumulate, |ch| {
                    let a = region.read(frame, ch, dest_channels);
                    // At the region edge fall back to the nearest frame.
                    let b = if has_next {
                        region.read(frame + 1, ch, dest_channels)
                    } else {
                        a
                    };
                    (a + (b - a) * frac) * gain_scale
                });
            }
            *dest_frame_offset += 1;
            advance(
                frac_source_pos,
                step_size,
                rate_modulo,
                denominator,
                src_pos_modulo,
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i16_region(samples: &[i16]) -> (Vec<u8>, StreamType) {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        (bytes, StreamType::new(SampleFormat::I16, 1, 8000))
    }

    fn mix_all(
        sampler: &mut dyn Sampler,
        dest_frames: usize,
        samples: &[i16],
        frac_start: i64,
        frac_pos: i64,
        step_size: i64,
        gain_scale: f32,
        accumulate: bool,
        dest: &mut [f32],
    ) -> (usize, i64) {
        let (bytes, stream_type) = i16_region(samples);
        let region = SourceRegion {
            bytes: &bytes,
            stream_type,
            frac_start,
            frame_count: samples.len(),
        };
        let mut offset = 0;
        let mut pos = frac_pos;
        let mut modulo = 0;
        sampler.mix_region(
            dest, 1, &mut offset, dest_frames, &region, &mut pos, step_size, 0, 1, &mut modulo,
            gain_scale, accumulate,
        );
        (offset, pos)
    }

    #[test]
    fn test_point_same_rate_passthrough() {
        let mut dest = [0.0f32; 4];
        let samples = [8192i16, -8192, 16384, -16384];
        let (offset, pos) = mix_all(
            &mut PointSampler::new(),
            4,
            &samples,
            0,
            0,
            FRAC_ONE,
            1.0,
            false,
            &mut dest,
        );
        assert_eq!(offset, 4);
        assert_eq!(pos, 4 * FRAC_ONE);
        assert!((dest[0] - 0.25).abs() < 1e-4);
        assert!((dest[1] + 0.25).abs() < 1e-4);
        assert!((dest[2] - 0.5).abs() < 1e-4);
        assert!((dest[3] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_point_region_exhaustion() {
        let mut dest = [0.0f32; 4];
        let (bytes, stream_type) = i16_region(&[1000, 2000]);
        let region = SourceRegion {
            bytes: &bytes,
            stream_type,
            frac_start: 0,
            frame_count: 2,
        };
        let mut offset = 0;
        let mut pos = 0i64;
        let mut modulo = 0u64;
        let exhausted = PointSampler::new().mix_region(
            &mut dest, 1, &mut offset, 4, &region, &mut pos, FRAC_ONE, 0, 1, &mut modulo, 1.0,
            false,
        );
        assert!(exhausted);
        assert_eq!(offset, 2);
    }

    #[test]
    fn test_point_skips_positions_before_region() {
        let mut dest = [0.0f32; 3];
        let samples = [16384i16, 16384, 16384];
        // Start one whole frame before the region begins.
        let (offset, _) = mix_all(
            &mut PointSampler::new(),
            3,
            &samples,
            FRAC_ONE,
            0,
            FRAC_ONE,
            1.0,
            false,
            &mut dest,
        );
        assert_eq!(offset, 3);
        assert_eq!(dest[0], 0.0); // no source data at that position
        assert!((dest[1] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_point_gain_scale() {
        let mut dest = [0.0f32; 1];
        mix_all(
            &mut PointSampler::new(),
            1,
            &[16384],
            0,
            0,
            FRAC_ONE,
            0.5,
            false,
            &mut dest,
        );
        assert!((dest[0] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_point_accumulates() {
        let mut dest = [0.25f32; 1];
        mix_all(
            &mut PointSampler::new(),
            1,
            &[16384],
            0,
            0,
            FRAC_ONE,
            1.0,
            true,
            &mut dest,
        );
        assert!((dest[0] - 0.75).abs() < 1e-4);
    }

    #[test]
    fn test_linear_interpolates_midpoint() {
        let mut dest = [0.0f32; 2];
        // Step half a frame: positions 0.0 and 0.5.
        mix_all(
            &mut LinearSampler::new(),
            2,
            &[0, 16384],
            0,
            0,
            FRAC_HALF,
            1.0,
            false,
            &mut dest,
        );
        assert_eq!(dest[0], 0.0);
        assert!((dest[1] - 0.25).abs() < 1e-4); // halfway between 0.0 and 0.5
    }

    #[test]
    fn test_linear_edge_falls_back_to_nearest() {
        let mut dest = [0.0f32; 1];
        // Position inside the last frame of the region.
        mix_all(
            &mut LinearSampler::new(),
            1,
            &[16384],
            0,
            FRAC_HALF,
            FRAC_ONE,
            1.0,
            false,
            &mut dest,
        );
        assert!((dest[0] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_rate_modulo_carries() {
        // Step 1 frame + modulo 1/2: after two frames the position gains
        // one extra fractional unit.
        let mut pos = 0i64;
        let mut modulo = 0u64;
        for _ in 0..2 {
            advance(&mut pos, FRAC_ONE, 1, 2, &mut modulo);
        }
        assert_eq!(pos, 2 * FRAC_ONE + 1);
        assert_eq!(modulo, 0);
    }

    #[test]
    fn test_stereo_to_mono_average() {
        let samples: Vec<u8> = [16384i16, 0, 16384, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let region = SourceRegion {
            bytes: &samples,
            stream_type: StreamType::new(SampleFormat::I16, 2, 8000),
            frac_start: 0,
            frame_count: 2,
        };
        let mut dest = [0.0f32; 2];
        let mut offset = 0;
        let mut pos = 0i64;
        let mut modulo = 0u64;
        PointSampler::new().mix_region(
            &mut dest, 1, &mut offset, 2, &region, &mut pos, FRAC_ONE, 0, 1, &mut modulo, 1.0,
            false,
        );
        assert!((dest[0] - 0.25).abs() < 1e-4);
        assert!((dest[1] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_stereo_passthrough_keeps_channels_separate() {
        // Same unbalanced frames as the down-mix test, but a stereo
        // destination must carry each channel through unaveraged.
        let samples: Vec<u8> = [16384i16, 0, 16384, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let region = SourceRegion {
            bytes: &samples,
            stream_type: StreamType::new(SampleFormat::I16, 2, 8000),
            frac_start: 0,
            frame_count: 2,
        };
        let mut dest = [0.0f32; 4];
        let mut offset = 0;
        let mut pos = 0i64;
        let mut modulo = 0u64;
        PointSampler::new().mix_region(
            &mut dest, 2, &mut offset, 2, &region, &mut pos, FRAC_ONE, 0, 1, &mut modulo, 1.0,
            false,
        );
        assert!((dest[0] - 0.5).abs() < 1e-4);
        assert_eq!(dest[1], 0.0);
        assert!((dest[2] - 0.5).abs() < 1e-4);
        assert_eq!(dest[3], 0.0);
    }
}
