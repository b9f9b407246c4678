//! Resampler selection and sample mixing.
//!
//! A [`Sampler`] consumes source audio from ring-buffer regions into the
//! engine's `f32` intermediate buffer at fixed-point step/modulo precision,
//! scaling by gain and accumulating across sources. Selection is a pure
//! function of the source and destination formats; an unsupported pair is a
//! per-link failure, not an engine failure.

mod output;
mod sampler;

pub use output::OutputWriter;
pub use sampler::{LinearSampler, PointSampler, SourceRegion};

use crate::format::StreamType;

/// Converts a gain in dB to the linear scale applied per sample.
pub fn gain_scale_from_db(gain_db: f32) -> f32 {
    10f32.powf(gain_db / 20.0)
}

/// A resampling mix strategy for one link.
///
/// Positions are fractional source frames ([`FRAC_BITS`] fixed point);
/// `step_size`/`rate_modulo`/`denominator` carry the exact source-per-dest
/// ratio so long mixes never drift.
///
/// [`FRAC_BITS`]: crate::timeline::FRAC_BITS
pub trait Sampler: Send {
    /// Fractional frames of source data needed beyond the sample position.
    fn pos_filter_width(&self) -> i64;

    /// Fractional frames of source data needed before the sample position.
    fn neg_filter_width(&self) -> i64;

    /// Mixes one contiguous source region into `dest`.
    ///
    /// Advances `dest_frame_offset` and `frac_source_pos` together; dest
    /// frames whose source position precedes the region are left as
    /// silence. Returns `true` when the region is exhausted before the
    /// job is complete (the caller should continue with the next region),
    /// `false` when the job filled.
    #[allow(clippy::too_many_arguments)]
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
    ) -> bool;
}

fn channels_compatible(source: u16, dest: u16) -> bool {
    source == dest || source == 1 || (source == 2 && dest == 1)
}

/// Selects a resampling strategy for a source/destination format pair.
///
/// Pure: `None` signals an unsupported pair. Callers treat this as "no
/// route available" for the link, except where selection gates entry to the
/// operating state, in which case it is fatal to that stream.
pub fn select_sampler(source: &StreamType, dest: &StreamType) -> Option<Box<dyn Sampler>> {
    if !channels_compatible(source.channels, dest.channels) {
        return None;
    }
    if source.frames_per_second == dest.frames_per_second {
        Some(Box::new(PointSampler::new()))
    } else {
        Some(Box::new(LinearSampler::new()))
    }
}
