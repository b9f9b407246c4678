//! Per-link resampling bookkeeping.

use crate::mixer::Sampler;
use crate::timeline::{TimelineFunction, TimelineOverflow};

/// Mutable per-link state for a capture link: the selected sampler, the
/// composed destination-frame → fractional-source-frame transform, and the
/// fixed-point step describing the resampling ratio.
///
/// Owned exclusively by the link; only the mix context mutates it. Two
/// generation counters detect when the composed transform is stale: the
/// destination clock generation (bumped when the engine re-anchors) and the
/// source ring generation (bumped when the driver re-anchors).
pub struct CaptureBookkeeping {
    /// The resampler chosen for this link's format pair.
    pub sampler: Box<dyn Sampler>,

    /// Destination frame count → fractional source frame position.
    ///
    /// `None` until first computed, and recomputed lazily whenever either
    /// generation moves.
    pub dest_frames_to_frac_source_frames: Option<TimelineFunction>,

    /// Fractional source frames consumed per destination frame.
    pub step_size: i64,
    /// Fractional remainder of the resampling ratio, carried per frame.
    pub rate_modulo: u64,
    /// Denominator of the resampling ratio remainder.
    pub denominator: u64,
    /// Accumulated sub-unit source position, in `denominator` units.
    pub src_pos_modulo: u64,

    dest_clock_generation: u64,
    source_ring_generation: u64,
}

impl CaptureBookkeeping {
    /// Creates bookkeeping around a selected sampler; the transform starts
    /// unanchored.
    pub fn new(sampler: Box<dyn Sampler>) -> Self {
        Self {
            sampler,
            dest_frames_to_frac_source_frames: None,
            step_size: 0,
            rate_modulo: 0,
            denominator: 1,
            src_pos_modulo: 0,
            dest_clock_generation: 0,
            source_ring_generation: 0,
        }
    }

    /// True when the composed transform must be recomputed before use.
    pub fn is_stale(&self, dest_clock_generation: u64, source_ring_generation: u64) -> bool {
        self.dest_frames_to_frac_source_frames.is_none()
            || self.dest_clock_generation != dest_clock_generation
            || self.source_ring_generation != source_ring_generation
    }

    /// Recomputes the composed transform and the fixed-point step from the
    /// engine's frame→clock function and the source's clock→fractional-frame
    /// function, stamping the generations that produced it.
    pub fn update_transform(
        &mut self,
        dest_frames_to_clock_mono: &TimelineFunction,
        clock_mono_to_frac_source_frames: &TimelineFunction,
        dest_clock_generation: u64,
        source_ring_generation: u64,
    ) -> Result<(), TimelineOverflow> {
        let composed = TimelineFunction::compose(
            clock_mono_to_frac_source_frames,
            dest_frames_to_clock_mono,
        )?;
        let rate = composed.rate();
        self.step_size = (rate.subject_delta() / rate.reference_delta()) as i64;
        self.rate_modulo = rate.subject_delta() % rate.reference_delta();
        self.denominator = rate.reference_delta();
        self.src_pos_modulo = 0;
        self.dest_frames_to_frac_source_frames = Some(composed);
        self.dest_clock_generation = dest_clock_generation;
        self.source_ring_generation = source_ring_generation;
        Ok(())
    }

    /// Drops the composed transform, forcing a recompute on next use.
    pub fn invalidate_transform(&mut self) {
        self.dest_frames_to_frac_source_frames = None;
    }
}
