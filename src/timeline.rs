//! Rational time/position transforms and fixed-point frame math.
//!
//! Every clock/position conversion in the engine goes through a
//! [`TimelineFunction`]: an exact rational mapping between a monotonically
//! increasing integer domain (frames, fractional frames, bytes) and a
//! monotonic time domain (nanoseconds). Rational arithmetic keeps conversions
//! lossless for rational sample rates; overflow is a typed error, never a
//! silent wrap.
//!
//! Resampling positions are carried in fixed point with [`FRAC_BITS`]
//! fractional bits, shared by every participant in the mix.

/// Fractional bits used for sub-frame sample positions.
pub const FRAC_BITS: u32 = 13;

/// One whole frame in fractional-frame units.
pub const FRAC_ONE: i64 = 1 << FRAC_BITS;

/// Half a frame in fractional-frame units.
pub const FRAC_HALF: i64 = FRAC_ONE >> 1;

/// Mask selecting the fractional part of a fractional-frame position.
pub const FRAC_MASK: i64 = FRAC_ONE - 1;

/// Arithmetic overflow while applying or composing a timeline transform.
///
/// Indicates a pathological rate/offset combination. Callers must not
/// truncate: in the engine this is fatal to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timeline arithmetic overflow")]
pub struct TimelineOverflow;

/// Converts whole frames to fractional frames.
pub fn frames_to_frac(frames: i64) -> Result<i64, TimelineOverflow> {
    frames.checked_mul(FRAC_ONE).ok_or(TimelineOverflow)
}

/// Returns the whole-frame floor of a fractional-frame position.
///
/// Arithmetic shift, so negative positions floor toward negative infinity.
pub fn frac_floor(frac: i64) -> i64 {
    frac >> FRAC_BITS
}

/// Returns the whole-frame ceiling of a fractional-frame position.
pub fn frac_ceil(frac: i64) -> i64 {
    (frac + FRAC_MASK) >> FRAC_BITS
}

/// Rounds a fractional-frame position to the nearest whole frame.
pub fn frac_round(frac: i64) -> i64 {
    (frac + FRAC_HALF) >> FRAC_BITS
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// A reduced rational ratio `subject_delta / reference_delta`.
///
/// Scales reference-domain deltas into subject-domain deltas exactly. A rate
/// with `subject_delta == 0` is valid but not invertible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineRate {
    subject_delta: u64,
    reference_delta: u64,
}

impl TimelineRate {
    /// Creates a rate, reducing the ratio to lowest terms.
    ///
    /// `reference_delta` must be non-zero.
    pub fn new(subject_delta: u64, reference_delta: u64) -> Self {
        assert!(reference_delta != 0, "reference_delta must be non-zero");
        let g = gcd(subject_delta as u128, reference_delta as u128) as u64;
        if g <= 1 {
            return Self {
                subject_delta,
                reference_delta,
            };
        }
        Self {
            subject_delta: subject_delta / g,
            reference_delta: reference_delta / g,
        }
    }

    /// The 1:1 rate.
    pub const fn identity() -> Self {
        Self {
            subject_delta: 1,
            reference_delta: 1,
        }
    }

    /// Numerator of the reduced ratio.
    pub fn subject_delta(&self) -> u64 {
        self.subject_delta
    }

    /// Denominator of the reduced ratio.
    pub fn reference_delta(&self) -> u64 {
        self.reference_delta
    }

    /// True when this rate can be inverted (non-zero numerator).
    pub fn is_invertible(&self) -> bool {
        self.subject_delta != 0
    }

    /// Returns the inverse rate, or `None` when not invertible.
    pub fn inverse(&self) -> Option<Self> {
        if !self.is_invertible() {
            return None;
        }
        Some(Self {
            subject_delta: self.reference_delta,
            reference_delta: self.subject_delta,
        })
    }

    /// Scales a reference-domain delta into the subject domain.
    ///
    /// Floor semantics (rounds toward negative infinity) so that positions
    /// remain monotonic across zero.
    pub fn scale(&self, value: i64) -> Result<i64, TimelineOverflow> {
        let product = value as i128 * self.subject_delta as i128;
        let scaled = product.div_euclid(self.reference_delta as i128);
        i64::try_from(scaled).map_err(|_| TimelineOverflow)
    }

    /// Exact product of two rates, reduced to lowest terms.
    pub fn product(a: Self, b: Self) -> Result<Self, TimelineOverflow> {
        let num = a.subject_delta as u128 * b.subject_delta as u128;
        let den = a.reference_delta as u128 * b.reference_delta as u128;
        let g = gcd(num, den);
        let num = num / g;
        let den = den / g;
        if num > u64::MAX as u128 || den > u64::MAX as u128 {
            return Err(TimelineOverflow);
        }
        Ok(Self {
            subject_delta: num as u64,
            reference_delta: den as u64,
        })
    }
}

/// An affine rational mapping from a reference domain to a subject domain.
///
/// `subject = subject_time + rate * (reference - reference_time)`.
///
/// The engine represents "not yet anchored" mappings as
/// `Option<TimelineFunction>` at the use sites; a function that exists is
/// always applicable in the forward direction, and invertible exactly when
/// its rate is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineFunction {
    subject_time: i64,
    reference_time: i64,
    rate: TimelineRate,
}

impl TimelineFunction {
    /// Creates a function anchored at the given correspondence point.
    pub fn new(subject_time: i64, reference_time: i64, rate: TimelineRate) -> Self {
        Self {
            subject_time,
            reference_time,
            rate,
        }
    }

    /// The subject-domain anchor.
    pub fn subject_time(&self) -> i64 {
        self.subject_time
    }

    /// The reference-domain anchor.
    pub fn reference_time(&self) -> i64 {
        self.reference_time
    }

    /// The rate of the mapping.
    pub fn rate(&self) -> TimelineRate {
        self.rate
    }

    /// Maps a reference-domain value to the subject domain.
    pub fn apply(&self, reference: i64) -> Result<i64, TimelineOverflow> {
        let delta = reference.checked_sub(self.reference_time).ok_or(TimelineOverflow)?;
        let scaled = self.rate.scale(delta)?;
        self.subject_time.checked_add(scaled).ok_or(TimelineOverflow)
    }

    /// Maps a subject-domain value back to the reference domain.
    ///
    /// Fails with [`TimelineOverflow`] when the mapping is not invertible.
    pub fn apply_inverse(&self, subject: i64) -> Result<i64, TimelineOverflow> {
        let inverse_rate = self.rate.inverse().ok_or(TimelineOverflow)?;
        let delta = subject.checked_sub(self.subject_time).ok_or(TimelineOverflow)?;
        let scaled = inverse_rate.scale(delta)?;
        self.reference_time.checked_add(scaled).ok_or(TimelineOverflow)
    }

    /// Returns the inverse function, or `None` when the rate is not
    /// invertible.
    pub fn inverse(&self) -> Option<Self> {
        let rate = self.rate.inverse()?;
        Some(Self {
            subject_time: self.reference_time,
            reference_time: self.subject_time,
            rate,
        })
    }

    /// Composes two functions: the result maps `before`'s reference domain
    /// into `after`'s subject domain.
    ///
    /// `after`'s reference domain must be `before`'s subject domain.
    pub fn compose(after: &Self, before: &Self) -> Result<Self, TimelineOverflow> {
        Ok(Self {
            subject_time: after.apply(before.subject_time)?,
            reference_time: before.reference_time,
            rate: TimelineRate::product(after.rate, before.rate)?,
        })
    }
}
