//! Float bit model.
//!
//! Packed views of the binary32/binary64/binary128 formats and the
//! predicates every backend builds on:
//! 1. **Classification:** [`FpClass`] without going through libm.
//! 2. **Exponent access:** raw biased field and unbiased value.
//! 3. **Representability:** whether a value survives truncation to a given
//!    virtual precision.
//! 4. **Policies:** denormals-are-zero and flush-to-zero, sign preserving.
//! 5. **Scaling:** `fast_pow2` for in-range exponents and `scale_pow2` as an
//!    exact power-of-two scaling over the full dynamic range.
//!
//! The three concrete types implement the [`FloatFmt`] capability trait;
//! [`Binary128`] is a software format since no native 128-bit float exists.

use crate::common::constants::{binary32, binary64};

mod quad;

pub use quad::Binary128;

/// Class of an IEEE-754 value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpClass {
    /// Positive or negative zero.
    Zero,
    /// Nonzero value below the normal range.
    Subnormal,
    /// Ordinary normalized value.
    Normal,
    /// Positive or negative infinity.
    Infinite,
    /// Not a number.
    Nan,
}

impl FpClass {
    /// Returns true for `Normal` and `Subnormal`, the only classes a
    /// perturbation may touch.
    #[inline]
    pub fn is_perturbable(self) -> bool {
        matches!(self, FpClass::Normal | FpClass::Subnormal)
    }
}

/// Capability trait for an IEEE binary format with a sign/exponent/mantissa
/// split and exact power-of-two scaling.
///
/// Implemented by `f32`, `f64` and [`Binary128`]. Backends that need to stay
/// monomorphic use the per-type helpers below instead of the trait.
pub trait FloatFmt: Copy {
    /// Sign field width in bits.
    const SIGN_SIZE: u32;
    /// Exponent field width in bits.
    const EXP_SIZE: u32;
    /// Stored mantissa width in bits.
    const PMAN_SIZE: u32;
    /// Significand width including the implicit bit.
    const PREC: u32;
    /// Exponent bias.
    const EXP_BIAS: i32;

    /// Classifies the value.
    fn fp_class(self) -> FpClass;

    /// Returns the exponent field minus the bias.
    ///
    /// For zeros and subnormals this is `-EXP_BIAS` (the raw field is zero),
    /// which is exactly what the cancellation detector relies on.
    fn unbiased_exponent(self) -> i32;

    /// Builds `2^e` directly from the exponent field.
    ///
    /// Fast path valid only for `e` in the normal range of the format.
    fn fast_pow2(e: i32) -> Self;

    /// Returns true when the value fits in `precision` stored mantissa bits,
    /// i.e. the mantissa is zero or its trailing-zero count is at least
    /// `PMAN_SIZE - precision`.
    fn is_representable_at(self, precision: u32) -> bool;

    /// Denormals-are-zero: subnormal values collapse to a zero of the same
    /// sign, everything else passes through.
    fn daz(self) -> Self;

    /// Flush-to-zero: identical to [`FloatFmt::daz`], applied to results.
    fn ftz(self) -> Self;

    /// Multiplies by `2^e` exactly, flushing below the dynamic range to a
    /// signed zero (rounding through the subnormal range) and overflowing to
    /// a signed infinity.
    fn scale_pow2(self, e: i32) -> Self;
}

impl FloatFmt for f32 {
    const SIGN_SIZE: u32 = binary32::SIGN_SIZE;
    const EXP_SIZE: u32 = binary32::EXP_SIZE;
    const PMAN_SIZE: u32 = binary32::PMAN_SIZE;
    const PREC: u32 = binary32::PREC;
    const EXP_BIAS: i32 = binary32::EXP_BIAS;

    #[inline]
    fn fp_class(self) -> FpClass {
        match self.classify() {
            std::num::FpCategory::Zero => FpClass::Zero,
            std::num::FpCategory::Subnormal => FpClass::Subnormal,
            std::num::FpCategory::Normal => FpClass::Normal,
            std::num::FpCategory::Infinite => FpClass::Infinite,
            std::num::FpCategory::Nan => FpClass::Nan,
        }
    }

    #[inline]
    fn unbiased_exponent(self) -> i32 {
        (((self.to_bits() & binary32::EXP_MASK) >> binary32::PMAN_SIZE) as i32) - binary32::EXP_BIAS
    }

    #[inline]
    fn fast_pow2(e: i32) -> Self {
        debug_assert!((1 - binary32::EXP_BIAS..=binary32::EXP_BIAS).contains(&e));
        f32::from_bits(((e + binary32::EXP_BIAS) as u32) << binary32::PMAN_SIZE)
    }

    #[inline]
    fn is_representable_at(self, precision: u32) -> bool {
        let mantissa = self.to_bits() & binary32::PMAN_MASK;
        if mantissa == 0 || precision >= binary32::PMAN_SIZE {
            true
        } else {
            mantissa.trailing_zeros() >= binary32::PMAN_SIZE - precision
        }
    }

    #[inline]
    fn daz(self) -> Self {
        if self.fp_class() == FpClass::Subnormal {
            f32::from_bits(self.to_bits() & binary32::SIGN_MASK)
        } else {
            self
        }
    }

    #[inline]
    fn ftz(self) -> Self {
        self.daz()
    }

    #[inline]
    fn scale_pow2(self, e: i32) -> Self {
        // f32 values and all their in-range power-of-two multiples are exact
        // in f64, so a single narrowing rounds correctly, including results
        // in the f32 subnormal range.
        scale_pow2_f64(f64::from(self), e) as f32
    }
}

impl FloatFmt for f64 {
    const SIGN_SIZE: u32 = binary64::SIGN_SIZE;
    const EXP_SIZE: u32 = binary64::EXP_SIZE;
    const PMAN_SIZE: u32 = binary64::PMAN_SIZE;
    const PREC: u32 = binary64::PREC;
    const EXP_BIAS: i32 = binary64::EXP_BIAS;

    #[inline]
    fn fp_class(self) -> FpClass {
        match self.classify() {
            std::num::FpCategory::Zero => FpClass::Zero,
            std::num::FpCategory::Subnormal => FpClass::Subnormal,
            std::num::FpCategory::Normal => FpClass::Normal,
            std::num::FpCategory::Infinite => FpClass::Infinite,
            std::num::FpCategory::Nan => FpClass::Nan,
        }
    }

    #[inline]
    fn unbiased_exponent(self) -> i32 {
        (((self.to_bits() & binary64::EXP_MASK) >> binary64::PMAN_SIZE) as i32) - binary64::EXP_BIAS
    }

    #[inline]
    fn fast_pow2(e: i32) -> Self {
        debug_assert!((1 - binary64::EXP_BIAS..=binary64::EXP_BIAS).contains(&e));
        f64::from_bits(((e + binary64::EXP_BIAS) as u64) << binary64::PMAN_SIZE)
    }

    #[inline]
    fn is_representable_at(self, precision: u32) -> bool {
        let mantissa = self.to_bits() & binary64::PMAN_MASK;
        if mantissa == 0 || precision >= binary64::PMAN_SIZE {
            true
        } else {
            mantissa.trailing_zeros() >= binary64::PMAN_SIZE - precision
        }
    }

    #[inline]
    fn daz(self) -> Self {
        if self.fp_class() == FpClass::Subnormal {
            f64::from_bits(self.to_bits() & binary64::SIGN_MASK)
        } else {
            self
        }
    }

    #[inline]
    fn ftz(self) -> Self {
        self.daz()
    }

    #[inline]
    fn scale_pow2(self, e: i32) -> Self {
        scale_pow2_f64(self, e)
    }
}

/// Multiplies an `f64` by `2^n` exactly over the full dynamic range.
///
/// Large scale factors are applied in steps that keep every intermediate
/// normal, so the only rounding happens in the final multiplication when the
/// result lands in the subnormal range.
pub fn scale_pow2_f64(x: f64, n: i32) -> f64 {
    const P1023: f64 = f64::from_bits(0x7FE0_0000_0000_0000); // 2^1023
    const P969M: f64 = f64::from_bits(0x0360_0000_0000_0000); // 2^-969

    let mut y = x;
    let mut n = n;
    if n > 1023 {
        y *= P1023;
        n -= 1023;
        if n > 1023 {
            y *= P1023;
            n -= 1023;
            n = n.min(1023);
        }
    } else if n < -1022 {
        y *= P969M;
        n += 969;
        if n < -1022 {
            y *= P969M;
            n += 969;
            n = n.max(-1022);
        }
    }
    y * f64::from_bits(((n + binary64::EXP_BIAS) as u64) << binary64::PMAN_SIZE)
}
