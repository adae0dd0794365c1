//! Variable-precision scalar rounding.
//!
//! Re-encodes a finite binary32/binary64 value as if it lived in a reduced
//! IEEE-like format with `precision` stored mantissa bits and a `range`-bit
//! exponent field:
//!
//! 1. Exponents above the target `emax` overflow to a signed infinity.
//! 2. Exponents below the target `emin` flush (under DAZ/FTZ), pass signed
//!    zeros through, or go through denormal rounding in a binary128
//!    intermediate: add half an ulp at the emin-normalized position,
//!    truncate, and resolve deep underflow to the smallest target subnormal
//!    or a signed zero.
//! 3. Normal values round to nearest with ties resolved by the lowest kept
//!    bit.
//!
//! With an absolute error bound configured, the effective precision is the
//! tighter of the relative precision and `exp - absErr_exp`, with the two
//! off-by-one cases just below the absolute threshold producing exactly
//! `±2^absErr_exp` or zero.

use serde::{Deserialize, Serialize};

use crate::ErrorMode;
use crate::common::ConfigError;
use crate::common::constants::{binary32, binary64, binary128};
use crate::fpbits::{Binary128, FloatFmt, scale_pow2_f64};

/// Whether a value is being rounded on its way into or out of an
/// operation. DAZ applies to inputs, FTZ to outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Operand side.
    Input,
    /// Result side.
    Output,
}

/// Well-known reduced formats, applying precision and range at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// IEEE binary16: 10 mantissa bits, 5 exponent bits.
    Binary16,
    /// IEEE binary32: 23 mantissa bits, 8 exponent bits.
    Binary32,
    /// bfloat16: 7 mantissa bits, 8 exponent bits.
    Bfloat16,
    /// NVIDIA TensorFloat-32: 10 mantissa bits, 8 exponent bits.
    TensorFloat,
    /// AMD fp24: 16 mantissa bits, 7 exponent bits.
    Fp24,
    /// Pixar PXR24: 15 mantissa bits, 8 exponent bits.
    Pxr24,
}

impl Preset {
    /// Stored mantissa bits of the preset format.
    pub fn precision(self) -> u32 {
        match self {
            Self::Binary16 => 10,
            Self::Binary32 => 23,
            Self::Bfloat16 => 7,
            Self::TensorFloat => 10,
            Self::Fp24 => 16,
            Self::Pxr24 => 15,
        }
    }

    /// Exponent field width of the preset format.
    pub fn range(self) -> u32 {
        match self {
            Self::Binary16 => 5,
            Self::Binary32 => 8,
            Self::Bfloat16 => 8,
            Self::TensorFloat => 8,
            Self::Fp24 => 7,
            Self::Pxr24 => 8,
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary16" => Ok(Self::Binary16),
            "binary32" => Ok(Self::Binary32),
            "bfloat16" => Ok(Self::Bfloat16),
            "tensorfloat" => Ok(Self::TensorFloat),
            "fp24" => Ok(Self::Fp24),
            "pxr24" => Ok(Self::Pxr24),
            _ => Err(ConfigError::InvalidMode {
                value: s.to_string(),
                accepted: "binary16, binary32, bfloat16, tensorfloat, fp24, pxr24",
            }),
        }
    }
}

/// Typed configuration record for the rounding context.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VprecConf {
    /// Target mantissa precision for binary32 values.
    pub precision_binary32: i32,
    /// Target exponent width for binary32 values.
    pub range_binary32: i32,
    /// Target mantissa precision for binary64 values.
    pub precision_binary64: i32,
    /// Target exponent width for binary64 values.
    pub range_binary64: i32,
    /// Error magnitude policy.
    pub error_mode: ErrorMode,
    /// Exponent of the maximum absolute error.
    pub max_abs_error_exponent: Option<i32>,
    /// Apply a preset format to both value types.
    pub preset: Option<Preset>,
    /// Treat subnormal inputs as zero.
    pub daz: bool,
    /// Flush subnormal results to zero.
    pub ftz: bool,
}

impl Default for VprecConf {
    fn default() -> Self {
        Self {
            precision_binary32: binary32::PMAN_SIZE as i32,
            range_binary32: binary32::EXP_SIZE as i32,
            precision_binary64: binary64::PMAN_SIZE as i32,
            range_binary64: binary64::EXP_SIZE as i32,
            error_mode: ErrorMode::default(),
            max_abs_error_exponent: None,
            preset: None,
            daz: false,
            ftz: false,
        }
    }
}

/// Rounding parameters: per-type precision and range plus the error and
/// subnormal policies.
#[derive(Clone, Copy, Debug)]
pub struct VprecContext {
    binary32_precision: u32,
    binary32_range: u32,
    binary64_precision: u32,
    binary64_range: u32,
    rel_err: bool,
    abs_err: bool,
    abs_err_exp: i32,
    daz: bool,
    ftz: bool,
}

impl Default for VprecContext {
    fn default() -> Self {
        Self {
            binary32_precision: binary32::PMAN_SIZE,
            binary32_range: binary32::EXP_SIZE,
            binary64_precision: binary64::PMAN_SIZE,
            binary64_range: binary64::EXP_SIZE,
            rel_err: true,
            abs_err: false,
            abs_err_exp: 1 - binary64::EXP_BIAS,
            daz: false,
            ftz: false,
        }
    }
}

impl VprecContext {
    /// Builds a context from a configuration record.
    pub fn from_conf(conf: &VprecConf) -> Result<Self, ConfigError> {
        let mut ctx = Self::default();
        ctx.set_precision_binary32(conf.precision_binary32)?;
        ctx.set_range_binary32(conf.range_binary32)?;
        ctx.set_precision_binary64(conf.precision_binary64)?;
        ctx.set_range_binary64(conf.range_binary64)?;
        ctx.set_error_mode(conf.error_mode);
        if let Some(exponent) = conf.max_abs_error_exponent {
            ctx.set_max_abs_error_exponent(exponent);
        }
        if let Some(preset) = conf.preset {
            ctx.apply_preset(preset);
        }
        ctx.set_daz(conf.daz);
        ctx.set_ftz(conf.ftz);
        Ok(ctx)
    }

    /// Sets the binary32 target precision, valid in `[1, 23]`.
    pub fn set_precision_binary32(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision < 1 || precision > binary32::PMAN_SIZE as i32 {
            return Err(ConfigError::InvalidPrecision {
                format: "binary32",
                value: i64::from(precision),
                min: 1,
                max: binary32::PMAN_SIZE,
            });
        }
        self.binary32_precision = precision as u32;
        Ok(())
    }

    /// Sets the binary32 target exponent width, valid in `[2, 8]`.
    pub fn set_range_binary32(&mut self, range: i32) -> Result<(), ConfigError> {
        if range < 2 || range > binary32::EXP_SIZE as i32 {
            return Err(ConfigError::InvalidRange {
                format: "binary32",
                value: i64::from(range),
                min: 2,
                max: binary32::EXP_SIZE,
            });
        }
        self.binary32_range = range as u32;
        Ok(())
    }

    /// Sets the binary64 target precision, valid in `[1, 52]`.
    pub fn set_precision_binary64(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision < 1 || precision > binary64::PMAN_SIZE as i32 {
            return Err(ConfigError::InvalidPrecision {
                format: "binary64",
                value: i64::from(precision),
                min: 1,
                max: binary64::PMAN_SIZE,
            });
        }
        self.binary64_precision = precision as u32;
        Ok(())
    }

    /// Sets the binary64 target exponent width, valid in `[2, 11]`.
    pub fn set_range_binary64(&mut self, range: i32) -> Result<(), ConfigError> {
        if range < 2 || range > binary64::EXP_SIZE as i32 {
            return Err(ConfigError::InvalidRange {
                format: "binary64",
                value: i64::from(range),
                min: 2,
                max: binary64::EXP_SIZE,
            });
        }
        self.binary64_range = range as u32;
        Ok(())
    }

    /// Applies a preset format to both value types.
    pub fn apply_preset(&mut self, preset: Preset) {
        self.binary32_precision = preset.precision();
        self.binary32_range = preset.range();
        self.binary64_precision = preset.precision();
        self.binary64_range = preset.range();
    }

    /// Sets the error magnitude policy.
    pub fn set_error_mode(&mut self, mode: ErrorMode) {
        match mode {
            ErrorMode::Rel => {
                self.rel_err = true;
                self.abs_err = false;
            }
            ErrorMode::Abs => {
                self.rel_err = false;
                self.abs_err = true;
            }
            ErrorMode::All => {
                self.rel_err = true;
                self.abs_err = true;
            }
        }
    }

    /// Sets the exponent of the maximum absolute error.
    pub fn set_max_abs_error_exponent(&mut self, exponent: i32) {
        self.abs_err_exp = exponent;
    }

    /// Enables or disables denormals-are-zero.
    pub fn set_daz(&mut self, daz: bool) {
        self.daz = daz;
    }

    /// Enables or disables flush-to-zero.
    pub fn set_ftz(&mut self, ftz: bool) {
        self.ftz = ftz;
    }

    /// The effective precision when an absolute error bound participates.
    fn adjusted_precision(&self, is_denormal: bool, exp_diff: i32, precision: u32, pman: u32) -> i32 {
        if is_denormal {
            if self.rel_err {
                if self.abs_err_exp.abs() < precision as i32 {
                    self.abs_err_exp
                } else {
                    precision as i32
                }
            } else {
                self.abs_err_exp
            }
        } else if self.rel_err {
            exp_diff.min(precision as i32)
        } else {
            exp_diff.min(pman as i32)
        }
    }
}

/// Whether truncating `mantissa` to `precision` stored bits must round up
/// (nearest, ties resolved by the lowest kept bit).
fn needs_rounding(mantissa: u128, pman_size: u32, precision: i32) -> bool {
    if precision >= pman_size as i32 {
        return false;
    }
    let k = (pman_size as i32 - precision) as u32;
    let trailing = mantissa & ((1u128 << k) - 1);
    let halfway = 1u128 << (k - 1);
    let kept = (mantissa >> k) & 1;
    trailing > halfway || (trailing == halfway && kept == 1)
}

/// Rounds the mantissa of a normal binary64 value to `precision` stored
/// bits by adding half an ulp when needed and truncating.
fn round_binary64_normal(x: f64, precision: i32) -> f64 {
    if precision >= binary64::PMAN_SIZE as i32 {
        return x;
    }
    let k = (binary64::PMAN_SIZE as i32 - precision) as u32;
    let mantissa = u128::from(x.to_bits() & binary64::PMAN_MASK);
    let mut y = x;
    if needs_rounding(mantissa, binary64::PMAN_SIZE, precision) {
        let half_ulp = scale_pow2_f64(1.0, x.unbiased_exponent() - precision - 1).copysign(x);
        y += half_ulp;
    }
    f64::from_bits(y.to_bits() & !((1u64 << k) - 1))
}

/// Rounds the mantissa of a normal binary32 value to `precision` stored
/// bits.
fn round_binary32_normal(x: f32, precision: i32) -> f32 {
    if precision >= binary32::PMAN_SIZE as i32 {
        return x;
    }
    let k = (binary32::PMAN_SIZE as i32 - precision) as u32;
    let mantissa = u128::from(x.to_bits() & binary32::PMAN_MASK);
    let mut y = x;
    if needs_rounding(mantissa, binary32::PMAN_SIZE, precision) {
        let half_ulp =
            (scale_pow2_f64(1.0, x.unbiased_exponent() - precision - 1) as f32).copysign(x);
        y += half_ulp;
    }
    f32::from_bits(y.to_bits() & !((1u32 << k) - 1))
}

/// Resolves a value below the target subnormal range to the smallest target
/// subnormal or a signed zero, splitting at half the smallest subnormal.
fn round_underflow(x: f64, emin: i32, precision: i32) -> f64 {
    let half_smallest = scale_pow2_f64(1.0, emin - precision - 1);
    if x.abs() >= half_smallest {
        scale_pow2_f64(1.0, emin - precision).copysign(x)
    } else {
        0.0f64.copysign(x)
    }
}

/// Denormal rounding in a binary128 intermediate: add half an ulp at the
/// emin-normalized position, truncate the bits below it, and resolve deep
/// underflow against half the smallest target subnormal.
fn round_denormal(x: f64, emin: i32, precision: i32) -> f64 {
    let sign = x.is_sign_negative();
    let half_ulp_exp = emin - precision - 1;
    let mut b = Binary128::from(x);
    // The value is normal in binary128; its distance below the target emin
    // is precision lost to the denormalized encoding.
    let precision_loss = emin - b.unbiased_exponent();
    let adjusted = precision - precision_loss;
    if needs_rounding(b.mantissa_field(), binary128::PMAN_SIZE, adjusted) {
        let half_ulp =
            Binary128::from_parts(sign, (half_ulp_exp + binary128::EXP_BIAS) as u32, 0);
        b = b + half_ulp;
    }
    let k = (binary128::PMAN_SIZE as i32 - adjusted).clamp(0, 127) as u32;
    let truncated = b.mantissa_field() & (u128::MAX << k) & binary128::PMAN_MASK;
    b = Binary128::from_parts(sign, b.exponent_field(), truncated);
    if b.unbiased_exponent() <= half_ulp_exp + 1 {
        if b.unbiased_exponent() >= half_ulp_exp {
            b = Binary128::from_parts(sign, (half_ulp_exp + 1 + binary128::EXP_BIAS) as u32, 0);
        } else {
            b = Binary128::from_parts(sign, 0, 0);
        }
    }
    b.to_f64()
}

/// Denormal handling for binary64 values: deep underflow resolves natively,
/// anything else goes through the binary128 denormal rounding.
fn handle_denormal_binary64(x: f64, emin: i32, precision: i32) -> f64 {
    if x.unbiased_exponent() < emin - precision {
        round_underflow(x, emin, precision)
    } else if precision <= binary64::PMAN_SIZE as i32 {
        round_denormal(x, emin, precision)
    } else {
        x
    }
}

/// Denormal handling for binary32 values.
fn handle_denormal_binary32(x: f32, emin: i32, precision: i32) -> f32 {
    if x.unbiased_exponent() < emin - precision {
        round_underflow(f64::from(x), emin, precision) as f32
    } else if precision <= binary32::PMAN_SIZE as i32 {
        round_denormal(f64::from(x), emin, precision) as f32
    } else {
        x
    }
}

/// Normal-range rounding under an absolute error bound.
fn normal_abs_err_binary64(x: f64, exp: i32, precision: u32, ctx: &VprecContext) -> f64 {
    let exp_diff = exp - ctx.abs_err_exp;
    if exp_diff < -1 {
        // Underflow on the precision given by the absolute error.
        0.0f64.copysign(x)
    } else if exp_diff == -1 {
        // Just below the absolute threshold: rounds to one ulp of the
        // absolute-error format, which plain mantissa rounding cannot
        // produce.
        scale_pow2_f64(1.0, ctx.abs_err_exp).copysign(x)
    } else {
        let adjusted = ctx.adjusted_precision(false, exp_diff, precision, binary64::PMAN_SIZE);
        round_binary64_normal(x, adjusted)
    }
}

/// Normal-range rounding under an absolute error bound, binary32.
fn normal_abs_err_binary32(x: f32, exp: i32, precision: u32, ctx: &VprecContext) -> f32 {
    let exp_diff = exp - ctx.abs_err_exp;
    if exp_diff < -1 {
        0.0f32.copysign(x)
    } else if exp_diff == -1 {
        (scale_pow2_f64(1.0, ctx.abs_err_exp) as f32).copysign(x)
    } else {
        let adjusted = ctx.adjusted_precision(false, exp_diff, precision, binary32::PMAN_SIZE);
        round_binary32_normal(x, adjusted)
    }
}

/// Rounds a binary64 value into the context's binary64 target format.
pub fn round_binary64(x: f64, direction: Direction, ctx: &VprecContext) -> f64 {
    if !x.is_finite() {
        return x;
    }
    let emax = (1i32 << (ctx.binary64_range - 1)) - 1;
    let emin = 1 - emax;
    let exp = x.unbiased_exponent();
    if exp > emax {
        // Overflow in the target range, preserving the sign.
        return x * f64::INFINITY;
    }
    if exp < emin {
        if (ctx.daz && direction == Direction::Input) || (ctx.ftz && direction == Direction::Output)
        {
            return x * 0.0;
        }
        if x == 0.0 {
            return x;
        }
        let precision = if ctx.abs_err {
            ctx.adjusted_precision(true, 0, ctx.binary64_precision, binary64::PMAN_SIZE)
        } else {
            ctx.binary64_precision as i32
        };
        return handle_denormal_binary64(x, emin, precision);
    }
    let rounded = if ctx.abs_err {
        normal_abs_err_binary64(x, exp, ctx.binary64_precision, ctx)
    } else {
        round_binary64_normal(x, ctx.binary64_precision as i32)
    };
    // Mantissa rounding in the top binade can carry past emax; overflow to
    // infinity here so rounding stays idempotent.
    if rounded.is_finite() && rounded != 0.0 && rounded.unbiased_exponent() > emax {
        return rounded * f64::INFINITY;
    }
    rounded
}

/// Rounds a binary32 value into the context's binary32 target format.
pub fn round_binary32(x: f32, direction: Direction, ctx: &VprecContext) -> f32 {
    if !x.is_finite() {
        return x;
    }
    let emax = (1i32 << (ctx.binary32_range - 1)) - 1;
    let emin = 1 - emax;
    let exp = x.unbiased_exponent();
    if exp > emax {
        return x * f32::INFINITY;
    }
    if exp < emin {
        if (ctx.daz && direction == Direction::Input) || (ctx.ftz && direction == Direction::Output)
        {
            return x * 0.0;
        }
        if x == 0.0 {
            return x;
        }
        let precision = if ctx.abs_err {
            ctx.adjusted_precision(true, 0, ctx.binary32_precision, binary32::PMAN_SIZE)
        } else {
            ctx.binary32_precision as i32
        };
        return handle_denormal_binary32(x, emin, precision);
    }
    let rounded = if ctx.abs_err {
        normal_abs_err_binary32(x, exp, ctx.binary32_precision, ctx)
    } else {
        round_binary32_normal(x, ctx.binary32_precision as i32)
    };
    if rounded.is_finite() && rounded != 0.0 && rounded.unbiased_exponent() > emax {
        return rounded * f32::INFINITY;
    }
    rounded
}
