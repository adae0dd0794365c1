//! Bitmask backend.
//!
//! Perturbs values by operating directly on the mantissa bits below the
//! virtual precision: `zero` truncates them, `one` saturates them, `rand`
//! XORs them with a random word. The mask keeps the top `p` stored mantissa
//! bits (`mask = ones << (pman_size - p)`) and lives in the context,
//! recomputed whenever the precision is set.
//!
//! For subnormal values the significant range starts below the leading
//! zeros of the mantissa, so the effective precision shrinks by the
//! leading-zero count; once nothing of the significant range is left the
//! value passes through unmasked.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::common::constants::{binary32, binary64};
use crate::fpbits::FloatFmt;
use crate::logger;
use crate::rng::SeedSlot;
use crate::{Backend, BinOp, InterfaceTable};

thread_local! {
    static RNG: RefCell<SeedSlot> = const { RefCell::new(SeedSlot::new()) };
}

/// Saves this thread's random stream and restarts it from `seed`.
pub fn push_seed(seed: u64) {
    RNG.with(|slot| slot.borrow_mut().push_seed(seed));
}

/// Restores the stream saved by the last [`push_seed`].
pub fn pop_seed() {
    RNG.with(|slot| slot.borrow_mut().pop_seed());
}

/// Which side of the operation gets masked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitmaskMode {
    /// No masking at all.
    Ieee,
    /// Mask inputs and output.
    Full,
    /// Mask inputs only.
    Ib,
    /// Mask the output only.
    #[default]
    Ob,
}

impl BitmaskMode {
    #[inline]
    fn masks_inputs(self) -> bool {
        matches!(self, Self::Ib | Self::Full)
    }

    #[inline]
    fn masks_output(self) -> bool {
        matches!(self, Self::Ob | Self::Full)
    }
}

impl std::str::FromStr for BitmaskMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ieee" => Ok(Self::Ieee),
            "full" => Ok(Self::Full),
            "ib" => Ok(Self::Ib),
            "ob" => Ok(Self::Ob),
            _ => Err(ConfigError::InvalidMode {
                value: s.to_string(),
                accepted: "ieee, full, ib, ob",
            }),
        }
    }
}

impl std::fmt::Display for BitmaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ieee => "ieee",
            Self::Full => "full",
            Self::Ib => "ib",
            Self::Ob => "ob",
        })
    }
}

/// How the bits below the virtual precision are rewritten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitmaskOperator {
    /// Clear the low bits.
    #[default]
    Zero,
    /// Set the low bits.
    One,
    /// XOR the low bits with a random word.
    Rand,
}

impl std::str::FromStr for BitmaskOperator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(Self::Zero),
            "one" => Ok(Self::One),
            "rand" => Ok(Self::Rand),
            _ => Err(ConfigError::InvalidOperator {
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BitmaskOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Zero => "zero",
            Self::One => "one",
            Self::Rand => "rand",
        })
    }
}

/// Typed configuration record for the bitmask backend.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BitmaskConf {
    /// Virtual precision for binary32 values.
    pub precision_binary32: i32,
    /// Virtual precision for binary64 values.
    pub precision_binary64: i32,
    /// Which side of the operation gets masked.
    pub mode: BitmaskMode,
    /// How the low bits are rewritten.
    pub operator: BitmaskOperator,
    /// Fixed seed for the random operator; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Treat subnormal inputs as zero.
    pub daz: bool,
    /// Flush subnormal results to zero.
    pub ftz: bool,
}

impl Default for BitmaskConf {
    fn default() -> Self {
        Self {
            precision_binary32: binary32::PMAN_SIZE as i32,
            precision_binary64: binary64::PMAN_SIZE as i32,
            mode: BitmaskMode::default(),
            operator: BitmaskOperator::default(),
            seed: None,
            daz: false,
            ftz: false,
        }
    }
}

/// Context of the bitmask backend.
#[derive(Debug)]
pub struct BitmaskContext {
    mode: BitmaskMode,
    operator: BitmaskOperator,
    binary32_precision: u32,
    binary64_precision: u32,
    binary32_mask: u32,
    binary64_mask: u64,
    daz: bool,
    ftz: bool,
    seed: u64,
    choose_seed: bool,
}

impl Default for BitmaskContext {
    fn default() -> Self {
        Self {
            mode: BitmaskMode::default(),
            operator: BitmaskOperator::default(),
            binary32_precision: binary32::PMAN_SIZE,
            binary64_precision: binary64::PMAN_SIZE,
            binary32_mask: binary32::MASK_ONE,
            binary64_mask: binary64::MASK_ONE,
            daz: false,
            ftz: false,
            seed: 0,
            choose_seed: false,
        }
    }
}

impl BitmaskContext {
    /// Sets the masking mode.
    pub fn set_mode(&mut self, mode: BitmaskMode) {
        self.mode = mode;
    }

    /// Sets the mask operator.
    pub fn set_operator(&mut self, operator: BitmaskOperator) {
        self.operator = operator;
    }

    /// Sets the binary32 virtual precision and rebuilds the mask.
    pub fn set_precision_binary32(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision < 1 {
            return Err(ConfigError::InvalidPrecision {
                format: "binary32",
                value: i64::from(precision),
                min: 1,
                max: binary32::PMAN_SIZE,
            });
        }
        let precision = precision as u32;
        if precision > binary32::PMAN_SIZE {
            logger::warn(
                Self::NAME,
                &format!(
                    "precision ({precision}) for binary32 type is too high ({}), no noise will be added",
                    binary32::PMAN_SIZE
                ),
            );
        }
        self.binary32_precision = precision;
        self.binary32_mask = if precision >= binary32::PMAN_SIZE {
            binary32::MASK_ONE
        } else {
            binary32::MASK_ONE << (binary32::PMAN_SIZE - precision)
        };
        Ok(())
    }

    /// Sets the binary64 virtual precision and rebuilds the mask.
    pub fn set_precision_binary64(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision < 1 {
            return Err(ConfigError::InvalidPrecision {
                format: "binary64",
                value: i64::from(precision),
                min: 1,
                max: binary64::PMAN_SIZE,
            });
        }
        let precision = precision as u32;
        if precision > binary64::PMAN_SIZE {
            logger::warn(
                Self::NAME,
                &format!(
                    "precision ({precision}) for binary64 type is too high ({}), no noise will be added",
                    binary64::PMAN_SIZE
                ),
            );
        }
        self.binary64_precision = precision;
        self.binary64_mask = if precision >= binary64::PMAN_SIZE {
            binary64::MASK_ONE
        } else {
            binary64::MASK_ONE << (binary64::PMAN_SIZE - precision)
        };
        Ok(())
    }

    /// Fixes the random seed.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.choose_seed = true;
    }

    /// Enables or disables denormals-are-zero.
    pub fn set_daz(&mut self, daz: bool) {
        self.daz = daz;
    }

    /// Enables or disables flush-to-zero.
    pub fn set_ftz(&mut self, ftz: bool) {
        self.ftz = ftz;
    }

    fn inexact_binary32(&self, x: &mut f32) {
        if !x.fp_class().is_perturbable() {
            return;
        }
        if self.mode == BitmaskMode::Ob && x.is_representable_at(self.binary32_precision) {
            return;
        }
        let mut bits = x.to_bits();
        let mut mask = self.binary32_mask;
        if x.fp_class() == crate::fpbits::FpClass::Subnormal {
            // Shrink the effective precision by the leading zeros of the
            // mantissa so bits past the significant range stay untouched.
            let mantissa = bits & binary32::PMAN_MASK;
            let leading = binary32::PMAN_SIZE - (32 - mantissa.leading_zeros());
            if binary32::PMAN_SIZE < leading + self.binary32_precision {
                mask = binary32::MASK_ONE;
            } else {
                mask |=
                    binary32::MASK_ONE << (binary32::PMAN_SIZE - (leading + self.binary32_precision));
            }
        }
        match self.operator {
            BitmaskOperator::Zero => bits &= mask,
            BitmaskOperator::One => bits |= !mask,
            BitmaskOperator::Rand => {
                let rand_mask = RNG.with(|slot| {
                    let mut slot = slot.borrow_mut();
                    let state = slot.state();
                    state.ensure_config(self.choose_seed, self.seed);
                    state.next_u64() as u32
                });
                bits ^= !mask & rand_mask;
            }
        }
        *x = f32::from_bits(bits);
    }

    fn inexact_binary64(&self, x: &mut f64) {
        if !x.fp_class().is_perturbable() {
            return;
        }
        if self.mode == BitmaskMode::Ob && x.is_representable_at(self.binary64_precision) {
            return;
        }
        let mut bits = x.to_bits();
        let mut mask = self.binary64_mask;
        if x.fp_class() == crate::fpbits::FpClass::Subnormal {
            let mantissa = bits & binary64::PMAN_MASK;
            let leading = binary64::PMAN_SIZE - (64 - mantissa.leading_zeros());
            if binary64::PMAN_SIZE < leading + self.binary64_precision {
                mask = binary64::MASK_ONE;
            } else {
                mask |=
                    binary64::MASK_ONE << (binary64::PMAN_SIZE - (leading + self.binary64_precision));
            }
        }
        match self.operator {
            BitmaskOperator::Zero => bits &= mask,
            BitmaskOperator::One => bits |= !mask,
            BitmaskOperator::Rand => {
                let rand_mask = RNG.with(|slot| {
                    let mut slot = slot.borrow_mut();
                    let state = slot.state();
                    state.ensure_config(self.choose_seed, self.seed);
                    state.next_u64()
                });
                bits ^= !mask & rand_mask;
            }
        }
        *x = f64::from_bits(bits);
    }

    fn binary_op_binary32(&self, a: f32, b: f32, op: BinOp) -> f32 {
        let mut a = if self.daz { a.daz() } else { a };
        let mut b = if self.daz { b.daz() } else { b };
        if self.mode.masks_inputs() {
            self.inexact_binary32(&mut a);
            self.inexact_binary32(&mut b);
        }
        let mut res = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
        };
        if self.mode.masks_output() {
            self.inexact_binary32(&mut res);
        }
        if self.ftz { res.ftz() } else { res }
    }

    fn binary_op_binary64(&self, a: f64, b: f64, op: BinOp) -> f64 {
        let mut a = if self.daz { a.daz() } else { a };
        let mut b = if self.daz { b.daz() } else { b };
        if self.mode.masks_inputs() {
            self.inexact_binary64(&mut a);
            self.inexact_binary64(&mut b);
        }
        let mut res = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
        };
        if self.mode.masks_output() {
            self.inexact_binary64(&mut res);
        }
        if self.ftz { res.ftz() } else { res }
    }

    fn fma_op_binary32(&self, a: f32, b: f32, c: f32) -> f32 {
        let mut a = if self.daz { a.daz() } else { a };
        let mut b = if self.daz { b.daz() } else { b };
        let mut c = if self.daz { c.daz() } else { c };
        if self.mode.masks_inputs() {
            self.inexact_binary32(&mut a);
            self.inexact_binary32(&mut b);
            self.inexact_binary32(&mut c);
        }
        let mut res = a.mul_add(b, c);
        if self.mode.masks_output() {
            self.inexact_binary32(&mut res);
        }
        if self.ftz { res.ftz() } else { res }
    }

    fn fma_op_binary64(&self, a: f64, b: f64, c: f64) -> f64 {
        let mut a = if self.daz { a.daz() } else { a };
        let mut b = if self.daz { b.daz() } else { b };
        let mut c = if self.daz { c.daz() } else { c };
        if self.mode.masks_inputs() {
            self.inexact_binary64(&mut a);
            self.inexact_binary64(&mut b);
            self.inexact_binary64(&mut c);
        }
        let mut res = a.mul_add(b, c);
        if self.mode.masks_output() {
            self.inexact_binary64(&mut res);
        }
        if self.ftz { res.ftz() } else { res }
    }

    fn cast_op(&self, a: f64) -> f32 {
        let mut a = if self.daz { a.daz() } else { a };
        if self.mode.masks_inputs() {
            self.inexact_binary64(&mut a);
        }
        let mut res = f64::from(a as f32);
        if self.mode.masks_output() {
            self.inexact_binary64(&mut res);
        }
        if self.ftz {
            res = res.ftz();
        }
        res as f32
    }
}

fn add_binary32(ctx: &BitmaskContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Add);
}

fn sub_binary32(ctx: &BitmaskContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Sub);
}

fn mul_binary32(ctx: &BitmaskContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Mul);
}

fn div_binary32(ctx: &BitmaskContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Div);
}

fn add_binary64(ctx: &BitmaskContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Add);
}

fn sub_binary64(ctx: &BitmaskContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Sub);
}

fn mul_binary64(ctx: &BitmaskContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Mul);
}

fn div_binary64(ctx: &BitmaskContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Div);
}

fn fma_binary32(ctx: &BitmaskContext, a: f32, b: f32, c: f32, out: &mut f32) {
    *out = ctx.fma_op_binary32(a, b, c);
}

fn fma_binary64(ctx: &BitmaskContext, a: f64, b: f64, c: f64, out: &mut f64) {
    *out = ctx.fma_op_binary64(a, b, c);
}

fn cast_binary64_to_binary32(ctx: &BitmaskContext, a: f64, out: &mut f32) {
    *out = ctx.cast_op(a);
}

impl Backend for BitmaskContext {
    const NAME: &'static str = "bitmask";
    const VERSION: &'static str = "1.x-dev";
    type Conf = BitmaskConf;

    fn pre_init() -> Self {
        logger::init(Self::NAME);
        Self::default()
    }

    fn configure(&mut self, conf: &BitmaskConf) -> Result<(), ConfigError> {
        if let Some(seed) = conf.seed {
            self.set_seed(seed);
        }
        self.set_precision_binary32(conf.precision_binary32)?;
        self.set_precision_binary64(conf.precision_binary64)?;
        self.set_mode(conf.mode);
        self.set_operator(conf.operator);
        self.set_daz(conf.daz);
        self.set_ftz(conf.ftz);
        Ok(())
    }

    fn init(&self) -> InterfaceTable<Self> {
        if !logger::silent_load() {
            logger::info(Self::NAME, "load backend with:");
            logger::info(
                Self::NAME,
                &format!("precision-binary32 = {}", self.binary32_precision),
            );
            logger::info(
                Self::NAME,
                &format!("precision-binary64 = {}", self.binary64_precision),
            );
            logger::info(Self::NAME, &format!("mode = {}", self.mode));
            logger::info(Self::NAME, &format!("operator = {}", self.operator));
            logger::info(Self::NAME, &format!("daz = {}", self.daz));
            logger::info(Self::NAME, &format!("ftz = {}", self.ftz));
        }
        InterfaceTable {
            add_binary32: Some(add_binary32),
            sub_binary32: Some(sub_binary32),
            mul_binary32: Some(mul_binary32),
            div_binary32: Some(div_binary32),
            add_binary64: Some(add_binary64),
            sub_binary64: Some(sub_binary64),
            mul_binary64: Some(mul_binary64),
            div_binary64: Some(div_binary64),
            cast_binary64_to_binary32: Some(cast_binary64_to_binary32),
            fma_binary32: Some(fma_binary32),
            fma_binary64: Some(fma_binary64),
            ..InterfaceTable::default()
        }
    }
}
