//! Monte Carlo arithmetic backend with integer noise injection.
//!
//! Mirrors the quad backend's semantics for relative noise, but instead of
//! building a wide floating-point noise value it adds a signed random
//! integer directly to the bit pattern of the wide intermediate (binary64
//! for binary32 operations, binary128 for binary64 operations).
//!
//! The random 64-bit word is arithmetically right-shifted by
//! `1 + exp_size_of_wide_type - noise_exponent`, which lands the noise at
//! the ulp weight of the virtual precision while the extended sign bit
//! keeps it centered around zero. Because the noise rides on the bit
//! pattern it scales with the operand automatically; no exponent extraction
//! is needed.
//!
//! Only relative error is supported and the per-type precisions are fixed
//! to the source formats (24 and 53); attempts to change either are
//! configuration errors.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::common::constants::{binary32, binary64, binary128};
use crate::fpbits::{Binary128, FloatFmt};
use crate::logger;
use crate::rng::SeedSlot;
use crate::{Backend, BinOp, ErrorMode, InterfaceTable, McaMode};

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

/// Typed configuration record for the MCA integer backend.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct McaIntConf {
    /// Virtual precision for binary32 operations; must stay 24.
    pub precision_binary32: i32,
    /// Virtual precision for binary64 operations; must stay 53.
    pub precision_binary64: i32,
    /// Operating mode.
    pub mode: McaMode,
    /// Error magnitude policy; only `rel` is supported.
    pub error_mode: ErrorMode,
    /// Fixed seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Fraction of operations that get perturbed, in `(0, 1]`.
    pub sparsity: f32,
    /// Treat subnormal inputs as zero.
    pub daz: bool,
    /// Flush subnormal results to zero.
    pub ftz: bool,
}

impl Default for McaIntConf {
    fn default() -> Self {
        Self {
            precision_binary32: binary32::PREC as i32,
            precision_binary64: binary64::PREC as i32,
            mode: McaMode::default(),
            error_mode: ErrorMode::default(),
            seed: None,
            sparsity: 1.0,
            daz: false,
            ftz: false,
        }
    }
}

/// Context of the MCA integer backend.
#[derive(Debug)]
pub struct McaIntContext {
    mode: McaMode,
    binary32_precision: u32,
    binary64_precision: u32,
    sparsity: f32,
    daz: bool,
    ftz: bool,
    seed: u64,
    choose_seed: bool,
}

impl Default for McaIntContext {
    fn default() -> Self {
        Self {
            mode: McaMode::default(),
            binary32_precision: binary32::PREC,
            binary64_precision: binary64::PREC,
            sparsity: 1.0,
            daz: false,
            ftz: false,
            seed: 0,
            choose_seed: false,
        }
    }
}

impl McaIntContext {
    /// Sets the operating mode.
    pub fn set_mode(&mut self, mode: McaMode) {
        self.mode = mode;
    }

    /// Validates the binary32 virtual precision (only the default of 24 is
    /// accepted).
    pub fn set_precision_binary32(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision != binary32::PREC as i32 {
            return Err(ConfigError::PrecisionFixed {
                format: "binary32",
                expected: binary32::PREC,
            });
        }
        Ok(())
    }

    /// Validates the binary64 virtual precision (only the default of 53 is
    /// accepted).
    pub fn set_precision_binary64(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision != binary64::PREC as i32 {
            return Err(ConfigError::PrecisionFixed {
                format: "binary64",
                expected: binary64::PREC,
            });
        }
        Ok(())
    }

    /// Validates the error magnitude policy (only `rel` is implementable
    /// through bit-pattern noise).
    pub fn set_error_mode(&mut self, mode: ErrorMode) -> Result<(), ConfigError> {
        match mode {
            ErrorMode::Rel => Ok(()),
            ErrorMode::Abs => Err(ConfigError::UnsupportedErrorMode { mode: "abs" }),
            ErrorMode::All => Err(ConfigError::UnsupportedErrorMode { mode: "all" }),
        }
    }

    /// Sets the fraction of operations that get perturbed.
    pub fn set_sparsity(&mut self, sparsity: f32) -> Result<(), ConfigError> {
        if sparsity <= 0.0 {
            return Err(ConfigError::InvalidSparsity { value: sparsity });
        }
        self.sparsity = sparsity;
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

    /// Adds signed integer noise to the binary64 intermediate of a
    /// binary32 operation.
    fn inexact_binary64(&self, x: &mut f64) {
        RNG.with(|slot| {
            let mut slot = slot.borrow_mut();
            let state = slot.state();
            state.ensure_config(self.choose_seed, self.seed);
            if self.mode == McaMode::Ieee
                || !x.fp_class().is_perturbable()
                || (self.mode == McaMode::Rr && x.is_representable_at(self.binary32_precision))
            {
                return;
            }
            if state.skip_eval(self.sparsity) {
                return;
            }
            let noise_exponent = -(self.binary32_precision as i32 - 1);
            // sign (1) + exponent (11) + noise exponent.
            let shift = (1 + binary64::EXP_SIZE as i32 - noise_exponent) as u32;
            let noise = (state.next_u64() as i64) >> shift;
            *x = f64::from_bits((x.to_bits() as i64).wrapping_add(noise) as u64);
        });
    }

    /// Adds signed integer noise to the binary128 intermediate of a
    /// binary64 operation. Only 64 bits of noise are drawn; they are left
    /// aligned in the high word before the arithmetic shift.
    fn inexact_binary128(&self, x: &mut Binary128) {
        RNG.with(|slot| {
            let mut slot = slot.borrow_mut();
            let state = slot.state();
            state.ensure_config(self.choose_seed, self.seed);
            if self.mode == McaMode::Ieee
                || !x.fp_class().is_perturbable()
                || (self.mode == McaMode::Rr && x.is_representable_at(self.binary64_precision))
            {
                return;
            }
            if state.skip_eval(self.sparsity) {
                return;
            }
            let noise_exponent = -(self.binary64_precision as i32 - 1);
            // sign (1) + exponent (15) + noise exponent.
            let shift = (1 + binary128::EXP_SIZE as i32 - noise_exponent) as u32;
            let noise = (i128::from(state.next_u64() as i64) << 64) >> shift;
            *x = Binary128::from_bits((x.to_bits() as i128).wrapping_add(noise) as u128);
        });
    }

    fn binary_op_binary32(&self, a: f32, b: f32, op: BinOp) -> f32 {
        let mut wa = f64::from(if self.daz { a.daz() } else { a });
        let mut wb = f64::from(if self.daz { b.daz() } else { b });
        if self.mode.perturbs_inputs() {
            self.inexact_binary64(&mut wa);
            self.inexact_binary64(&mut wb);
        }
        let mut res = match op {
            BinOp::Add => wa + wb,
            BinOp::Sub => wa - wb,
            BinOp::Mul => wa * wb,
            BinOp::Div => wa / wb,
        };
        if self.mode.perturbs_output() {
            self.inexact_binary64(&mut res);
        }
        let out = res as f32;
        if self.ftz { out.ftz() } else { out }
    }

    fn fma_op_binary32(&self, a: f32, b: f32, c: f32) -> f32 {
        let mut wa = f64::from(if self.daz { a.daz() } else { a });
        let mut wb = f64::from(if self.daz { b.daz() } else { b });
        let mut wc = f64::from(if self.daz { c.daz() } else { c });
        if self.mode.perturbs_inputs() {
            self.inexact_binary64(&mut wa);
            self.inexact_binary64(&mut wb);
            self.inexact_binary64(&mut wc);
        }
        let mut res = wa.mul_add(wb, wc);
        if self.mode.perturbs_output() {
            self.inexact_binary64(&mut res);
        }
        let out = res as f32;
        if self.ftz { out.ftz() } else { out }
    }

    fn binary_op_binary64(&self, a: f64, b: f64, op: BinOp) -> f64 {
        let mut wa = Binary128::from(if self.daz { a.daz() } else { a });
        let mut wb = Binary128::from(if self.daz { b.daz() } else { b });
        if self.mode.perturbs_inputs() {
            self.inexact_binary128(&mut wa);
            self.inexact_binary128(&mut wb);
        }
        let mut res = match op {
            BinOp::Add => wa + wb,
            BinOp::Sub => wa - wb,
            BinOp::Mul => wa * wb,
            BinOp::Div => wa / wb,
        };
        if self.mode.perturbs_output() {
            self.inexact_binary128(&mut res);
        }
        let out = res.to_f64();
        if self.ftz { out.ftz() } else { out }
    }

    fn fma_op_binary64(&self, a: f64, b: f64, c: f64) -> f64 {
        let mut wa = Binary128::from(if self.daz { a.daz() } else { a });
        let mut wb = Binary128::from(if self.daz { b.daz() } else { b });
        let mut wc = Binary128::from(if self.daz { c.daz() } else { c });
        if self.mode.perturbs_inputs() {
            self.inexact_binary128(&mut wa);
            self.inexact_binary128(&mut wb);
            self.inexact_binary128(&mut wc);
        }
        let mut res = wa.mul_add(wb, wc);
        if self.mode.perturbs_output() {
            self.inexact_binary128(&mut res);
        }
        let out = res.to_f64();
        if self.ftz { out.ftz() } else { out }
    }

    fn cast_op(&self, a: f64) -> f32 {
        let mut wa = Binary128::from(if self.daz { a.daz() } else { a });
        if self.mode.perturbs_inputs() {
            self.inexact_binary128(&mut wa);
        }
        let mut res = Binary128::from(wa.to_f32());
        if self.mode.perturbs_output() {
            self.inexact_binary128(&mut res);
        }
        let out = res.to_f64();
        let out = if self.ftz { out.ftz() } else { out };
        out as f32
    }
}

fn add_binary32(ctx: &McaIntContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Add);
}

fn sub_binary32(ctx: &McaIntContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Sub);
}

fn mul_binary32(ctx: &McaIntContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Mul);
}

fn div_binary32(ctx: &McaIntContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Div);
}

fn add_binary64(ctx: &McaIntContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Add);
}

fn sub_binary64(ctx: &McaIntContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Sub);
}

fn mul_binary64(ctx: &McaIntContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Mul);
}

fn div_binary64(ctx: &McaIntContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Div);
}

fn fma_binary32(ctx: &McaIntContext, a: f32, b: f32, c: f32, out: &mut f32) {
    *out = ctx.fma_op_binary32(a, b, c);
}

fn fma_binary64(ctx: &McaIntContext, a: f64, b: f64, c: f64, out: &mut f64) {
    *out = ctx.fma_op_binary64(a, b, c);
}

fn cast_binary64_to_binary32(ctx: &McaIntContext, a: f64, out: &mut f32) {
    *out = ctx.cast_op(a);
}

impl Backend for McaIntContext {
    const NAME: &'static str = "mcaint";
    const VERSION: &'static str = "1.x-dev";
    type Conf = McaIntConf;

    fn pre_init() -> Self {
        logger::init(Self::NAME);
        Self::default()
    }

    fn configure(&mut self, conf: &McaIntConf) -> Result<(), ConfigError> {
        if let Some(seed) = conf.seed {
            self.set_seed(seed);
        }
        self.set_sparsity(conf.sparsity)?;
        self.set_precision_binary32(conf.precision_binary32)?;
        self.set_precision_binary64(conf.precision_binary64)?;
        self.set_mode(conf.mode);
        self.set_error_mode(conf.error_mode)?;
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
            logger::info(Self::NAME, "error-mode = rel");
            logger::info(Self::NAME, &format!("daz = {}", self.daz));
            logger::info(Self::NAME, &format!("ftz = {}", self.ftz));
            logger::info(Self::NAME, &format!("sparsity = {}", self.sparsity));
            logger::info(Self::NAME, &format!("seed = {}", self.seed));
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
