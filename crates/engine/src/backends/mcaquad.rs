//! Monte Carlo arithmetic backend over a wider intermediate type.
//!
//! Every operation runs in a format wide enough to hold the exact ulp-level
//! noise of its operands: binary64 for binary32 operations and the software
//! [`Binary128`] for binary64 operations. Depending on the mode, uniform
//! noise is added to the inputs (`pb`), the output (`rr`) or both (`mca`).
//!
//! Relative noise for a value with unbiased exponent `e` at virtual
//! precision `p` is `u * 2^(e - p + 1)` with `u ∈ (-0.5, 0.5)`; absolute
//! noise is `u * 2^absErr_exp`. Specials are never perturbed, `rr` skips
//! values already representable at the virtual precision, and a sparsity
//! below one perturbs only that fraction of operations.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::common::constants::{binary32, binary64, binary128};
use crate::fpbits::{Binary128, FloatFmt, scale_pow2_f64};
use crate::logger;
use crate::rng::{RngState, SeedSlot};
use crate::{Backend, BinOp, ErrorMode, InterfaceTable, McaMode, UserCall, ValueMut};

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

/// Typed configuration record for the MCA quad backend.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct McaQuadConf {
    /// Virtual precision for binary32 operations.
    pub precision_binary32: i32,
    /// Virtual precision for binary64 operations.
    pub precision_binary64: i32,
    /// Operating mode.
    pub mode: McaMode,
    /// Error magnitude policy.
    pub error_mode: ErrorMode,
    /// Exponent of the maximum absolute error.
    pub max_abs_error_exponent: Option<i32>,
    /// Fixed seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Fraction of operations that get perturbed, in `(0, 1]`.
    pub sparsity: f32,
    /// Treat subnormal inputs as zero.
    pub daz: bool,
    /// Flush subnormal results to zero.
    pub ftz: bool,
}

impl Default for McaQuadConf {
    fn default() -> Self {
        Self {
            precision_binary32: binary32::PREC as i32,
            precision_binary64: binary64::PREC as i32,
            mode: McaMode::default(),
            error_mode: ErrorMode::default(),
            max_abs_error_exponent: None,
            seed: None,
            sparsity: 1.0,
            daz: false,
            ftz: false,
        }
    }
}

/// Context of the MCA quad backend.
#[derive(Debug)]
pub struct McaQuadContext {
    mode: McaMode,
    binary32_precision: u32,
    binary64_precision: u32,
    rel_err: bool,
    abs_err: bool,
    abs_err_exp: i32,
    sparsity: f32,
    daz: bool,
    ftz: bool,
    seed: u64,
    choose_seed: bool,
}

impl Default for McaQuadContext {
    fn default() -> Self {
        Self {
            mode: McaMode::default(),
            binary32_precision: binary32::PREC,
            binary64_precision: binary64::PREC,
            rel_err: true,
            abs_err: false,
            abs_err_exp: 112,
            sparsity: 1.0,
            daz: false,
            ftz: false,
            seed: 0,
            choose_seed: false,
        }
    }
}

/// Uniform noise `u * 2^e` with `u ∈ (-0.5, 0.5)`, in binary64.
fn noise_binary64(e: i32, state: &mut RngState) -> f64 {
    scale_pow2_f64(state.next_unit_open() - 0.5, e)
}

/// Uniform noise `u * 2^e` with `u ∈ (-0.5, 0.5)`, in binary128.
fn noise_binary128(e: i32, state: &mut RngState) -> Binary128 {
    Binary128::from(state.next_unit_open() - 0.5).scale_pow2(e)
}

impl McaQuadContext {
    /// Sets the operating mode.
    pub fn set_mode(&mut self, mode: McaMode) {
        self.mode = mode;
    }

    /// Sets the binary32 virtual precision.
    ///
    /// The noise lives in the binary64 intermediate, so precisions up to
    /// the binary64 mantissa size are meaningful; larger values only earn a
    /// warning because no noise survives the narrowing.
    pub fn set_precision_binary32(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision < 1 {
            return Err(ConfigError::InvalidPrecision {
                format: "binary32",
                value: i64::from(precision),
                min: 1,
                max: binary64::PMAN_SIZE,
            });
        }
        if precision as u32 > binary64::PMAN_SIZE {
            logger::warn(
                Self::NAME,
                &format!(
                    "precision ({precision}) for binary32 type is too high ({}), no noise will be added",
                    binary64::PMAN_SIZE
                ),
            );
        }
        self.binary32_precision = precision as u32;
        Ok(())
    }

    /// Sets the binary64 virtual precision (noise lives in binary128).
    pub fn set_precision_binary64(&mut self, precision: i32) -> Result<(), ConfigError> {
        if precision < 1 {
            return Err(ConfigError::InvalidPrecision {
                format: "binary64",
                value: i64::from(precision),
                min: 1,
                max: binary128::PMAN_SIZE,
            });
        }
        if precision as u32 > binary128::PMAN_SIZE {
            logger::warn(
                Self::NAME,
                &format!(
                    "precision ({precision}) for binary64 type is too high ({}), no noise will be added",
                    binary128::PMAN_SIZE
                ),
            );
        }
        self.binary64_precision = precision as u32;
        Ok(())
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

    fn error_mode_name(&self) -> &'static str {
        match (self.rel_err, self.abs_err) {
            (true, true) => "all",
            (true, false) => "rel",
            (false, true) => "abs",
            (false, false) => "none",
        }
    }

    /// Perturbs the binary64 intermediate of a binary32 operation.
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
            if self.rel_err {
                let e = x.unbiased_exponent();
                *x += noise_binary64(e - (self.binary32_precision as i32 - 1), state);
            }
            if self.abs_err {
                *x += noise_binary64(self.abs_err_exp, state);
            }
        });
    }

    /// Perturbs the binary128 intermediate of a binary64 operation.
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
            if self.rel_err {
                let e = x.unbiased_exponent();
                *x = *x + noise_binary128(e - (self.binary64_precision as i32 - 1), state);
            }
            if self.abs_err {
                *x = *x + noise_binary128(self.abs_err_exp, state);
            }
        });
    }

    /// Unconditional relative perturbation used by the `inexact` user call:
    /// no representability or sparsity gate, only the special-value and
    /// ieee-mode guards.
    fn fast_inexact_binary64(&self, x: &mut f64, precision: i32) {
        RNG.with(|slot| {
            let mut slot = slot.borrow_mut();
            let state = slot.state();
            state.ensure_config(self.choose_seed, self.seed);
            if self.mode == McaMode::Ieee || !x.fp_class().is_perturbable() {
                return;
            }
            let e = x.unbiased_exponent();
            *x += noise_binary64(e - (precision - 1), state);
        });
    }

    fn fast_inexact_binary128(&self, x: &mut Binary128, precision: i32) {
        RNG.with(|slot| {
            let mut slot = slot.borrow_mut();
            let state = slot.state();
            state.ensure_config(self.choose_seed, self.seed);
            if self.mode == McaMode::Ieee || !x.fp_class().is_perturbable() {
                return;
            }
            let e = x.unbiased_exponent();
            *x = *x + noise_binary128(e - (precision - 1), state);
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

    /// Lossy cast, handled as a unary operation in the binary128
    /// intermediate: the input side perturbs the widened double, the value
    /// is rounded to binary32 inside the intermediate, and the output side
    /// perturbs that before the final narrowing.
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

fn add_binary32(ctx: &McaQuadContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Add);
}

fn sub_binary32(ctx: &McaQuadContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Sub);
}

fn mul_binary32(ctx: &McaQuadContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Mul);
}

fn div_binary32(ctx: &McaQuadContext, a: f32, b: f32, out: &mut f32) {
    *out = ctx.binary_op_binary32(a, b, BinOp::Div);
}

fn add_binary64(ctx: &McaQuadContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Add);
}

fn sub_binary64(ctx: &McaQuadContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Sub);
}

fn mul_binary64(ctx: &McaQuadContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Mul);
}

fn div_binary64(ctx: &McaQuadContext, a: f64, b: f64, out: &mut f64) {
    *out = ctx.binary_op_binary64(a, b, BinOp::Div);
}

fn fma_binary32(ctx: &McaQuadContext, a: f32, b: f32, c: f32, out: &mut f32) {
    *out = ctx.fma_op_binary32(a, b, c);
}

fn fma_binary64(ctx: &McaQuadContext, a: f64, b: f64, c: f64, out: &mut f64) {
    *out = ctx.fma_op_binary64(a, b, c);
}

fn cast_binary64_to_binary32(ctx: &McaQuadContext, a: f64, out: &mut f32) {
    *out = ctx.cast_op(a);
}

fn user_call(ctx: &mut McaQuadContext, call: UserCall<'_>) {
    match call {
        UserCall::Inexact { value, precision } => match value {
            ValueMut::Binary32(v) => {
                let mut wide = f64::from(*v);
                let target = if precision <= 0 {
                    ctx.binary32_precision as i32 + precision
                } else {
                    precision
                };
                ctx.fast_inexact_binary64(&mut wide, target);
                *v = wide as f32;
            }
            ValueMut::Binary64(v) => {
                let mut wide = Binary128::from(*v);
                let target = if precision <= 0 {
                    ctx.binary64_precision as i32 + precision
                } else {
                    precision
                };
                ctx.fast_inexact_binary128(&mut wide, target);
                *v = wide.to_f64();
            }
            // binary128 values carry no context precision; the request's
            // precision is used as given.
            ValueMut::Binary128(v) => ctx.fast_inexact_binary128(v, precision),
        },
        UserCall::SetPrecisionBinary32(precision) => {
            if let Err(err) = ctx.set_precision_binary32(precision) {
                logger::fatal(McaQuadContext::NAME, &err.to_string());
            }
        }
        UserCall::SetPrecisionBinary64(precision) => {
            if let Err(err) = ctx.set_precision_binary64(precision) {
                logger::fatal(McaQuadContext::NAME, &err.to_string());
            }
        }
        other => {
            logger::warn(
                McaQuadContext::NAME,
                &format!("unknown user call {other:?}"),
            );
        }
    }
}

impl Backend for McaQuadContext {
    const NAME: &'static str = "mcaquad";
    const VERSION: &'static str = "1.x-dev";
    type Conf = McaQuadConf;

    fn pre_init() -> Self {
        logger::init(Self::NAME);
        Self::default()
    }

    fn configure(&mut self, conf: &McaQuadConf) -> Result<(), ConfigError> {
        if let Some(seed) = conf.seed {
            self.set_seed(seed);
        }
        self.set_sparsity(conf.sparsity)?;
        self.set_precision_binary32(conf.precision_binary32)?;
        self.set_precision_binary64(conf.precision_binary64)?;
        self.set_mode(conf.mode);
        self.set_error_mode(conf.error_mode);
        if let Some(exponent) = conf.max_abs_error_exponent {
            self.set_max_abs_error_exponent(exponent);
        }
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
            logger::info(
                Self::NAME,
                &format!("error-mode = {}", self.error_mode_name()),
            );
            logger::info(
                Self::NAME,
                &format!("max-abs-error-exponent = {}", self.abs_err_exp),
            );
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
            user_call: Some(user_call),
            ..InterfaceTable::default()
        }
    }
}
