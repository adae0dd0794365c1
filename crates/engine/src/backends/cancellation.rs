//! Cancellation backend.
//!
//! Watches additive operations for catastrophic cancellation. The
//! cancellation size of `c = a ± b` is `max(exp(a), exp(b)) - exp(c)`, the
//! number of leading bit positions eliminated by the operation. When it
//! reaches the configured tolerance the backend adds uniform noise at the
//! magnitude of the cancelled bits, `u * 2^(e_c - size + 1)` with
//! `u ∈ (-0.5, 0.5)`, so the garbage bits introduced by the cancellation
//! vary from run to run instead of silently pretending to be exact.
//!
//! Multiplications, divisions, casts and fused multiply-adds pass through
//! untouched.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::fpbits::{FloatFmt, scale_pow2_f64};
use crate::logger;
use crate::rng::{RngState, SeedSlot};
use crate::{Backend, InterfaceTable};

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

/// Typed configuration record for the cancellation backend.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConf {
    /// Smallest cancellation size that triggers noise.
    pub tolerance: i32,
    /// Log one record per triggered cancellation.
    pub warning: bool,
    /// Fixed seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for CancellationConf {
    fn default() -> Self {
        Self {
            tolerance: 1,
            warning: false,
            seed: None,
        }
    }
}

/// Context of the cancellation backend.
#[derive(Debug)]
pub struct CancellationContext {
    tolerance: i32,
    warning: bool,
    seed: u64,
    choose_seed: bool,
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self {
            tolerance: 1,
            warning: false,
            seed: 0,
            choose_seed: false,
        }
    }
}

/// Uniform noise `u * 2^e` with `u ∈ (-0.5, 0.5)`, drawn in binary64.
fn noise_binary64(e: i32, state: &mut RngState) -> f64 {
    scale_pow2_f64(state.next_unit_open() - 0.5, e)
}

impl CancellationContext {
    /// Sets the cancellation tolerance.
    pub fn set_tolerance(&mut self, tolerance: i32) -> Result<(), ConfigError> {
        if tolerance < 0 {
            return Err(ConfigError::InvalidTolerance {
                value: i64::from(tolerance),
            });
        }
        self.tolerance = tolerance;
        Ok(())
    }

    /// Enables or disables the per-cancellation warning.
    pub fn set_warning(&mut self, warning: bool) {
        self.warning = warning;
    }

    /// Fixes the random seed.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.choose_seed = true;
    }

    /// Checks an additive result and injects noise if the cancellation is
    /// large enough. Exponents are the raw biased fields minus the bias, so
    /// a fully cancelled (zero) result counts as a maximal cancellation.
    fn cancel_binary64(&self, a: f64, b: f64, res: &mut f64) {
        let e_res = res.unbiased_exponent();
        let size = a.unbiased_exponent().max(b.unbiased_exponent()) - e_res;
        if size >= self.tolerance {
            if self.warning {
                logger::info(
                    Self::NAME,
                    &format!("cancellation of size {size} detected"),
                );
            }
            let e_noise = e_res - (size - 1);
            *res += RNG.with(|slot| {
                let mut slot = slot.borrow_mut();
                let state = slot.state();
                state.ensure_config(self.choose_seed, self.seed);
                noise_binary64(e_noise, state)
            });
        }
    }

    fn cancel_binary32(&self, a: f32, b: f32, res: &mut f32) {
        let e_res = res.unbiased_exponent();
        let size = a.unbiased_exponent().max(b.unbiased_exponent()) - e_res;
        if size >= self.tolerance {
            if self.warning {
                logger::info(
                    Self::NAME,
                    &format!("cancellation of size {size} detected"),
                );
            }
            let e_noise = e_res - (size - 1);
            let noise = RNG.with(|slot| {
                let mut slot = slot.borrow_mut();
                let state = slot.state();
                state.ensure_config(self.choose_seed, self.seed);
                noise_binary64(e_noise, state)
            });
            // The noise is drawn in binary64 and the sum narrowed back.
            *res = (f64::from(*res) + noise) as f32;
        }
    }
}

fn add_binary32(ctx: &CancellationContext, a: f32, b: f32, out: &mut f32) {
    *out = a + b;
    ctx.cancel_binary32(a, b, out);
}

fn sub_binary32(ctx: &CancellationContext, a: f32, b: f32, out: &mut f32) {
    *out = a - b;
    ctx.cancel_binary32(a, b, out);
}

fn mul_binary32(_ctx: &CancellationContext, a: f32, b: f32, out: &mut f32) {
    *out = a * b;
}

fn div_binary32(_ctx: &CancellationContext, a: f32, b: f32, out: &mut f32) {
    *out = a / b;
}

fn add_binary64(ctx: &CancellationContext, a: f64, b: f64, out: &mut f64) {
    *out = a + b;
    ctx.cancel_binary64(a, b, out);
}

fn sub_binary64(ctx: &CancellationContext, a: f64, b: f64, out: &mut f64) {
    *out = a - b;
    ctx.cancel_binary64(a, b, out);
}

fn mul_binary64(_ctx: &CancellationContext, a: f64, b: f64, out: &mut f64) {
    *out = a * b;
}

fn div_binary64(_ctx: &CancellationContext, a: f64, b: f64, out: &mut f64) {
    *out = a / b;
}

fn fma_binary32(_ctx: &CancellationContext, a: f32, b: f32, c: f32, out: &mut f32) {
    *out = a.mul_add(b, c);
}

fn fma_binary64(_ctx: &CancellationContext, a: f64, b: f64, c: f64, out: &mut f64) {
    *out = a.mul_add(b, c);
}

fn cast_binary64_to_binary32(_ctx: &CancellationContext, a: f64, out: &mut f32) {
    *out = a as f32;
}

impl Backend for CancellationContext {
    const NAME: &'static str = "cancellation";
    const VERSION: &'static str = "1.x-dev";
    type Conf = CancellationConf;

    fn pre_init() -> Self {
        logger::init(Self::NAME);
        Self::default()
    }

    fn configure(&mut self, conf: &CancellationConf) -> Result<(), ConfigError> {
        self.set_tolerance(conf.tolerance)?;
        self.set_warning(conf.warning);
        if let Some(seed) = conf.seed {
            self.set_seed(seed);
        }
        Ok(())
    }

    fn init(&self) -> InterfaceTable<Self> {
        if !logger::silent_load() {
            logger::info(Self::NAME, "load backend with:");
            logger::info(Self::NAME, &format!("tolerance = {}", self.tolerance));
            logger::info(Self::NAME, &format!("warning = {}", self.warning));
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
