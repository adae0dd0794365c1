//! Monte Carlo arithmetic engine.
//!
//! This crate implements the perturbation backends of a floating-point
//! uncertainty-quantification framework:
//! 1. **Backends:** `ieee` (reference, counters, tracing), `bitmask`
//!    (mantissa truncation/saturation/randomization), `cancellation`
//!    (noise at the magnitude of cancelled bits), `mcaquad` (Monte Carlo
//!    arithmetic in a wider intermediate) and `mcaint` (the same through
//!    integer bit-pattern noise).
//! 2. **Substrate:** the float bit model (binary32/64 plus a software
//!    binary128), per-thread RNG state with seed push/pop, DAZ/FTZ
//!    policies, and the variable-precision scalar rounding.
//! 3. **Contract:** the [`Backend`] lifecycle, the [`InterfaceTable`] of
//!    optional hooks, and the [`Dispatch`] host wrapper with native IEEE
//!    fallbacks.
//!
//! A host instruments its floating-point operations by routing them
//! through a loaded backend:
//!
//! ```
//! use mcasim_core::{Backend, Dispatch};
//! use mcasim_core::backends::mcaquad::{McaQuadConf, McaQuadContext};
//!
//! let mut ctx = McaQuadContext::pre_init();
//! ctx.configure(&McaQuadConf {
//!     seed: Some(42),
//!     ..McaQuadConf::default()
//! })?;
//! let host = Dispatch::load(ctx);
//! // Perturbed at the default virtual precision of 53 bits.
//! let sum = host.add_binary64(0.1, 0.2);
//! assert!((sum - 0.3).abs() < 1e-15);
//! # Ok::<(), mcasim_core::ConfigError>(())
//! ```

/// Perturbation backends and the host loading contract.
pub mod backends;
/// Shared constants and error types.
pub mod common;
/// Float bit model (binary32/64/128, classification, policies).
pub mod fpbits;
/// Logging policy shared by the backends.
pub mod logger;
/// Per-thread random number generation.
pub mod rng;
/// Variable-precision scalar rounding.
pub mod vprec;

pub use backends::{
    Backend, Dispatch, ErrorMode, FcmpPredicate, InterfaceTable, McaMode, UserCall, ValueMut,
};
pub(crate) use backends::BinOp;
pub use common::ConfigError;
pub use fpbits::{Binary128, FloatFmt, FpClass};
