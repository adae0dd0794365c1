//! Perturbation backends and the loading contract between them and a host.
//!
//! A backend is a context type implementing [`Backend`]:
//! 1. **`pre_init`** builds the context with its defaults and initializes
//!    the logger.
//! 2. **`configure`** applies a typed configuration record, validating every
//!    field. Command-line parsing is the host's concern; the `mcasim` binary
//!    maps the documented flag names onto these records.
//! 3. **`init`** logs the load banner (unless `VFC_BACKENDS_SILENT_LOAD` is
//!    set) and returns the [`InterfaceTable`] of hook entry points.
//!
//! The table is the sole runtime contract: each entry is optional, and a
//! host falls back to the native IEEE operation for entries a backend left
//! empty. [`Dispatch`] implements exactly that fallback.

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::fpbits::Binary128;

pub mod bitmask;
pub mod cancellation;
pub mod ieee;
pub mod mcaint;
pub mod mcaquad;

/// Floating-point comparison predicates, one per LLVM `fcmp` condition.
///
/// Ordered predicates are false when either operand is NaN; unordered
/// predicates are true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcmpPredicate {
    /// Always false.
    False,
    /// Ordered and equal.
    Oeq,
    /// Ordered and greater than.
    Ogt,
    /// Ordered and greater than or equal.
    Oge,
    /// Ordered and less than.
    Olt,
    /// Ordered and less than or equal.
    Ole,
    /// Ordered and not equal.
    One,
    /// Ordered (neither operand is NaN).
    Ord,
    /// Unordered (either operand is NaN).
    Uno,
    /// Unordered or equal.
    Ueq,
    /// Unordered or greater than.
    Ugt,
    /// Unordered or greater than or equal.
    Uge,
    /// Unordered or less than.
    Ult,
    /// Unordered or less than or equal.
    Ule,
    /// Unordered or not equal.
    Une,
    /// Always true.
    True,
}

impl FcmpPredicate {
    /// Evaluates the predicate with IEEE NaN semantics.
    pub fn eval<T: PartialOrd>(self, a: T, b: T) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        let ord = a.partial_cmp(&b);
        match self {
            Self::False => false,
            Self::Oeq => ord == Some(Equal),
            Self::Ogt => ord == Some(Greater),
            Self::Oge => matches!(ord, Some(Greater | Equal)),
            Self::Olt => ord == Some(Less),
            Self::Ole => matches!(ord, Some(Less | Equal)),
            Self::One => matches!(ord, Some(Less | Greater)),
            Self::Ord => ord.is_some(),
            Self::Uno => ord.is_none(),
            Self::Ueq => !matches!(ord, Some(Less | Greater)),
            Self::Ugt => !matches!(ord, Some(Less | Equal)),
            Self::Uge => ord != Some(Less),
            Self::Ult => !matches!(ord, Some(Greater | Equal)),
            Self::Ule => ord != Some(Greater),
            Self::Une => ord != Some(Equal),
            Self::True => true,
        }
    }
}

impl std::fmt::Display for FcmpPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::False => "FCMP_FALSE",
            Self::Oeq => "FCMP_OEQ",
            Self::Ogt => "FCMP_OGT",
            Self::Oge => "FCMP_OGE",
            Self::Olt => "FCMP_OLT",
            Self::Ole => "FCMP_OLE",
            Self::One => "FCMP_ONE",
            Self::Ord => "FCMP_ORD",
            Self::Uno => "FCMP_UNO",
            Self::Ueq => "FCMP_UEQ",
            Self::Ugt => "FCMP_UGT",
            Self::Uge => "FCMP_UGE",
            Self::Ult => "FCMP_ULT",
            Self::Ule => "FCMP_ULE",
            Self::Une => "FCMP_UNE",
            Self::True => "FCMP_TRUE",
        };
        f.write_str(name)
    }
}

/// Monte Carlo operating mode shared by the `mcaquad` and `mcaint`
/// backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McaMode {
    /// Plain IEEE, no perturbation.
    Ieee,
    /// Perturb inputs and output.
    #[default]
    Mca,
    /// Precision bounding: perturb inputs only.
    Pb,
    /// Random rounding: perturb the output only.
    Rr,
}

impl McaMode {
    /// True when inputs are perturbed.
    #[inline]
    pub fn perturbs_inputs(self) -> bool {
        matches!(self, Self::Pb | Self::Mca)
    }

    /// True when the output is perturbed.
    #[inline]
    pub fn perturbs_output(self) -> bool {
        matches!(self, Self::Rr | Self::Mca)
    }
}

impl std::str::FromStr for McaMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ieee" => Ok(Self::Ieee),
            "mca" => Ok(Self::Mca),
            "pb" => Ok(Self::Pb),
            "rr" => Ok(Self::Rr),
            _ => Err(ConfigError::InvalidMode {
                value: s.to_string(),
                accepted: "ieee, mca, pb, rr",
            }),
        }
    }
}

impl std::fmt::Display for McaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ieee => "ieee",
            Self::Mca => "mca",
            Self::Pb => "pb",
            Self::Rr => "rr",
        })
    }
}

/// Error magnitude policy for the MCA backends and the VPREC rounding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Noise relative to the operand magnitude.
    #[default]
    Rel,
    /// Noise at a fixed absolute exponent.
    Abs,
    /// Both relative and absolute noise.
    All,
}

impl std::str::FromStr for ErrorMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rel" => Ok(Self::Rel),
            "abs" => Ok(Self::Abs),
            "all" => Ok(Self::All),
            _ => Err(ConfigError::InvalidErrorMode {
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Rel => "rel",
            Self::Abs => "abs",
            Self::All => "all",
        })
    }
}

/// Elementary binary operation routed through a hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
}

/// A mutable reference to a user value of one of the engine's formats.
#[derive(Debug)]
pub enum ValueMut<'a> {
    /// A binary32 value.
    Binary32(&'a mut f32),
    /// A binary64 value.
    Binary64(&'a mut f64),
    /// A binary128 value.
    Binary128(&'a mut Binary128),
}

/// Runtime request routed through a backend's `user_call` hook.
#[derive(Debug)]
pub enum UserCall<'a> {
    /// Perturb a single user value.
    ///
    /// A positive `precision` is absolute; zero or negative is an offset
    /// from the backend's active virtual precision for the value's type
    /// (binary128 values always use `precision` as given).
    Inexact {
        /// The value to perturb in place.
        value: ValueMut<'a>,
        /// Virtual precision override.
        precision: i32,
    },
    /// Change the binary32 virtual precision.
    SetPrecisionBinary32(i32),
    /// Change the binary64 virtual precision.
    SetPrecisionBinary64(i32),
    /// Change the binary32 exponent range.
    SetRangeBinary32(i32),
    /// Change the binary64 exponent range.
    SetRangeBinary64(i32),
}

/// Binary arithmetic hook: `op(a, b)` written through the output pointer.
pub type ArithHook<B, T> = fn(&B, T, T, &mut T);
/// Comparison hook.
pub type CmpHook<B, T> = fn(&B, FcmpPredicate, T, T, &mut bool);
/// Lossy double-to-float cast hook.
pub type CastHook<B> = fn(&B, f64, &mut f32);
/// Fused multiply-add hook: `a * b + c`.
pub type FmaHook<B, T> = fn(&B, T, T, T, &mut T);
/// Function-scope hook for profiler-style backends.
pub type ScopeHook<B> = fn(&B, &str);
/// Runtime configuration hook.
pub type UserCallHook<B> = fn(&mut B, UserCall<'_>);
/// Teardown hook.
pub type FinalizeHook<B> = fn(&B);

/// The function table a backend returns from [`Backend::init`].
///
/// Entries the backend does not intercept are `None`; the host performs the
/// native IEEE operation instead.
#[derive(Debug)]
pub struct InterfaceTable<B> {
    /// binary32 addition.
    pub add_binary32: Option<ArithHook<B, f32>>,
    /// binary32 subtraction.
    pub sub_binary32: Option<ArithHook<B, f32>>,
    /// binary32 multiplication.
    pub mul_binary32: Option<ArithHook<B, f32>>,
    /// binary32 division.
    pub div_binary32: Option<ArithHook<B, f32>>,
    /// binary32 comparison.
    pub cmp_binary32: Option<CmpHook<B, f32>>,
    /// binary64 addition.
    pub add_binary64: Option<ArithHook<B, f64>>,
    /// binary64 subtraction.
    pub sub_binary64: Option<ArithHook<B, f64>>,
    /// binary64 multiplication.
    pub mul_binary64: Option<ArithHook<B, f64>>,
    /// binary64 division.
    pub div_binary64: Option<ArithHook<B, f64>>,
    /// binary64 comparison.
    pub cmp_binary64: Option<CmpHook<B, f64>>,
    /// Lossy binary64 to binary32 cast.
    pub cast_binary64_to_binary32: Option<CastHook<B>>,
    /// binary32 fused multiply-add.
    pub fma_binary32: Option<FmaHook<B, f32>>,
    /// binary64 fused multiply-add.
    pub fma_binary64: Option<FmaHook<B, f64>>,
    /// Function entry, for profiler-style backends.
    pub enter_function: Option<ScopeHook<B>>,
    /// Function exit, for profiler-style backends.
    pub exit_function: Option<ScopeHook<B>>,
    /// Runtime configuration requests.
    pub user_call: Option<UserCallHook<B>>,
    /// End-of-run teardown.
    pub finalize: Option<FinalizeHook<B>>,
}

impl<B> Default for InterfaceTable<B> {
    fn default() -> Self {
        Self {
            add_binary32: None,
            sub_binary32: None,
            mul_binary32: None,
            div_binary32: None,
            cmp_binary32: None,
            add_binary64: None,
            sub_binary64: None,
            mul_binary64: None,
            div_binary64: None,
            cmp_binary64: None,
            cast_binary64_to_binary32: None,
            fma_binary32: None,
            fma_binary64: None,
            enter_function: None,
            exit_function: None,
            user_call: None,
            finalize: None,
        }
    }
}

/// Lifecycle contract every backend implements.
pub trait Backend: Send + Sync + Sized {
    /// Short name used in log headers and the load banner.
    const NAME: &'static str;
    /// Backend version string.
    const VERSION: &'static str;
    /// Typed configuration record (the `configure` alternative to flags).
    type Conf;

    /// Allocates the context with its defaults and initializes the logger.
    fn pre_init() -> Self;

    /// Applies a configuration record, validating every field.
    fn configure(&mut self, conf: &Self::Conf) -> Result<(), ConfigError>;

    /// Logs the load banner and returns the hook table.
    fn init(&self) -> InterfaceTable<Self>;
}

/// A loaded backend: context plus hook table, with native IEEE fallbacks
/// for the entries the backend opted out of.
#[derive(Debug)]
pub struct Dispatch<B: Backend> {
    backend: B,
    table: InterfaceTable<B>,
}

impl<B: Backend> Dispatch<B> {
    /// Runs `init` on the backend and captures its table.
    pub fn load(backend: B) -> Self {
        let table = backend.init();
        Self { backend, table }
    }

    /// The backend context.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// binary32 addition.
    pub fn add_binary32(&self, a: f32, b: f32) -> f32 {
        match self.table.add_binary32 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a + b,
        }
    }

    /// binary32 subtraction.
    pub fn sub_binary32(&self, a: f32, b: f32) -> f32 {
        match self.table.sub_binary32 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a - b,
        }
    }

    /// binary32 multiplication.
    pub fn mul_binary32(&self, a: f32, b: f32) -> f32 {
        match self.table.mul_binary32 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a * b,
        }
    }

    /// binary32 division.
    pub fn div_binary32(&self, a: f32, b: f32) -> f32 {
        match self.table.div_binary32 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a / b,
        }
    }

    /// binary32 comparison.
    pub fn cmp_binary32(&self, predicate: FcmpPredicate, a: f32, b: f32) -> bool {
        match self.table.cmp_binary32 {
            Some(hook) => {
                let mut out = false;
                hook(&self.backend, predicate, a, b, &mut out);
                out
            }
            None => predicate.eval(a, b),
        }
    }

    /// binary64 addition.
    pub fn add_binary64(&self, a: f64, b: f64) -> f64 {
        match self.table.add_binary64 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a + b,
        }
    }

    /// binary64 subtraction.
    pub fn sub_binary64(&self, a: f64, b: f64) -> f64 {
        match self.table.sub_binary64 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a - b,
        }
    }

    /// binary64 multiplication.
    pub fn mul_binary64(&self, a: f64, b: f64) -> f64 {
        match self.table.mul_binary64 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a * b,
        }
    }

    /// binary64 division.
    pub fn div_binary64(&self, a: f64, b: f64) -> f64 {
        match self.table.div_binary64 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, &mut out);
                out
            }
            None => a / b,
        }
    }

    /// binary64 comparison.
    pub fn cmp_binary64(&self, predicate: FcmpPredicate, a: f64, b: f64) -> bool {
        match self.table.cmp_binary64 {
            Some(hook) => {
                let mut out = false;
                hook(&self.backend, predicate, a, b, &mut out);
                out
            }
            None => predicate.eval(a, b),
        }
    }

    /// Lossy binary64 to binary32 cast.
    pub fn cast_binary64_to_binary32(&self, a: f64) -> f32 {
        match self.table.cast_binary64_to_binary32 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, &mut out);
                out
            }
            None => a as f32,
        }
    }

    /// binary32 fused multiply-add.
    pub fn fma_binary32(&self, a: f32, b: f32, c: f32) -> f32 {
        match self.table.fma_binary32 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, c, &mut out);
                out
            }
            None => a.mul_add(b, c),
        }
    }

    /// binary64 fused multiply-add.
    pub fn fma_binary64(&self, a: f64, b: f64, c: f64) -> f64 {
        match self.table.fma_binary64 {
            Some(hook) => {
                let mut out = 0.0;
                hook(&self.backend, a, b, c, &mut out);
                out
            }
            None => a.mul_add(b, c),
        }
    }

    /// Routes a runtime request to the backend, if it accepts them.
    ///
    /// Requires exclusive access: runtime reconfiguration must not race the
    /// hot hooks.
    pub fn user_call(&mut self, call: UserCall<'_>) {
        if let Some(hook) = self.table.user_call {
            hook(&mut self.backend, call);
        }
    }

    /// Runs the backend's teardown, if any.
    pub fn finalize(&self) {
        if let Some(hook) = self.table.finalize {
            hook(&self.backend);
        }
    }
}
