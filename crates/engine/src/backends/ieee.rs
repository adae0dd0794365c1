//! Reference IEEE backend.
//!
//! Executes every operation as plain IEEE-754 and optionally:
//! 1. **Counts** operations with relaxed atomic counters, emitted on
//!    finalize.
//! 2. **Traces** operands and results in decimal or in a binary scientific
//!    form (`s i.m x 2^e`, mantissa trimmed to its last set bit).
//!
//! This backend intercepts the comparison hooks as well, implementing the
//! sixteen ordered/unordered predicates with canonical NaN semantics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::common::constants::{binary32, binary64};
use crate::logger;
use crate::{Backend, FcmpPredicate, InterfaceTable};

/// Per-operation counters, updated with relaxed atomics from the hooks.
#[derive(Debug, Default)]
struct OpCounters {
    add: AtomicU64,
    sub: AtomicU64,
    mul: AtomicU64,
    div: AtomicU64,
    fma: AtomicU64,
}

/// A snapshot of the operation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpCounts {
    /// Additions.
    pub add: u64,
    /// Subtractions.
    pub sub: u64,
    /// Multiplications.
    pub mul: u64,
    /// Divisions.
    pub div: u64,
    /// Fused multiply-adds.
    pub fma: u64,
}

/// Typed configuration record for the IEEE backend.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IeeeConf {
    /// Trace every operation in decimal.
    pub debug: bool,
    /// Trace every operation in binary scientific form.
    pub debug_binary: bool,
    /// Drop the format header from trace records.
    pub no_backend_name: bool,
    /// Append an empty line after each trace record.
    pub print_new_line: bool,
    /// Print subnormal values normalized (`1.m x 2^(emin - lz - 1)`).
    pub print_subnormal_normalized: bool,
    /// Count operations and report the totals on finalize.
    pub count_op: bool,
}

/// Context of the IEEE backend.
#[derive(Debug, Default)]
pub struct IeeeContext {
    conf: IeeeConf,
    counters: OpCounters,
}

impl IeeeContext {
    /// Snapshot of the operation counters.
    pub fn counts(&self) -> OpCounts {
        OpCounts {
            add: self.counters.add.load(Ordering::Relaxed),
            sub: self.counters.sub.load(Ordering::Relaxed),
            mul: self.counters.mul.load(Ordering::Relaxed),
            div: self.counters.div.load(Ordering::Relaxed),
            fma: self.counters.fma.load(Ordering::Relaxed),
        }
    }

    fn tracing(&self) -> bool {
        self.conf.debug || self.conf.debug_binary
    }

    fn header(&self) -> &'static str {
        if self.conf.no_backend_name {
            ""
        } else if self.conf.debug {
            "Decimal "
        } else {
            "Binary "
        }
    }

    fn fmt32(&self, x: f32) -> String {
        if self.conf.debug {
            format!("{x}")
        } else {
            binary_repr_binary32(x, self.conf.print_subnormal_normalized)
        }
    }

    fn fmt64(&self, x: f64) -> String {
        if self.conf.debug {
            format!("{x}")
        } else {
            binary_repr_binary64(x, self.conf.print_subnormal_normalized)
        }
    }

    fn emit(&self, mut line: String) {
        if self.conf.print_new_line {
            line.push('\n');
        }
        logger::info(IeeeContext::NAME, &line);
    }

    fn trace_arith32(&self, op: &str, a: f32, b: f32, c: f32) {
        if self.tracing() {
            self.emit(format!(
                "{}{} {op} {} -> {}",
                self.header(),
                self.fmt32(a),
                self.fmt32(b),
                self.fmt32(c)
            ));
        }
    }

    fn trace_arith64(&self, op: &str, a: f64, b: f64, c: f64) {
        if self.tracing() {
            self.emit(format!(
                "{}{} {op} {} -> {}",
                self.header(),
                self.fmt64(a),
                self.fmt64(b),
                self.fmt64(c)
            ));
        }
    }

    fn count(&self, counter: &AtomicU64) {
        if self.conf.count_op {
            let _ = counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn add_binary32(ctx: &IeeeContext, a: f32, b: f32, out: &mut f32) {
    *out = a + b;
    ctx.count(&ctx.counters.add);
    ctx.trace_arith32("+", a, b, *out);
}

fn sub_binary32(ctx: &IeeeContext, a: f32, b: f32, out: &mut f32) {
    *out = a - b;
    ctx.count(&ctx.counters.sub);
    ctx.trace_arith32("-", a, b, *out);
}

fn mul_binary32(ctx: &IeeeContext, a: f32, b: f32, out: &mut f32) {
    *out = a * b;
    ctx.count(&ctx.counters.mul);
    ctx.trace_arith32("*", a, b, *out);
}

fn div_binary32(ctx: &IeeeContext, a: f32, b: f32, out: &mut f32) {
    *out = a / b;
    ctx.count(&ctx.counters.div);
    ctx.trace_arith32("/", a, b, *out);
}

fn cmp_binary32(ctx: &IeeeContext, predicate: FcmpPredicate, a: f32, b: f32, out: &mut bool) {
    *out = predicate.eval(a, b);
    if ctx.tracing() {
        ctx.emit(format!(
            "{}{} [{predicate}] {} -> {}",
            ctx.header(),
            ctx.fmt32(a),
            ctx.fmt32(b),
            *out
        ));
    }
}

fn add_binary64(ctx: &IeeeContext, a: f64, b: f64, out: &mut f64) {
    *out = a + b;
    ctx.count(&ctx.counters.add);
    ctx.trace_arith64("+", a, b, *out);
}

fn sub_binary64(ctx: &IeeeContext, a: f64, b: f64, out: &mut f64) {
    *out = a - b;
    ctx.count(&ctx.counters.sub);
    ctx.trace_arith64("-", a, b, *out);
}

fn mul_binary64(ctx: &IeeeContext, a: f64, b: f64, out: &mut f64) {
    *out = a * b;
    ctx.count(&ctx.counters.mul);
    ctx.trace_arith64("*", a, b, *out);
}

fn div_binary64(ctx: &IeeeContext, a: f64, b: f64, out: &mut f64) {
    *out = a / b;
    ctx.count(&ctx.counters.div);
    ctx.trace_arith64("/", a, b, *out);
}

fn cmp_binary64(ctx: &IeeeContext, predicate: FcmpPredicate, a: f64, b: f64, out: &mut bool) {
    *out = predicate.eval(a, b);
    if ctx.tracing() {
        ctx.emit(format!(
            "{}{} [{predicate}] {} -> {}",
            ctx.header(),
            ctx.fmt64(a),
            ctx.fmt64(b),
            *out
        ));
    }
}

fn cast_binary64_to_binary32(ctx: &IeeeContext, a: f64, out: &mut f32) {
    *out = a as f32;
    if ctx.tracing() {
        ctx.emit(format!(
            "{}{} (float) -> {}",
            ctx.header(),
            ctx.fmt64(a),
            ctx.fmt32(*out)
        ));
    }
}

fn fma_binary32(ctx: &IeeeContext, a: f32, b: f32, c: f32, out: &mut f32) {
    *out = a.mul_add(b, c);
    ctx.count(&ctx.counters.fma);
    if ctx.tracing() {
        ctx.emit(format!(
            "{}{} * {} + {} -> {}",
            ctx.header(),
            ctx.fmt32(a),
            ctx.fmt32(b),
            ctx.fmt32(c),
            ctx.fmt32(*out)
        ));
    }
}

fn fma_binary64(ctx: &IeeeContext, a: f64, b: f64, c: f64, out: &mut f64) {
    *out = a.mul_add(b, c);
    ctx.count(&ctx.counters.fma);
    if ctx.tracing() {
        ctx.emit(format!(
            "{}{} * {} + {} -> {}",
            ctx.header(),
            ctx.fmt64(a),
            ctx.fmt64(b),
            ctx.fmt64(c),
            ctx.fmt64(*out)
        ));
    }
}

fn finalize(ctx: &IeeeContext) {
    if ctx.conf.count_op {
        let counts = ctx.counts();
        logger::info(IeeeContext::NAME, "operations count:");
        logger::info(IeeeContext::NAME, &format!("\t mul={}", counts.mul));
        logger::info(IeeeContext::NAME, &format!("\t div={}", counts.div));
        logger::info(IeeeContext::NAME, &format!("\t add={}", counts.add));
        logger::info(IeeeContext::NAME, &format!("\t sub={}", counts.sub));
        logger::info(IeeeContext::NAME, &format!("\t fma={}", counts.fma));
    }
}

impl Backend for IeeeContext {
    const NAME: &'static str = "ieee";
    const VERSION: &'static str = "1.x-dev";
    type Conf = IeeeConf;

    fn pre_init() -> Self {
        logger::init(Self::NAME);
        Self::default()
    }

    fn configure(&mut self, conf: &IeeeConf) -> Result<(), ConfigError> {
        self.conf = *conf;
        Ok(())
    }

    fn init(&self) -> InterfaceTable<Self> {
        if !logger::silent_load() {
            let c = &self.conf;
            logger::info(Self::NAME, "load backend with:");
            logger::info(Self::NAME, &format!("debug = {}", c.debug));
            logger::info(Self::NAME, &format!("debug-binary = {}", c.debug_binary));
            logger::info(
                Self::NAME,
                &format!("no-backend-name = {}", c.no_backend_name),
            );
            logger::info(Self::NAME, &format!("print-new-line = {}", c.print_new_line));
            logger::info(
                Self::NAME,
                &format!(
                    "print-subnormal-normalized = {}",
                    c.print_subnormal_normalized
                ),
            );
            logger::info(Self::NAME, &format!("count-op = {}", c.count_op));
        }
        InterfaceTable {
            add_binary32: Some(add_binary32),
            sub_binary32: Some(sub_binary32),
            mul_binary32: Some(mul_binary32),
            div_binary32: Some(div_binary32),
            cmp_binary32: Some(cmp_binary32),
            add_binary64: Some(add_binary64),
            sub_binary64: Some(sub_binary64),
            mul_binary64: Some(mul_binary64),
            div_binary64: Some(div_binary64),
            cmp_binary64: Some(cmp_binary64),
            cast_binary64_to_binary32: Some(cast_binary64_to_binary32),
            fma_binary32: Some(fma_binary32),
            fma_binary64: Some(fma_binary64),
            user_call: None,
            finalize: Some(finalize),
            ..InterfaceTable::default()
        }
    }
}

/// Formats the stored mantissa bits from the top of the field down to the
/// last set bit; an empty mantissa prints as `"0"`.
fn mantissa_bits_trimmed(mantissa: u64, width: u32) -> String {
    if mantissa == 0 {
        return "0".to_string();
    }
    let last = mantissa.trailing_zeros();
    (last..width)
        .rev()
        .map(|bit| if mantissa & (1 << bit) != 0 { '1' } else { '0' })
        .collect()
}

/// Shared binary scientific formatter.
///
/// Grammar: `s i.m x 2^e`. Specials print as `+nan`, `±inf` and
/// `±0.0 x 2^0`. Subnormals print denormalized (`0.m x 2^emin`) or, when
/// `normalized` is set, renormalized with the exponent lowered past the
/// leading zeros.
struct BinaryParts {
    sign_char: char,
    field: u32,
    mantissa: u64,
    pman_size: u32,
    bias: i32,
}

impl BinaryParts {
    fn render(&self, exp_inf: u32, normalized: bool) -> String {
        let emin = 1 - self.bias;
        if self.field == exp_inf {
            return if self.mantissa != 0 {
                "+nan".to_string()
            } else {
                format!("{}inf", self.sign_char)
            };
        }
        if self.field == 0 && self.mantissa == 0 {
            return format!("{}0.0 x 2^0", self.sign_char);
        }
        if self.field == 0 {
            // Subnormal.
            let top = 63 - self.mantissa.leading_zeros();
            let leading_zeros = self.pman_size - 1 - top;
            if normalized {
                let rest = self.mantissa & !(1 << top);
                let digits = mantissa_bits_trimmed(rest, top);
                return format!(
                    "{}1.{} x 2^{}",
                    self.sign_char,
                    digits,
                    emin - leading_zeros as i32 - 1
                );
            }
            let digits = mantissa_bits_trimmed(self.mantissa, self.pman_size);
            return format!("{}0.{} x 2^{}", self.sign_char, digits, emin);
        }
        let digits = mantissa_bits_trimmed(self.mantissa, self.pman_size);
        format!(
            "{}1.{} x 2^{}",
            self.sign_char,
            digits,
            self.field as i32 - self.bias
        )
    }
}

/// Binary scientific representation of a binary32 value.
pub fn binary_repr_binary32(x: f32, subnormal_normalized: bool) -> String {
    let bits = x.to_bits();
    BinaryParts {
        sign_char: if bits & binary32::SIGN_MASK != 0 { '-' } else { '+' },
        field: (bits & binary32::EXP_MASK) >> binary32::PMAN_SIZE,
        mantissa: u64::from(bits & binary32::PMAN_MASK),
        pman_size: binary32::PMAN_SIZE,
        bias: binary32::EXP_BIAS,
    }
    .render(binary32::EXP_INF, subnormal_normalized)
}

/// Binary scientific representation of a binary64 value.
pub fn binary_repr_binary64(x: f64, subnormal_normalized: bool) -> String {
    let bits = x.to_bits();
    BinaryParts {
        sign_char: if bits & binary64::SIGN_MASK != 0 { '-' } else { '+' },
        field: ((bits & binary64::EXP_MASK) >> binary64::PMAN_SIZE) as u32,
        mantissa: bits & binary64::PMAN_MASK,
        pman_size: binary64::PMAN_SIZE,
        bias: binary64::EXP_BIAS,
    }
    .render(binary64::EXP_INF, subnormal_normalized)
}
