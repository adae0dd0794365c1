//! Monte Carlo arithmetic host driver.
//!
//! This binary is the in-tree host for the perturbation backends. It
//! performs:
//! 1. **Backend runs:** load one backend, route a built-in numerical kernel
//!    through its hook table many times, and report sample statistics.
//! 2. **Scalar rounding:** apply the variable-precision rounding to a
//!    single value and print it in decimal and binary scientific form.
//!
//! Backend options use the documented flag names; alternatively a JSON
//! configuration file can be supplied and is deserialized into the
//! backend's typed configuration record.

use clap::{Args, Parser, Subcommand};
use std::process;
use std::str::FromStr;

use mcasim_core::backends::bitmask::{BitmaskConf, BitmaskContext, BitmaskMode, BitmaskOperator};
use mcasim_core::backends::cancellation::{CancellationConf, CancellationContext};
use mcasim_core::backends::ieee::{self, IeeeConf, IeeeContext};
use mcasim_core::backends::mcaint::{McaIntConf, McaIntContext};
use mcasim_core::backends::mcaquad::{McaQuadConf, McaQuadContext};
use mcasim_core::vprec::{self, Direction, Preset, VprecConf, VprecContext};
use mcasim_core::{Backend, Dispatch, ErrorMode, McaMode, logger};

#[derive(Parser, Debug)]
#[command(
    name = "mcasim",
    author,
    version,
    about = "Monte Carlo arithmetic host driver",
    long_about = "Load a perturbation backend and run a numerical kernel through it, or apply \
variable-precision rounding to a single value.\n\nExamples:\n  mcasim run --backend mcaquad --seed 42 --samples 10000\n  mcasim run --backend bitmask --operator rand --precision-binary64 40 --kernel sum\n  mcasim run --backend ieee --count-op\n  mcasim round --value 0.1 --preset binary16"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a built-in kernel through a backend and report statistics.
    Run {
        /// Backend to load: ieee, bitmask, cancellation, mcaquad, mcaint.
        #[arg(short, long)]
        backend: String,

        /// Kernel to evaluate: residue, sum, or dot.
        #[arg(short, long, default_value = "residue")]
        kernel: String,

        /// Number of evaluations.
        #[arg(long, default_value_t = 1000)]
        samples: usize,

        /// JSON configuration file (overrides individual flags).
        #[arg(long)]
        config: Option<String>,

        #[command(flatten)]
        opts: BackendOpts,
    },

    /// Round one value into a reduced floating-point format.
    Round {
        /// The value to round.
        #[arg(short, long)]
        value: f64,

        /// Round in the binary32 pipeline instead of binary64.
        #[arg(long)]
        binary32: bool,

        /// Target mantissa precision.
        #[arg(short, long)]
        precision: Option<i32>,

        /// Target exponent width.
        #[arg(short, long)]
        range: Option<i32>,

        /// Apply a preset format (binary16, bfloat16, tensorfloat, ...).
        #[arg(long)]
        preset: Option<String>,

        /// Error mode: rel, abs, or all.
        #[arg(long, default_value = "rel")]
        error_mode: String,

        /// Exponent of the maximum absolute error.
        #[arg(long)]
        max_abs_error_exponent: Option<i32>,

        /// Treat the value as an operand (applies DAZ instead of FTZ).
        #[arg(long)]
        input: bool,

        /// Denormals-are-zero.
        #[arg(long)]
        daz: bool,

        /// Flush-to-zero.
        #[arg(long)]
        ftz: bool,
    },
}

/// Backend options, using the documented flag names. Flags that a backend
/// does not understand are simply ignored by its builder.
#[derive(Args, Debug)]
struct BackendOpts {
    /// Virtual precision for binary32 operations.
    #[arg(long)]
    precision_binary32: Option<i32>,

    /// Virtual precision for binary64 operations.
    #[arg(long)]
    precision_binary64: Option<i32>,

    /// Operating mode (backend specific keywords).
    #[arg(short, long)]
    mode: Option<String>,

    /// Bitmask operator: zero, one, rand.
    #[arg(short, long)]
    operator: Option<String>,

    /// Error mode: rel, abs, all.
    #[arg(short, long)]
    error_mode: Option<String>,

    /// Exponent of the maximum absolute error.
    #[arg(long)]
    max_abs_error_exponent: Option<i32>,

    /// Fraction of operations to perturb, in (0, 1].
    #[arg(long)]
    sparsity: Option<f32>,

    /// Fixed RNG seed.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Denormals-are-zero: treat subnormal inputs as zero.
    #[arg(short, long)]
    daz: bool,

    /// Flush-to-zero: flush subnormal results to zero.
    #[arg(short, long)]
    ftz: bool,

    /// Cancellation tolerance (cancellation backend).
    #[arg(short, long)]
    tolerance: Option<i32>,

    /// Warn on each triggered cancellation.
    #[arg(short, long)]
    warning: bool,

    /// Decimal operand tracing (ieee backend).
    #[arg(long)]
    debug: bool,

    /// Binary operand tracing (ieee backend).
    #[arg(long)]
    debug_binary: bool,

    /// Drop the format header from trace records.
    #[arg(long)]
    no_backend_name: bool,

    /// Append an empty line after each trace record.
    #[arg(long)]
    print_new_line: bool,

    /// Print subnormal values normalized.
    #[arg(long)]
    print_subnormal_normalized: bool,

    /// Count operations and report the totals on finalize.
    #[arg(long)]
    count_op: bool,
}

/// A loaded backend of any kind, exposing the binary64 hook surface the
/// kernels need.
enum Host {
    Ieee(Dispatch<IeeeContext>),
    Bitmask(Dispatch<BitmaskContext>),
    Cancellation(Dispatch<CancellationContext>),
    McaQuad(Dispatch<McaQuadContext>),
    McaInt(Dispatch<McaIntContext>),
}

impl Host {
    fn add(&self, a: f64, b: f64) -> f64 {
        match self {
            Host::Ieee(h) => h.add_binary64(a, b),
            Host::Bitmask(h) => h.add_binary64(a, b),
            Host::Cancellation(h) => h.add_binary64(a, b),
            Host::McaQuad(h) => h.add_binary64(a, b),
            Host::McaInt(h) => h.add_binary64(a, b),
        }
    }

    fn sub(&self, a: f64, b: f64) -> f64 {
        match self {
            Host::Ieee(h) => h.sub_binary64(a, b),
            Host::Bitmask(h) => h.sub_binary64(a, b),
            Host::Cancellation(h) => h.sub_binary64(a, b),
            Host::McaQuad(h) => h.sub_binary64(a, b),
            Host::McaInt(h) => h.sub_binary64(a, b),
        }
    }

    fn mul(&self, a: f64, b: f64) -> f64 {
        match self {
            Host::Ieee(h) => h.mul_binary64(a, b),
            Host::Bitmask(h) => h.mul_binary64(a, b),
            Host::Cancellation(h) => h.mul_binary64(a, b),
            Host::McaQuad(h) => h.mul_binary64(a, b),
            Host::McaInt(h) => h.mul_binary64(a, b),
        }
    }

    fn div(&self, a: f64, b: f64) -> f64 {
        match self {
            Host::Ieee(h) => h.div_binary64(a, b),
            Host::Bitmask(h) => h.div_binary64(a, b),
            Host::Cancellation(h) => h.div_binary64(a, b),
            Host::McaQuad(h) => h.div_binary64(a, b),
            Host::McaInt(h) => h.div_binary64(a, b),
        }
    }

    fn finalize(&self) {
        match self {
            Host::Ieee(h) => h.finalize(),
            Host::Bitmask(h) => h.finalize(),
            Host::Cancellation(h) => h.finalize(),
            Host::McaQuad(h) => h.finalize(),
            Host::McaInt(h) => h.finalize(),
        }
    }
}

fn main() {
    install_subscriber();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            backend,
            kernel,
            samples,
            config,
            opts,
        } => cmd_run(&backend, &kernel, samples, config.as_deref(), &opts),
        Commands::Round {
            value,
            binary32,
            precision,
            range,
            preset,
            error_mode,
            max_abs_error_exponent,
            input,
            daz,
            ftz,
        } => cmd_round(RoundRequest {
            value,
            binary32,
            precision,
            range,
            preset,
            error_mode,
            max_abs_error_exponent,
            input,
            daz,
            ftz,
        }),
    }
}

/// Installs the tracing subscriber, honoring the logger environment:
/// `VFC_BACKENDS_LOGFILE` redirects output (with the thread id appended),
/// `VFC_BACKENDS_COLORED_LOGGER` turns ANSI colors on.
fn install_subscriber() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(logger::colored());
    if let Some(path) = logger::logfile() {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                builder
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
            }
            Err(err) => {
                eprintln!("Error: cannot open log file {path}: {err}");
                process::exit(1);
            }
        }
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn parse<T: FromStr>(value: &str) -> T
where
    T::Err: std::fmt::Display,
{
    match value.parse() {
        Ok(parsed) => parsed,
        Err(err) => fail(&err.to_string()),
    }
}

fn from_json<T: serde::de::DeserializeOwned>(path: &str) -> T {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => fail(&format!("cannot read {path}: {err}")),
    };
    match serde_json::from_str(&text) {
        Ok(conf) => conf,
        Err(err) => fail(&format!("invalid configuration in {path}: {err}")),
    }
}

fn load_backend(name: &str, config: Option<&str>, opts: &BackendOpts) -> Host {
    match name {
        "ieee" => {
            let conf: IeeeConf = match config {
                Some(path) => from_json(path),
                None => IeeeConf {
                    debug: opts.debug,
                    debug_binary: opts.debug_binary,
                    no_backend_name: opts.no_backend_name,
                    print_new_line: opts.print_new_line,
                    print_subnormal_normalized: opts.print_subnormal_normalized,
                    count_op: opts.count_op,
                },
            };
            let mut ctx = IeeeContext::pre_init();
            if let Err(err) = ctx.configure(&conf) {
                fail(&err.to_string());
            }
            Host::Ieee(Dispatch::load(ctx))
        }
        "bitmask" => {
            let conf: BitmaskConf = match config {
                Some(path) => from_json(path),
                None => {
                    let defaults = BitmaskConf::default();
                    BitmaskConf {
                        precision_binary32: opts
                            .precision_binary32
                            .unwrap_or(defaults.precision_binary32),
                        precision_binary64: opts
                            .precision_binary64
                            .unwrap_or(defaults.precision_binary64),
                        mode: opts
                            .mode
                            .as_deref()
                            .map_or(defaults.mode, parse::<BitmaskMode>),
                        operator: opts
                            .operator
                            .as_deref()
                            .map_or(defaults.operator, parse::<BitmaskOperator>),
                        seed: opts.seed,
                        daz: opts.daz,
                        ftz: opts.ftz,
                    }
                }
            };
            let mut ctx = BitmaskContext::pre_init();
            if let Err(err) = ctx.configure(&conf) {
                fail(&err.to_string());
            }
            Host::Bitmask(Dispatch::load(ctx))
        }
        "cancellation" => {
            let conf: CancellationConf = match config {
                Some(path) => from_json(path),
                None => {
                    let defaults = CancellationConf::default();
                    CancellationConf {
                        tolerance: opts.tolerance.unwrap_or(defaults.tolerance),
                        warning: opts.warning,
                        seed: opts.seed,
                    }
                }
            };
            let mut ctx = CancellationContext::pre_init();
            if let Err(err) = ctx.configure(&conf) {
                fail(&err.to_string());
            }
            Host::Cancellation(Dispatch::load(ctx))
        }
        "mcaquad" => {
            let conf: McaQuadConf = match config {
                Some(path) => from_json(path),
                None => {
                    let defaults = McaQuadConf::default();
                    McaQuadConf {
                        precision_binary32: opts
                            .precision_binary32
                            .unwrap_or(defaults.precision_binary32),
                        precision_binary64: opts
                            .precision_binary64
                            .unwrap_or(defaults.precision_binary64),
                        mode: opts.mode.as_deref().map_or(defaults.mode, parse::<McaMode>),
                        error_mode: opts
                            .error_mode
                            .as_deref()
                            .map_or(defaults.error_mode, parse::<ErrorMode>),
                        max_abs_error_exponent: opts.max_abs_error_exponent,
                        seed: opts.seed,
                        sparsity: opts.sparsity.unwrap_or(defaults.sparsity),
                        daz: opts.daz,
                        ftz: opts.ftz,
                    }
                }
            };
            let mut ctx = McaQuadContext::pre_init();
            if let Err(err) = ctx.configure(&conf) {
                fail(&err.to_string());
            }
            Host::McaQuad(Dispatch::load(ctx))
        }
        "mcaint" => {
            let conf: McaIntConf = match config {
                Some(path) => from_json(path),
                None => {
                    let defaults = McaIntConf::default();
                    McaIntConf {
                        precision_binary32: opts
                            .precision_binary32
                            .unwrap_or(defaults.precision_binary32),
                        precision_binary64: opts
                            .precision_binary64
                            .unwrap_or(defaults.precision_binary64),
                        mode: opts.mode.as_deref().map_or(defaults.mode, parse::<McaMode>),
                        error_mode: opts
                            .error_mode
                            .as_deref()
                            .map_or(defaults.error_mode, parse::<ErrorMode>),
                        seed: opts.seed,
                        sparsity: opts.sparsity.unwrap_or(defaults.sparsity),
                        daz: opts.daz,
                        ftz: opts.ftz,
                    }
                }
            };
            let mut ctx = McaIntContext::pre_init();
            if let Err(err) = ctx.configure(&conf) {
                fail(&err.to_string());
            }
            Host::McaInt(Dispatch::load(ctx))
        }
        other => fail(&format!(
            "unknown backend {other}, expected one of: ieee, bitmask, cancellation, mcaquad, mcaint"
        )),
    }
}

/// Evaluates the chosen kernel once through the backend.
fn run_kernel(host: &Host, kernel: &str) -> f64 {
    match kernel {
        // The classic residue: nonzero only through rounding.
        "residue" => host.sub(host.add(0.1, 0.2), 0.3),
        // Naive summation of 0.1, one hundred terms.
        "sum" => {
            let mut acc = 0.0;
            for _ in 0..100 {
                acc = host.add(acc, 0.1);
            }
            acc
        }
        // A small ill-conditioned dot product.
        "dot" => {
            let x = [2.718281828, -3.141592653, 1.414213562, 0.577215664];
            let y = [1486.2497, 878.3662, -2295.9533, 5.8833];
            let mut acc = 0.0;
            for (a, b) in x.iter().zip(y.iter()) {
                acc = host.add(acc, host.mul(*a, *b));
            }
            host.div(acc, 1.0)
        }
        other => fail(&format!(
            "unknown kernel {other}, expected one of: residue, sum, dot"
        )),
    }
}

fn cmd_run(backend: &str, kernel: &str, samples: usize, config: Option<&str>, opts: &BackendOpts) {
    if samples == 0 {
        fail("--samples must be positive");
    }
    let host = load_backend(backend, config, opts);

    let mut values = Vec::with_capacity(samples);
    for _ in 0..samples {
        values.push(run_kernel(&host, kernel));
    }
    host.finalize();

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let distinct: std::collections::HashSet<u64> = values.iter().map(|v| v.to_bits()).collect();

    println!("backend:  {backend}");
    println!("kernel:   {kernel}");
    println!("samples:  {samples}");
    println!("mean:     {mean:e}");
    println!("std:      {:e}", variance.sqrt());
    println!("min:      {min:e}");
    println!("max:      {max:e}");
    println!("spread:   {:e}", max - min);
    println!("distinct: {}", distinct.len());
}

/// Arguments of the `round` subcommand.
struct RoundRequest {
    value: f64,
    binary32: bool,
    precision: Option<i32>,
    range: Option<i32>,
    preset: Option<String>,
    error_mode: String,
    max_abs_error_exponent: Option<i32>,
    input: bool,
    daz: bool,
    ftz: bool,
}

fn cmd_round(request: RoundRequest) {
    let defaults = VprecConf::default();
    let conf = VprecConf {
        precision_binary32: request
            .precision
            .map_or(defaults.precision_binary32, |p| p.min(23)),
        range_binary32: request.range.map_or(defaults.range_binary32, |r| r.min(8)),
        precision_binary64: request.precision.unwrap_or(defaults.precision_binary64),
        range_binary64: request.range.unwrap_or(defaults.range_binary64),
        error_mode: parse::<ErrorMode>(&request.error_mode),
        max_abs_error_exponent: request.max_abs_error_exponent,
        preset: request.preset.as_deref().map(parse::<Preset>),
        daz: request.daz,
        ftz: request.ftz,
    };
    let ctx = match VprecContext::from_conf(&conf) {
        Ok(ctx) => ctx,
        Err(err) => fail(&err.to_string()),
    };
    let direction = if request.input {
        Direction::Input
    } else {
        Direction::Output
    };

    if request.binary32 {
        let rounded = vprec::round_binary32(request.value as f32, direction, &ctx);
        println!("value:   {:e}", request.value);
        println!("rounded: {rounded:e}");
        println!("binary:  {}", ieee::binary_repr_binary32(rounded, false));
    } else {
        let rounded = vprec::round_binary64(request.value, direction, &ctx);
        println!("value:   {:e}", request.value);
        println!("rounded: {rounded:e}");
        println!("binary:  {}", ieee::binary_repr_binary64(rounded, false));
    }
}
