//! Configuration error types.
//!
//! Every configuration setter validates its input and reports failures as a
//! [`ConfigError`]. Hooks themselves never return errors: a backend that is
//! successfully initialized runs its hot path infallibly, and configuration
//! problems are surfaced (and are fatal) at load time.

use thiserror::Error;

/// Error raised when a backend option is set to an invalid value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A mode keyword was not one of the accepted values.
    #[error("--mode invalid value provided ({value}), must be one of: {{{accepted}}}")]
    InvalidMode {
        /// The rejected keyword.
        value: String,
        /// Comma-separated accepted keywords.
        accepted: &'static str,
    },

    /// A bitmask operator keyword was not one of the accepted values.
    #[error("--operator invalid value provided ({value}), must be one of: {{zero, one, rand}}")]
    InvalidOperator {
        /// The rejected keyword.
        value: String,
    },

    /// An error-mode keyword was not one of the accepted values.
    #[error("--error-mode invalid value provided ({value}), must be one of: {{rel, abs, all}}")]
    InvalidErrorMode {
        /// The rejected keyword.
        value: String,
    },

    /// An error mode the backend cannot honour was requested.
    #[error("error mode {mode} is not supported by this backend, only rel is available")]
    UnsupportedErrorMode {
        /// The rejected error mode.
        mode: &'static str,
    },

    /// A virtual precision outside the valid range.
    #[error("invalid precision {value} for {format} type, must be between {min} and {max}")]
    InvalidPrecision {
        /// Target format name (`binary32` or `binary64`).
        format: &'static str,
        /// The rejected precision.
        value: i64,
        /// Smallest accepted precision.
        min: u32,
        /// Largest accepted precision.
        max: u32,
    },

    /// A virtual precision the backend does not allow to change.
    #[error("custom precisions are not supported for {format}, must be {expected}")]
    PrecisionFixed {
        /// Target format name (`binary32` or `binary64`).
        format: &'static str,
        /// The only accepted precision.
        expected: u32,
    },

    /// An exponent range outside the representable width of the format.
    #[error("invalid exponent range {value} for {format} type, must be between {min} and {max}")]
    InvalidRange {
        /// Target format name (`binary32` or `binary64`).
        format: &'static str,
        /// The rejected range.
        value: i64,
        /// Smallest accepted range.
        min: u32,
        /// Largest accepted range.
        max: u32,
    },

    /// A sparsity outside the `(0, 1]` interval.
    #[error("invalid value for sparsity {value}, must be positive")]
    InvalidSparsity {
        /// The rejected sparsity.
        value: f32,
    },

    /// A negative cancellation tolerance.
    #[error("--tolerance invalid value provided ({value}), must be a positive integer")]
    InvalidTolerance {
        /// The rejected tolerance.
        value: i64,
    },
}
