//! # Unit Components
//!
//! Fine-grained tests for the individual pieces of the engine, mirroring
//! the source tree.

/// Unit tests for the perturbation backends.
pub mod backends;

/// Unit tests for the float bit model.
pub mod fpbits;

/// Unit tests for the software binary128 arithmetic.
pub mod quad;


/// Unit tests for the variable-precision scalar rounding.
pub mod vprec;
