//! Scalar operator implementations used as the golden reference.
//!
//! Every routine is a plain triple loop with no blocking, packing or SIMD so
//! that it stays an independent oracle for the optimized engines. The crate
//! is compiled with `opt-level = 1` (workspace root Cargo.toml) to keep the
//! loops scalar.

pub mod activations;
pub mod bf16;
pub mod blas;
pub mod conv;
