//! Testing utilities
//!
//! An in-memory engine so registry behaviour can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
