//! Testing utilities and mock implementations
//!
//! Mocks for the transport, wake timer, wake lock and listener seams, so
//! session behaviour can be tested without a broker.

pub mod mocks;

pub use mocks::*;
