//! Testing utilities and mock implementations
//!
//! Lets health, heartbeat and dispatch logic be tested without a broker.

pub mod mocks;

pub use mocks::*;
