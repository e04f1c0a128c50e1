//! Observability: structured logging setup and span helpers
//!
//! Per-client counters live in [`crate::metrics`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::bus_span;
