//! Background cadences: correlation passes and auto-expiry.

pub mod engine;

pub use self::engine::{correlation_pass, run_correlation_loop, run_resolver_loop};
