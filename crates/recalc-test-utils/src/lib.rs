//! Shared test utilities for recalc integration tests.
//!
//! This crate provides:
//! - [`Scenario`]: A catalog and record store preloaded with a schema and rows
//! - Fixture schemas for link lookups, conditional rollups, formula chains and cycles
//! - Plan assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use recalc_test_utils::{bugs_and_components, staged_config};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let scenario = bugs_and_components();
//!     let (service, _outbox) = scenario.service(staged_config(0, 0));
//!     // ... submit a change ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("recalc=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
