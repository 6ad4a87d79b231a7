//! Shared test utilities for the raster-index workspace.
//!
//! This crate provides common testing infrastructure:
//! - Synthetic band generators
//! - GeoTIFF fixture writers
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{write_gray_f32, FixtureOptions};
//! ```

pub mod fixtures;
pub mod generators;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;
