//! # Heka Testkit
//!
//! Test utilities for Heka sync.
//!
//! This crate provides:
//! - [`TestEnv`] fixtures wiring mock sources, a mock uploader and a store
//! - Fault-injecting store backends
//! - Property-based test generators using proptest
//! - Stress helpers for single-flight and redelivery checks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use heka_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn uploads_everything() {
//!     let env = scenarios::steps_and_calories(3);
//!     assert!(env.orchestrator.sync().await.is_success());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
