//! jackal Common Library
//!
//! Shared constants and configuration loading utilities for all jackal
//! workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment limits, timing defaults and diagnostic slot geometry
//! - [`config`] - Configuration loading traits and types
//!
//! # Usage
//!
//! ```rust
//! use jackal_common::consts::*;
//! use jackal_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
