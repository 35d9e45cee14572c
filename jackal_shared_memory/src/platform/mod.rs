//! Platform-specific segment mapping and process liveness checks

mod linux;

pub use linux::*;
