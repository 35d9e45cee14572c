//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment file already exists
    #[error("Segment already exists: {name}")]
    AlreadyExists {
        /// Segment name
        name: String,
    },

    /// Segment file not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Registry has no entry with this index
    #[error("Unknown segment index: {index}")]
    UnknownSegment {
        /// Registry index
        index: u32,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Mapping exists but does not match its registry entry
    #[error("Attach failed for segment {index}: {reason}")]
    AttachFailed {
        /// Registry index
        index: u32,
        /// What did not validate
        reason: String,
    },

    /// Buffer address lies outside its segment
    #[error("Address out of bounds: offset {offset} + len {len} > segment size {size}")]
    OutOfBounds {
        /// Byte offset
        offset: usize,
        /// Byte length
        len: usize,
        /// Segment data size
        size: usize,
    },

    /// Segment is still referenced outside the context
    #[error("Segment {index} is in use and cannot be remapped")]
    SegmentBusy {
        /// Registry index
        index: u32,
    },

    /// Registry cannot hold more entries
    #[error("Segment registry full ({capacity} entries)")]
    RegistryFull {
        /// Registry capacity
        capacity: usize,
    },

    /// Port pool has no free region left
    #[error("System resource exhausted - no free port buffer")]
    ResourceExhausted,

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
