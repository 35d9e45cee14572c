//! Error types for the engine control plane
//!
//! Nothing here is constructed on the realtime path: the process thread
//! reports through counters, [`crate::cycle::EngineEvent`]s and the
//! diagnostic channel.

use jackal_common::config::ConfigError;
use jackal_rt::{PipelineError, ThreadError};
use jackal_shared_memory::ShmError;
use thiserror::Error;

use crate::graph::{ClientId, PortId};

/// Connection graph errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// No such client
    #[error("Unknown client {id:?}")]
    UnknownClient {
        /// Client key
        id: ClientId,
    },

    /// No such port
    #[error("Unknown port {id:?}")]
    UnknownPort {
        /// Port key
        id: PortId,
    },

    /// Name already taken
    #[error("Name already in use: {name}")]
    DuplicateName {
        /// Offending name
        name: String,
    },

    /// Port name not found
    #[error("No port named {name}")]
    NoSuchPortName {
        /// Requested name
        name: String,
    },

    /// Connection source must be an output and destination an input
    #[error("Cannot connect {src:?} -> {dst:?}: wrong direction")]
    WrongDirection {
        /// Source port
        src: PortId,
        /// Destination port
        dst: PortId,
    },

    /// Ports of different types
    #[error("Cannot connect {src:?} -> {dst:?}: port types differ")]
    TypeMismatch {
        /// Source port
        src: PortId,
        /// Destination port
        dst: PortId,
    },

    /// Connection exists
    #[error("{src:?} is already connected to {dst:?}")]
    AlreadyConnected {
        /// Source port
        src: PortId,
        /// Destination port
        dst: PortId,
    },

    /// Connection does not exist
    #[error("{src:?} is not connected to {dst:?}")]
    NotConnected {
        /// Source port
        src: PortId,
        /// Destination port
        dst: PortId,
    },

    /// Second source on a port type that cannot be mixed
    #[error("Port {port:?} already has a source and its type has no mixdown")]
    NoMixdown {
        /// Destination port
        port: PortId,
    },

    /// The connection would make the client graph cyclic
    #[error("Connection would create a feedback cycle")]
    CycleDetected,

    /// A port's buffer cannot be resolved against the current segments
    #[error("Port {port:?} has no usable buffer: {reason}")]
    InvalidBuffer {
        /// Offending port
        port: PortId,
        /// Why the buffer was rejected
        reason: String,
    },
}

/// Driver collaborator errors.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Device or timer failure
    #[error("Driver failure: {reason}")]
    Failed {
        /// What went wrong
        reason: String,
    },

    /// Unsupported parameter change
    #[error("Driver cannot run with {what} = {value}")]
    Unsupported {
        /// Parameter name
        what: &'static str,
        /// Requested value
        value: u32,
    },
}

/// Control plane errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration error
    #[error("Configuration error: {source}")]
    Config {
        /// Source error
        #[from]
        source: ConfigError,
    },

    /// Shared memory error (allocation failure is fatal to that registration only)
    #[error("Shared memory error: {source}")]
    Shm {
        /// Source error
        #[from]
        source: ShmError,
    },

    /// Thread creation error
    #[error("Thread error: {source}")]
    Thread {
        /// Source error
        #[from]
        source: ThreadError,
    },

    /// Graph error
    #[error("Graph error: {source}")]
    Graph {
        /// Source error
        #[from]
        source: GraphError,
    },

    /// Driver error
    #[error("Driver error: {source}")]
    Driver {
        /// Source error
        #[from]
        source: DriverError,
    },

    /// Streaming pipeline error
    #[error("Pipeline error: {source}")]
    Pipeline {
        /// Source error
        #[from]
        source: PipelineError,
    },

    /// WAV file error
    #[error("WAV error: {source}")]
    Wav {
        /// Source error
        #[from]
        source: hound::Error,
    },

    /// Client limit reached
    #[error("Too many clients (max {max})")]
    TooManyClients {
        /// Configured maximum
        max: usize,
    },

    /// Port limit reached
    #[error("Too many ports (max {max})")]
    TooManyPorts {
        /// Configured maximum
        max: usize,
    },

    /// Client is already active
    #[error("Client {id:?} is already active")]
    AlreadyActive {
        /// Client key
        id: ClientId,
    },

    /// Client is not active
    #[error("Client {id:?} is not active")]
    NotActive {
        /// Client key
        id: ClientId,
    },

    /// No such port type
    #[error("Unknown port type {id}")]
    UnknownPortType {
        /// Type id
        id: u32,
    },

    /// Operation needs the process thread stopped
    #[error("Engine is running")]
    Running,

    /// Operation needs the process thread running
    #[error("Engine is not running")]
    NotRunning,

    /// The process cycle was lost when its thread could not be created
    #[error("Process cycle unavailable after a failed start")]
    Defunct,

    /// Shared memory was handed back by [`crate::Engine::close`]
    #[error("Engine is closed")]
    Closed,

    /// Period must be a non-zero power of two
    #[error("Invalid buffer size: {nframes} frames")]
    InvalidBufferSize {
        /// Requested frames
        nframes: u32,
    },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
