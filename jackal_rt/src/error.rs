//! Error types for the realtime primitives

use thiserror::Error;

/// Errors from thread creation and scheduling calls.
///
/// Failing to obtain realtime scheduling is not an error: it is reported as
/// [`crate::thread::SchedulingOutcome::Degraded`] or `Denied`.
#[derive(Error, Debug)]
pub enum ThreadError {
    /// The OS refused to create the thread at all
    #[error("Thread creation failed: {reason}")]
    CreateFailed {
        /// OS error text
        reason: String,
    },

    /// Priority outside the range the policy accepts
    #[error("Invalid priority {priority} (allowed {min}..={max})")]
    InvalidPriority {
        /// Requested priority
        priority: i32,
        /// Policy minimum
        min: i32,
        /// Policy maximum
        max: i32,
    },

    /// A scheduling query failed
    #[error("Scheduling call {call} failed: errno {errno}")]
    Sched {
        /// Name of the failing call
        call: &'static str,
        /// Raw errno value
        errno: i32,
    },

    /// The thread's entry function panicked
    #[error("Thread panicked")]
    Panicked,

    /// The thread was already joined
    #[error("Thread already joined")]
    AlreadyJoined,
}

/// Errors from streaming pipeline consumers.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The sink failed to write a block
    #[error("Sink write failed: {reason}")]
    Sink {
        /// Sink-specific error text
        reason: String,
    },

    /// The consumer thread could not be started or joined
    #[error("Consumer thread error: {source}")]
    Thread {
        /// Underlying thread error
        #[from]
        source: ThreadError,
    },

    /// The pipeline was asked for more buffers than it can hold
    #[error("Invalid pipeline geometry: {reason}")]
    InvalidGeometry {
        /// What is wrong
        reason: String,
    },
}
