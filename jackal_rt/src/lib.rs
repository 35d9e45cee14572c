//! # Jackal RT
//!
//! Building blocks for code that runs on, or talks to, the realtime path:
//!
//! - [`ringbuffer`]: lock-free SPSC byte queue
//! - [`thread`]: realtime thread creation with verified scheduling
//! - [`diagnostic`]: non-blocking message channel drained off the RT path
//! - [`pipeline`]: free-pool / pending-queue hand-off to a blocking consumer
//!
//! Nothing reachable from the realtime side of these types allocates,
//! performs I/O or waits on a lock it does not already expect to get.

#![warn(missing_docs)]

pub mod diagnostic;
pub mod error;
pub mod pipeline;
pub mod ringbuffer;
pub mod thread;

pub use diagnostic::{
    DiagMessage, DiagnosticChannel, DiagnosticSink, DiagnosticSubmitter, DiagnosticSummary,
    TracingSink,
};
pub use error::{PipelineError, ThreadError};
pub use pipeline::{
    BlockSink, PipelineConsumer, PipelineProducer, PipelineStats, ProduceStatus, SampleBlock,
    StreamingPipeline,
};
pub use ringbuffer::{Consumer, Producer, RingBuffer};
pub use thread::{
    NativeThread, PosixScheduler, RealtimeThreadManager, RtThread, SchedParams, SchedPolicy,
    SchedulerOps, SchedulingOutcome, SpawnSched, lock_process_memory,
};
