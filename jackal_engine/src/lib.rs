//! # Jackal Engine
//!
//! The process cycle of a low-latency audio server and the control plane
//! around it.
//!
//! ```text
//!   control thread                          process thread (SCHED_FIFO)
//!  ┌──────────────────┐   GraphUpdate    ┌────────────────────────────┐
//!  │ Engine           │ ───────────────► │ Coordinator                │
//!  │  Graph, pools    │ ◄─────────────── │  Idle → Wait → Invoke →    │
//!  │  snapshots       │  returned update │  Complete                  │
//!  │                  │ ◄─────────────── │                            │
//!  └──────────────────┘   EngineEvent    └────────────────────────────┘
//! ```
//!
//! The control side owns the connection graph and publishes immutable
//! snapshots of it. The process thread installs the newest snapshot between
//! cycles, so clients always see a graph that does not change under them.
//! Port buffers live in shared memory segments; an input with one source
//! reads the source's buffer directly, several sources are mixed into the
//! input's own buffer.

#![warn(missing_docs)]

pub mod capture;
pub mod client;
pub mod config;
pub mod cycle;
pub mod driver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod server;

pub use capture::{CaptureHandle, CaptureOptions, WavFormat, start_capture};
pub use client::{Client, ClosureClient, InputPort, OutputPort, ProcessScope, ProcessStatus};
pub use config::EngineConfig;
pub use cycle::{Coordinator, CpuLoad, CycleStats, EngineEvent, HaltReason};
pub use driver::{Driver, DummyDriver, FreewheelDriver, WaitStatus};
pub use engine::Engine;
pub use error::{DriverError, EngineError, EngineResult, GraphError};
pub use graph::{ClientId, GraphSnapshot, PortDirection, PortId};
pub use server::{ServerContext, TeardownReport};
