//! # Jackal Shared Memory
//!
//! Shared memory segments for zero-copy exchange of port buffers between the
//! server and its clients, whether they run in the server process or not.
//!
//! ## Layout
//!
//! ```text
//! {dir}/{prefix}-registry.json        persistent registry (index -> os id, size, creator)
//! {dir}/{prefix}-{pid}-{index}        one file per segment
//!
//! segment file:
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ SegmentHeader│ data: [zero region | port 1 | port 2 | ... ]  │
//! │  (128 bytes) │                                               │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Addresses cross process boundaries only as [`BufferAddress`]
//! `(segment, offset, len)` triples. Each process resolves them against its
//! own [`Attachment`], after validating bounds.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jackal_shared_memory::{AUDIO, PortPool, ShmConfig, ShmContext};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = ShmContext::init(&ShmConfig::default())?;
//! let mut pool = PortPool::create(&mut ctx, AUDIO, 256, 16)?;
//! let port = pool.alloc()?;
//! assert!(pool.validate(&port).is_ok());
//! drop(pool);
//! ctx.teardown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod platform;
pub mod port;
pub mod registry;
pub mod segment;

pub use context::{ShmConfig, ShmContext};
pub use error::{ShmError, ShmResult};
pub use port::{
    AUDIO, EVENT, MixdownFn, PortBuffer, PortPool, PortType, PortTypeId, as_f32, as_f32_mut,
    mix_f32,
};
pub use registry::{RegistryEntry, SegmentRegistry};
pub use segment::{Attachment, BufferAddress, SEGMENT_HEADER_SIZE, SegmentHeader};
