//! Streaming pipeline: realtime producer, blocking consumer
//!
//! Blocks move between two sets guarded by one mutex: a free pool and a
//! pending queue. Each block is owned by exactly one of {free pool, pending
//! queue, producer while filling, consumer while writing}.
//!
//! ```text
//!            pop            push + notify
//!  free ──────────► RT fill ─────────────► pending
//!   ▲                                         │
//!   │        return          write            │ swap out
//!   └─────────────── consumer ◄───────────────┘
//! ```
//!
//! The pool is sized once, up front, and never grows. When the producer
//! finds it empty the cycle's data is dropped and counted; nothing is
//! allocated on the realtime side. Both critical sections are O(1) on the
//! producer side and O(pool) on the consumer side, and no I/O is done while
//! the lock is held.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::thread::{RealtimeThreadManager, RtThread};

/// Multi-channel block of `f32` samples, stored channel after channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    channels: usize,
    capacity: usize,
    frames: usize,
    /// Monotonic production sequence number
    pub seq: u64,
    data: Vec<f32>,
}

impl SampleBlock {
    /// Zeroed block holding `capacity` frames of `channels` channels.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels,
            capacity,
            frames: 0,
            seq: 0,
            data: vec![0.0; channels * capacity],
        }
    }

    /// Channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Valid frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Set the valid frame count, clamped to capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity);
    }

    /// Valid samples of one channel.
    pub fn channel(&self, ch: usize) -> &[f32] {
        let start = ch * self.capacity;
        &self.data[start..start + self.frames]
    }

    /// Whole capacity of one channel, for filling.
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        let start = ch * self.capacity;
        &mut self.data[start..start + self.capacity]
    }
}

/// Consumer-side destination for blocks.
pub trait BlockSink<B>: Send + 'static {
    /// Write one block. May block.
    fn write_block(&mut self, block: &B) -> Result<(), PipelineError>;

    /// True once the sink wants no more data (e.g. target duration reached).
    fn is_done(&self) -> bool {
        false
    }

    /// Close the sink. Called exactly once, when the consumer stops.
    fn finish(self) -> Result<(), PipelineError>
    where
        Self: Sized;
}

/// Result of one producer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStatus {
    /// The block was filled and queued
    Queued,
    /// No free block: the data was dropped and counted
    Dropped,
    /// The consumer has stopped; nothing more is accepted
    Finished,
}

struct Queues<B> {
    free: Vec<B>,
    pending: VecDeque<B>,
    closing: bool,
    finished: bool,
}

struct Shared<B> {
    queues: Mutex<Queues<B>>,
    ready: Condvar,
    pool_size: usize,
    produced: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
}

/// Counters of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    /// Blocks queued by the producer
    pub produced: u64,
    /// Producer calls that found the pool empty
    pub dropped: u64,
    /// Blocks written by the consumer
    pub written: u64,
}

/// A pre-populated pool of blocks plus the pending queue.
pub struct StreamingPipeline<B> {
    shared: Arc<Shared<B>>,
}

impl<B: Send + 'static> StreamingPipeline<B> {
    /// Pipeline with `count` blocks made by `make`. All allocation
    /// happens here.
    pub fn new(count: usize, make: impl FnMut() -> B) -> Result<Self, PipelineError> {
        if count == 0 {
            return Err(PipelineError::InvalidGeometry {
                reason: "pool needs at least one block".to_string(),
            });
        }
        let mut free = Vec::with_capacity(count);
        free.extend(std::iter::repeat_with(make).take(count));

        Ok(Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues {
                    free,
                    pending: VecDeque::with_capacity(count),
                    closing: false,
                    finished: false,
                }),
                ready: Condvar::new(),
                pool_size: count,
                produced: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                written: AtomicU64::new(0),
            }),
        })
    }

    /// The realtime side.
    pub fn producer(&self) -> PipelineProducer<B> {
        PipelineProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the consumer thread at normal priority.
    pub fn start_consumer<S: BlockSink<B>>(
        &self,
        threads: &RealtimeThreadManager,
        name: &str,
        sink: S,
    ) -> Result<PipelineConsumer<B>, PipelineError> {
        let shared = Arc::clone(&self.shared);
        let thread = threads.create_thread(name, 0, false, move || consume(&shared, sink))?;
        Ok(PipelineConsumer {
            shared: Arc::clone(&self.shared),
            thread,
        })
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        stats(&self.shared)
    }

    /// Blocks in the pool, in total.
    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }
}

fn stats<B>(shared: &Shared<B>) -> PipelineStats {
    PipelineStats {
        produced: shared.produced.load(Ordering::Relaxed),
        dropped: shared.dropped.load(Ordering::Relaxed),
        written: shared.written.load(Ordering::Relaxed),
    }
}

/// Realtime side of a pipeline.
pub struct PipelineProducer<B> {
    shared: Arc<Shared<B>>,
}

impl<B> PipelineProducer<B> {
    /// Take a free block, fill it with `fill`, queue it.
    ///
    /// Never allocates; `fill` runs without the lock held.
    pub fn produce(&mut self, fill: impl FnOnce(&mut B)) -> ProduceStatus {
        let mut block = {
            let mut q = self.shared.queues.lock();
            if q.finished {
                return ProduceStatus::Finished;
            }
            match q.free.pop() {
                Some(block) => block,
                None => {
                    drop(q);
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return ProduceStatus::Dropped;
                }
            }
        };

        fill(&mut block);

        {
            let mut q = self.shared.queues.lock();
            if q.finished {
                q.free.push(block);
                return ProduceStatus::Finished;
            }
            q.pending.push_back(block);
        }
        self.shared.produced.fetch_add(1, Ordering::Relaxed);
        self.shared.ready.notify_one();
        ProduceStatus::Queued
    }

    /// True once the consumer has stopped.
    pub fn is_finished(&self) -> bool {
        self.shared.queues.lock().finished
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        stats(&self.shared)
    }
}

/// Handle on a running consumer thread.
pub struct PipelineConsumer<B> {
    shared: Arc<Shared<B>>,
    thread: RtThread<Result<u64, PipelineError>>,
}

impl<B> PipelineConsumer<B> {
    /// True once the consumer has stopped on its own.
    pub fn is_finished(&self) -> bool {
        self.shared.queues.lock().finished
    }

    /// Ask the consumer to write what is pending and stop, then wait for it.
    /// Returns the number of blocks written.
    pub fn close(self) -> Result<u64, PipelineError> {
        self.shared.queues.lock().closing = true;
        self.shared.ready.notify_all();
        self.thread.join()?
    }
}

fn consume<B, S: BlockSink<B>>(shared: &Shared<B>, mut sink: S) -> Result<u64, PipelineError> {
    let mut batch: VecDeque<B> = VecDeque::with_capacity(shared.pool_size);
    let mut written = 0u64;
    let mut failure = None;

    loop {
        {
            let mut q = shared.queues.lock();
            while q.pending.is_empty() && !q.closing {
                shared.ready.wait(&mut q);
            }
            std::mem::swap(&mut q.pending, &mut batch);
        }

        for block in batch.iter() {
            if failure.is_some() || sink.is_done() {
                break;
            }
            match sink.write_block(block) {
                Ok(()) => {
                    written += 1;
                    shared.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => failure = Some(e),
            }
        }

        let stop = {
            let mut q = shared.queues.lock();
            q.free.extend(batch.drain(..));
            // A close still writes whatever was queued before it.
            let stop =
                failure.is_some() || sink.is_done() || (q.closing && q.pending.is_empty());
            if stop {
                q.finished = true;
                let unwritten = std::mem::take(&mut q.pending);
                q.free.extend(unwritten);
            }
            stop
        };
        if stop {
            break;
        }
    }

    let finished = sink.finish();
    if let Some(e) = failure {
        warn!("Pipeline consumer stopped on write error: {e}");
        return Err(e);
    }
    finished?;
    info!(
        written,
        dropped = shared.dropped.load(Ordering::Relaxed),
        "Streaming pipeline closed"
    );
    Ok(written)
}
