//! Diagnostic channel safe to use from the realtime path
//!
//! A fixed ring of fixed-size message slots behind one mutex. Submitters
//! format into a stack buffer first, then only *try* the lock: on
//! contention or a full ring the message is dropped and an overrun counter
//! is bumped. Submission never blocks and never allocates.
//!
//! A normal-priority drain thread waits on the condition variable, moves
//! every queued message out under the lock, and writes them to a
//! [`DiagnosticSink`] with the lock released.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use jackal_common::consts::{DIAG_MESSAGE_LEN, DIAG_SLOTS};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::error::ThreadError;
use crate::thread::{RealtimeThreadManager, RtThread};

/// One formatted diagnostic message, truncated to `DIAG_MESSAGE_LEN` bytes.
pub type DiagMessage = heapless::String<DIAG_MESSAGE_LEN>;

/// Destination for drained messages. Runs off the realtime path and may block.
pub trait DiagnosticSink: Send + 'static {
    /// Write one message.
    fn emit(&mut self, message: &str);

    /// Called once after the final drain at shutdown.
    fn flush(&mut self) {}
}

/// Sink forwarding every message to `tracing` at WARN level.
#[derive(Debug, Clone)]
pub struct TracingSink {
    prefix: String,
}

impl TracingSink {
    /// Sink prepending `prefix` to every message.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl DiagnosticSink for TracingSink {
    fn emit(&mut self, message: &str) {
        warn!(target: "jackal::rt", "{}{}", self.prefix, message);
    }
}

/// Writes into a fixed buffer, silently dropping what does not fit.
struct Truncating<'a>(&'a mut DiagMessage);

impl fmt::Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Format `args` into a message without allocating.
pub fn format_message(args: fmt::Arguments<'_>) -> DiagMessage {
    let mut msg = DiagMessage::new();
    let _ = fmt::write(&mut Truncating(&mut msg), args);
    msg
}

struct Ring {
    slots: Box<[DiagMessage]>,
    head: usize,
    tail: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: (0..DIAG_SLOTS).map(|_| DiagMessage::new()).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.head - self.tail == self.slots.len()
    }

    fn push(&mut self, msg: &DiagMessage) {
        let idx = self.head % self.slots.len();
        self.slots[idx].clone_from(msg);
        self.head += 1;
    }

    fn drain_into(&mut self, out: &mut Vec<DiagMessage>) {
        while self.tail != self.head {
            let idx = self.tail % self.slots.len();
            out.push(std::mem::take(&mut self.slots[idx]));
            self.tail += 1;
        }
    }
}

struct Shared {
    ring: Mutex<Ring>,
    wake: Condvar,
    overruns: AtomicU64,
    delivered: AtomicU64,
    done: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            ring: Mutex::new(Ring::new()),
            wake: Condvar::new(),
            overruns: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            done: AtomicBool::new(false),
        }
    }

    fn submit(&self, args: fmt::Arguments<'_>) -> bool {
        let msg = format_message(args);

        let Some(mut ring) = self.ring.try_lock() else {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if ring.is_full() {
            drop(ring);
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        ring.push(&msg);
        drop(ring);
        self.wake.notify_one();
        true
    }

    fn drain_loop(&self, sink: &mut dyn DiagnosticSink) {
        let mut batch = Vec::with_capacity(DIAG_SLOTS);
        loop {
            let done = {
                let mut ring = self.ring.lock();
                while ring.is_empty() && !self.done.load(Ordering::Acquire) {
                    self.wake.wait(&mut ring);
                }
                ring.drain_into(&mut batch);
                self.done.load(Ordering::Acquire)
            };
            self.emit_batch(&mut batch, sink);
            if done {
                break;
            }
        }
    }

    fn emit_batch(&self, batch: &mut Vec<DiagMessage>, sink: &mut dyn DiagnosticSink) {
        for msg in batch.drain(..) {
            sink.emit(&msg);
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stop(&self) {
        {
            let _ring = self.ring.lock();
            self.done.store(true, Ordering::Release);
        }
        self.wake.notify_all();
    }
}

/// Cloneable submission handle for realtime threads.
#[derive(Clone)]
pub struct DiagnosticSubmitter {
    shared: Arc<Shared>,
}

impl DiagnosticSubmitter {
    /// Queue a message. Returns `false` if it was dropped.
    #[inline]
    pub fn submit(&self, args: fmt::Arguments<'_>) -> bool {
        self.shared.submit(args)
    }

    /// Messages dropped so far.
    pub fn overrun_count(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for DiagnosticSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticSubmitter")
            .field("overruns", &self.overrun_count())
            .finish()
    }
}

/// Totals reported at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticSummary {
    /// Messages written to the sink
    pub delivered: u64,
    /// Messages dropped on contention or a full ring
    pub overruns: u64,
}

/// The channel and its drain thread.
pub struct DiagnosticChannel {
    shared: Arc<Shared>,
    drain: Option<RtThread<Box<dyn DiagnosticSink>>>,
}

impl DiagnosticChannel {
    /// Create the channel and start its drain thread at normal priority.
    pub fn start(
        threads: &RealtimeThreadManager,
        sink: impl DiagnosticSink,
    ) -> Result<Self, ThreadError> {
        let shared = Arc::new(Shared::new());

        let drain_shared = Arc::clone(&shared);
        let mut sink: Box<dyn DiagnosticSink> = Box::new(sink);
        let drain = threads.create_thread("jackal-diag", 0, false, move || {
            drain_shared.drain_loop(sink.as_mut());
            sink
        })?;

        Ok(Self {
            shared,
            drain: Some(drain),
        })
    }

    /// Handle for submitting from other threads.
    pub fn submitter(&self) -> DiagnosticSubmitter {
        DiagnosticSubmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue a message. Returns `false` if it was dropped.
    #[inline]
    pub fn submit(&self, args: fmt::Arguments<'_>) -> bool {
        self.shared.submit(args)
    }

    /// Messages dropped so far.
    pub fn overrun_count(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// Stop the drain thread, flush what is left and report the totals.
    pub fn shutdown(mut self) -> Result<DiagnosticSummary, ThreadError> {
        self.shared.stop();
        if let Some(drain) = self.drain.take() {
            let mut sink = drain.join()?;

            // Messages that raced the drain thread's exit.
            let mut rest = Vec::with_capacity(DIAG_SLOTS);
            self.shared.ring.lock().drain_into(&mut rest);
            self.shared.emit_batch(&mut rest, sink.as_mut());
            sink.flush();
        }

        let summary = DiagnosticSummary {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            overruns: self.overrun_count(),
        };
        if summary.overruns > 0 {
            warn!(
                overruns = summary.overruns,
                "Diagnostic messages were dropped under contention"
            );
        }
        info!(delivered = summary.delivered, "Diagnostic channel shut down");
        Ok(summary)
    }
}

impl Drop for DiagnosticChannel {
    fn drop(&mut self) {
        if self.drain.is_some() {
            self.shared.stop();
        }
    }
}

impl fmt::Debug for DiagnosticChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticChannel")
            .field("overruns", &self.overrun_count())
            .field("running", &self.drain.is_some())
            .finish()
    }
}

/// Submit a formatted diagnostic without blocking.
///
/// ```rust,ignore
/// rt_diag!(submitter, "xrun: cycle took {} us", elapsed_us);
/// ```
#[macro_export]
macro_rules! rt_diag {
    ($chan:expr, $($arg:tt)+) => {
        $chan.submit(format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Arc<Mutex<Vec<String>>>);

    impl DiagnosticSink for Collect {
        fn emit(&mut self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_long_messages_truncated() {
        let long = "x".repeat(DIAG_MESSAGE_LEN * 2);
        let msg = format_message(format_args!("{long}"));
        assert_eq!(msg.len(), DIAG_MESSAGE_LEN);
    }

    #[test]
    fn test_contended_lock_drops_message() {
        let shared = Shared::new();
        {
            let _held = shared.ring.lock();
            assert!(!shared.submit(format_args!("lost {}", 1)));
        }
        assert!(shared.submit(format_args!("kept {}", 2)));
        assert_eq!(shared.overruns.load(Ordering::Relaxed), 1);

        let mut sink = Collect::default();
        let seen = sink.0.clone();
        let mut batch = Vec::new();
        shared.ring.lock().drain_into(&mut batch);
        shared.emit_batch(&mut batch, &mut sink);
        assert_eq!(*seen.lock(), vec!["kept 2".to_string()]);
    }

    #[test]
    fn test_full_ring_counts_every_drop() {
        let shared = Shared::new();
        for i in 0..DIAG_SLOTS + 5 {
            shared.submit(format_args!("m{i}"));
        }
        assert_eq!(shared.overruns.load(Ordering::Relaxed), 5);
        assert!(shared.ring.lock().is_full());
    }

    #[test]
    fn test_shutdown_flushes_in_order() {
        let threads = RealtimeThreadManager::new();
        let sink = Collect::default();
        let seen = sink.0.clone();
        let chan = DiagnosticChannel::start(&threads, sink).unwrap();
        let submitter = chan.submitter();
        let mut sent = Vec::new();
        for i in 0..10 {
            if rt_diag!(submitter, "event {i}") {
                sent.push(format!("event {i}"));
            }
        }

        let summary = chan.shutdown().unwrap();
        assert_eq!(summary.delivered as usize, sent.len());
        assert_eq!(summary.overruns as usize, 10 - sent.len());
        assert_eq!(*seen.lock(), sent);
    }
}
