//! Integration tests against the real scheduler and threads

use jackal_rt::{
    BlockSink, DiagnosticChannel, DiagnosticSink, PipelineError, ProduceStatus,
    RealtimeThreadManager, SampleBlock, SchedParams, SchedPolicy, SchedulingOutcome,
    StreamingPipeline, rt_diag,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_realtime_request_granted_or_degraded() {
    let threads = RealtimeThreadManager::new();
    let t = threads
        .create_thread("rt-check", 10, true, || 7)
        .unwrap();
    let observed = t.observed().unwrap();

    match t.outcome() {
        SchedulingOutcome::Granted(params) => {
            assert_eq!(params, SchedParams::fifo(10));
            assert_eq!(observed, SchedParams::fifo(10));
        }
        SchedulingOutcome::Degraded { observed: seen, .. } => {
            assert_eq!(seen.policy, SchedPolicy::Other);
            assert_eq!(observed.policy, SchedPolicy::Other);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(t.join().unwrap(), 7);
}

#[test]
fn test_normal_thread_inherits_nothing() {
    let threads = RealtimeThreadManager::new();
    let t = threads.create_thread("plain", 0, false, || ()).unwrap();
    assert_eq!(t.outcome(), SchedulingOutcome::Normal);
    t.join().unwrap();
}

#[test]
fn test_calling_thread_can_toggle() {
    let threads = RealtimeThreadManager::new();
    let worker = threads
        .create_thread("toggle", 0, false, move || {
            let threads = RealtimeThreadManager::new();
            let first = threads.acquire_realtime_self(5).unwrap();
            let second = threads.acquire_realtime_self(5).unwrap();
            threads.drop_to_normal_self().unwrap();
            threads.drop_to_normal_self().unwrap();
            (first, second, threads.current_sched().unwrap())
        })
        .unwrap();

    let (first, second, after) = worker.join().unwrap();
    assert_eq!(first.is_granted(), second.is_granted());
    assert_eq!(after.policy, SchedPolicy::Other);
}

/// Blocks inside the first `emit` until released.
struct GatedSink {
    entered: Arc<AtomicBool>,
    gate: Arc<(Mutex<bool>, Condvar)>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl DiagnosticSink for GatedSink {
    fn emit(&mut self, message: &str) {
        self.entered.store(true, Ordering::SeqCst);
        let (open, cv) = &*self.gate;
        let mut open = open.lock();
        while !*open {
            cv.wait(&mut open);
        }
        self.seen.lock().push(message.to_string());
    }
}

#[test]
fn test_diagnostic_overruns_counted_exactly() {
    let threads = RealtimeThreadManager::new();
    let entered = Arc::new(AtomicBool::new(false));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let chan = DiagnosticChannel::start(
        &threads,
        GatedSink {
            entered: entered.clone(),
            gate: gate.clone(),
            seen: seen.clone(),
        },
    )
    .unwrap();

    assert!(rt_diag!(chan, "msg {}", 0));
    while !entered.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }

    // Drain thread is stuck in the sink with the ring empty.
    let slots = jackal_common::consts::DIAG_SLOTS;
    let extra = 9;
    let mut accepted = 0;
    for i in 1..=slots + extra {
        if rt_diag!(chan, "msg {i}") {
            accepted += 1;
        }
    }
    assert_eq!(accepted, slots);
    assert_eq!(chan.overrun_count(), extra as u64);

    {
        let (open, cv) = &*gate;
        *open.lock() = true;
        cv.notify_all();
    }
    let summary = chan.shutdown().unwrap();
    assert_eq!(summary.overruns, extra as u64);
    assert_eq!(summary.delivered, 1 + slots as u64);

    let expected: Vec<String> = (0..=slots).map(|i| format!("msg {i}")).collect();
    assert_eq!(*seen.lock(), expected);
}

struct RecordingSink {
    order: Arc<Mutex<Vec<u64>>>,
    finishes: Arc<AtomicUsize>,
    limit: Option<usize>,
}

impl BlockSink<SampleBlock> for RecordingSink {
    fn write_block(&mut self, block: &SampleBlock) -> Result<(), PipelineError> {
        self.order.lock().push(block.seq);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.limit.is_some_and(|n| self.order.lock().len() >= n)
    }

    fn finish(self) -> Result<(), PipelineError> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_pipeline_k_blocks_before_consumer_then_fifo() {
    const K: usize = 8;
    let threads = RealtimeThreadManager::new();
    let pipeline = StreamingPipeline::new(K, || SampleBlock::new(2, 64)).unwrap();
    let mut tx = pipeline.producer();

    for seq in 0..K as u64 {
        let status = tx.produce(|block| {
            block.seq = seq;
            block.channel_mut(0).fill(seq as f32);
            block.set_frames(64);
        });
        assert_eq!(status, ProduceStatus::Queued);
    }
    assert_eq!(tx.produce(|_| {}), ProduceStatus::Dropped);

    let order = Arc::new(Mutex::new(Vec::new()));
    let finishes = Arc::new(AtomicUsize::new(0));
    let consumer = pipeline
        .start_consumer(
            &threads,
            "capture-writer",
            RecordingSink {
                order: order.clone(),
                finishes: finishes.clone(),
                limit: None,
            },
        )
        .unwrap();

    // Blocks return to the pool and production continues in order.
    let mut seq = K as u64;
    while seq < 3 * K as u64 {
        if tx.produce(|block| block.seq = seq) == ProduceStatus::Queued {
            seq += 1;
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let written = consumer.close().unwrap();
    assert_eq!(written, 3 * K as u64);
    assert_eq!(*order.lock(), (0..3 * K as u64).collect::<Vec<_>>());
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.stats().dropped, 1);
}

#[test]
fn test_pipeline_stops_when_sink_done() {
    let threads = RealtimeThreadManager::new();
    let pipeline = StreamingPipeline::new(4, || SampleBlock::new(1, 16)).unwrap();
    let mut tx = pipeline.producer();
    let order = Arc::new(Mutex::new(Vec::new()));
    let finishes = Arc::new(AtomicUsize::new(0));
    let consumer = pipeline
        .start_consumer(
            &threads,
            "limited",
            RecordingSink {
                order: order.clone(),
                finishes: finishes.clone(),
                limit: Some(3),
            },
        )
        .unwrap();

    let mut seq = 0;
    while !consumer.is_finished() {
        if tx.produce(|block| block.seq = seq) == ProduceStatus::Queued {
            seq += 1;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(tx.produce(|_| {}), ProduceStatus::Finished);

    consumer.close().unwrap();
    assert_eq!(order.lock().len(), 3);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
}
