//! Engine integration tests
//!
//! Cycles are driven with `run_cycles` on the test thread unless a test is
//! about the process thread itself.

use jackal_engine::capture::{CaptureOptions, WavFormat, start_capture};
use jackal_engine::{
    Client, ClientId, ClosureClient, DummyDriver, EngineConfig, EngineError, EngineEvent,
    EngineResult, FreewheelDriver, GraphError, PortId, ProcessScope, ProcessStatus,
    ServerContext, engine::Engine,
};
use jackal_shared_memory::{AUDIO, EVENT, ShmConfig, ShmContext};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const PERIOD: u32 = 64;
const RATE: u32 = 48_000;

fn config(dir: &Path, prefix: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.period_frames = PERIOD;
    config.engine.sample_rate = RATE;
    config.engine.realtime = false;
    config.shm.directory = dir.to_path_buf();
    config.shm.prefix = prefix.to_string();
    config
}

fn server(dir: &Path, prefix: &str) -> EngineResult<ServerContext> {
    let driver = FreewheelDriver::new(PERIOD, RATE)?;
    ServerContext::init(config(dir, prefix), Box::new(driver))
}

fn boxed<F>(f: F) -> Box<dyn Client>
where
    F: FnMut(&mut ProcessScope<'_>) -> ProcessStatus + Send + 'static,
{
    Box::new(ClosureClient(f))
}

/// Active client writing `value` to one audio output.
fn source(engine: &mut Engine, name: &str, value: f32) -> EngineResult<PortId> {
    let client = engine.open_client(name)?;
    let mut out = engine.register_output(client, "out", AUDIO.id)?;
    let id = out.id();
    engine.activate(
        client,
        boxed(move |scope| {
            scope.output(&mut out).fill(value);
            ProcessStatus::Continue
        }),
    )?;
    Ok(id)
}

/// Active client keeping a copy of what its one audio input saw last cycle.
fn recorder(engine: &mut Engine, name: &str) -> EngineResult<(ClientId, PortId, Arc<Mutex<Vec<f32>>>)> {
    let client = engine.open_client(name)?;
    let input = engine.register_input(client, "in", AUDIO.id)?;
    let id = input.id();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.activate(
        client,
        boxed(move |scope| {
            let mut seen = sink.lock();
            seen.clear();
            seen.extend_from_slice(scope.input(&input));
            ProcessStatus::Continue
        }),
    )?;
    Ok((client, id, seen))
}

#[test]
fn test_single_source_is_read_in_place() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "inplace")?;
    let engine = server.engine_mut();

    let out = source(engine, "osc", 0.5)?;
    let (_, input, seen) = recorder(engine, "rec")?;
    engine.connect(out, input)?;

    assert_eq!(engine.port_address(input), engine.port_address(out));
    assert_eq!(engine.run_cycles(2)?, 2);
    assert_eq!(*seen.lock(), vec![0.5; PERIOD as usize]);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_multiple_sources_are_mixed() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "mix")?;
    let engine = server.engine_mut();

    let a = source(engine, "a", 0.25)?;
    let b = source(engine, "b", 0.5)?;
    let c = source(engine, "c", 1.0)?;
    let (_, input, seen) = recorder(engine, "rec")?;
    engine.connect_by_name("a:out", "rec:in")?;
    engine.connect(b, input)?;
    engine.connect(c, input)?;

    let mixed = engine.port_address(input);
    assert!(mixed.is_some());
    for src in [a, b, c] {
        assert_ne!(engine.port_address(src), mixed);
    }

    engine.run_cycles(1)?;
    assert_eq!(*seen.lock(), vec![1.75; PERIOD as usize]);

    // Back to a single source: in place again.
    engine.disconnect(b, input)?;
    engine.disconnect_by_name("c:out", "rec:in")?;
    assert_eq!(engine.port_address(input), engine.port_address(a));
    engine.run_cycles(1)?;
    assert_eq!(*seen.lock(), vec![0.25; PERIOD as usize]);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_unconnected_input_reads_zero_buffer() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "zero")?;
    let engine = server.engine_mut();

    let (_, input, seen) = recorder(engine, "rec")?;
    let address = engine.port_address(input).unwrap();
    assert_eq!(address.offset, 0);

    engine.run_cycles(1)?;
    assert_eq!(*seen.lock(), vec![0.0; PERIOD as usize]);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_connection_rules() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "rules")?;
    let engine = server.engine_mut();

    let a = engine.open_client("a")?;
    let a_out = engine.register_output(a, "out", AUDIO.id)?.id();
    let a_in = engine.register_input(a, "in", AUDIO.id)?.id();
    let b = engine.open_client("b")?;
    let b_out = engine.register_output(b, "out", AUDIO.id)?.id();
    let b_in = engine.register_input(b, "in", AUDIO.id)?.id();
    let b_events = engine.register_input(b, "events", EVENT.id)?.id();
    let a_events = engine.register_output(a, "events", EVENT.id)?.id();
    let c = engine.open_client("c")?;
    let c_events = engine.register_output(c, "events", EVENT.id)?.id();

    let err = engine.connect(a_in, b_out).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph {
            source: GraphError::WrongDirection { .. }
        }
    ));
    let err = engine.connect(a_out, b_events).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph {
            source: GraphError::TypeMismatch { .. }
        }
    ));

    engine.connect(a_out, b_in)?;
    let err = engine.connect(a_out, b_in).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph {
            source: GraphError::AlreadyConnected { .. }
        }
    ));

    // b feeding back into a
    let err = engine.connect(b_out, a_in).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph {
            source: GraphError::CycleDetected
        }
    ));

    // Event ports have no mixdown: one source only.
    engine.connect(a_events, b_events)?;
    let err = engine.connect(c_events, b_events).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph {
            source: GraphError::NoMixdown { .. }
        }
    ));

    let err = engine.connect_by_name("a:out", "nobody:in").unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph {
            source: GraphError::NoSuchPortName { .. }
        }
    ));
    assert_eq!(engine.graph().connection_count(), 2);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_snapshot_versions_are_monotonic() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "versions")?;
    let engine = server.engine_mut();

    let mut last = engine.snapshot().version;
    let out = source(engine, "osc", 1.0)?;
    assert!(engine.snapshot().version > last);
    last = engine.snapshot().version;

    let (_, input, _) = recorder(engine, "rec")?;
    engine.connect(out, input)?;
    assert!(engine.snapshot().version > last);

    // Stopped engine: every update is installed immediately.
    assert_eq!(engine.installed_version(), engine.snapshot().version);

    server.teardown()?;
    Ok(())
}

struct Failing {
    calls: Arc<AtomicUsize>,
    shut_down: Arc<AtomicBool>,
}

impl Client for Failing {
    fn process(&mut self, _scope: &mut ProcessScope<'_>) -> ProcessStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ProcessStatus::Failed(3)
    }

    fn shutdown(&mut self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_failed_client_is_removed_and_shut_down() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "failing")?;
    let engine = server.engine_mut();

    let calls = Arc::new(AtomicUsize::new(0));
    let shut_down = Arc::new(AtomicBool::new(false));
    let client = engine.open_client("broken")?;
    engine.activate(
        client,
        Box::new(Failing {
            calls: Arc::clone(&calls),
            shut_down: Arc::clone(&shut_down),
        }),
    )?;
    let (_, _, seen) = recorder(engine, "healthy")?;

    engine.run_cycles(1)?;
    let events = engine.poll()?;
    assert!(events.contains(&EngineEvent::ClientFailed { client, status: 3 }));
    assert!(shut_down.load(Ordering::SeqCst));
    assert!(!engine.graph().client(client)?.active);

    // Not invoked again; the rest of the graph keeps running.
    engine.run_cycles(3)?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().len(), PERIOD as usize);

    server.teardown()?;
    Ok(())
}

struct Slow {
    sleeps: usize,
    xruns: Arc<AtomicUsize>,
}

impl Client for Slow {
    fn process(&mut self, _scope: &mut ProcessScope<'_>) -> ProcessStatus {
        if self.sleeps > 0 {
            self.sleeps -= 1;
            // 64 frames at 48 kHz is 1.3 ms
            std::thread::sleep(Duration::from_millis(5));
        }
        ProcessStatus::Continue
    }

    fn xrun(&mut self) -> ProcessStatus {
        self.xruns.fetch_add(1, Ordering::SeqCst);
        ProcessStatus::Continue
    }
}

#[test]
fn test_overlong_cycle_is_an_xrun() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "xrun")?;
    let engine = server.engine_mut();

    let xruns = Arc::new(AtomicUsize::new(0));
    let client = engine.open_client("slow")?;
    engine.activate(
        client,
        Box::new(Slow {
            sleeps: 1,
            xruns: Arc::clone(&xruns),
        }),
    )?;

    engine.run_cycles(1)?;
    assert_eq!(engine.xrun_count(), 1);
    let events = engine.poll()?;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, EngineEvent::Xrun { elapsed_usecs, .. } if *elapsed_usecs > 1_333))
    );

    // Delivered between cycles, before the next one runs.
    engine.run_cycles(2)?;
    assert_eq!(xruns.load(Ordering::SeqCst), 1);
    assert_eq!(engine.xrun_count(), 1);
    assert_eq!(engine.cycle_count(), 3);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_buffer_size_change_moves_ports() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "resize")?;
    let engine = server.engine_mut();

    let resized = Arc::new(AtomicUsize::new(0));
    struct Watch(Arc<AtomicUsize>);
    impl Client for Watch {
        fn process(&mut self, _scope: &mut ProcessScope<'_>) -> ProcessStatus {
            ProcessStatus::Continue
        }
        fn buffer_size_changed(&mut self, nframes: u32) -> ProcessStatus {
            self.0.store(nframes as usize, Ordering::SeqCst);
            ProcessStatus::Continue
        }
    }
    let watcher = engine.open_client("watch")?;
    engine.activate(watcher, Box::new(Watch(Arc::clone(&resized))))?;

    let out = source(engine, "osc", 0.75)?;
    let (_, input, seen) = recorder(engine, "rec")?;
    engine.connect(out, input)?;
    engine.run_cycles(1)?;
    let before = engine.port_address(out).unwrap();

    assert!(matches!(
        engine.set_buffer_size(100),
        Err(EngineError::InvalidBufferSize { nframes: 100 })
    ));
    engine.set_buffer_size(128)?;
    assert_eq!(resized.load(Ordering::SeqCst), 128);

    let after = engine.port_address(out).unwrap();
    assert_ne!(after.segment, before.segment);
    assert_eq!(after.len, 128 * 4);
    assert_eq!(engine.port_address(input), Some(after));

    engine.run_cycles(1)?;
    assert_eq!(*seen.lock(), vec![0.75; 128]);
    assert_eq!(engine.nframes(), 128);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_pool_grows_up_to_port_limit() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "grow");
    config.engine.max_ports = 24;
    let driver = FreewheelDriver::new(PERIOD, RATE)?;
    let mut server = ServerContext::init(config, Box::new(driver))?;
    let engine = server.engine_mut();

    let client = engine.open_client("many")?;
    let first = engine.register_output(client, "out0", AUDIO.id)?.id();
    let first_address = engine.graph().port(first)?.buffer.address;
    for i in 1..24 {
        engine.register_output(client, &format!("out{i}"), AUDIO.id)?;
    }
    assert_eq!(engine.pool_capacity(AUDIO.id)?, 24);
    assert_eq!(engine.ports_in_use(AUDIO.id)?, 24);
    assert_ne!(
        engine.graph().port(first)?.buffer.address.segment,
        first_address.segment
    );

    let err = engine
        .register_output(client, "one_too_many", AUDIO.id)
        .unwrap_err();
    assert!(matches!(err, EngineError::TooManyPorts { max: 24 }));

    // Other port types have their own pool.
    engine.register_output(client, "events", EVENT.id)?;
    assert_eq!(engine.ports_in_use(EVENT.id)?, 1);

    server.teardown()?;
    Ok(())
}

#[test]
fn test_deactivate_and_close_release_resources() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "close")?;
    let engine = server.engine_mut();

    let out = source(engine, "osc", 0.5)?;
    let (rec, input, seen) = recorder(engine, "rec")?;
    engine.connect(out, input)?;
    assert_eq!(engine.ports_in_use(AUDIO.id)?, 2);

    engine.deactivate(rec)?;
    assert!(matches!(
        engine.deactivate(rec),
        Err(EngineError::NotActive { .. })
    ));
    assert_eq!(engine.port_address(input), None);
    seen.lock().clear();
    engine.run_cycles(1)?;
    assert!(seen.lock().is_empty());

    let osc = engine.graph().port(out)?.client;
    engine.close_client(osc)?;
    engine.close_client(rec)?;
    assert_eq!(engine.ports_in_use(AUDIO.id)?, 0);
    assert_eq!(engine.graph().connection_count(), 0);

    // Names are free again.
    source(engine, "osc", 0.5)?;

    server.teardown()?;
    Ok(())
}

#[test]
fn test_process_thread_runs_and_stops() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let driver = DummyDriver::new(PERIOD, RATE)?;
    let mut server = ServerContext::init(config(dir.path(), "thread"), Box::new(driver))?;
    let engine = server.engine_mut();

    let out = source(engine, "osc", 0.5)?;
    engine.start()?;
    assert!(engine.is_running());
    assert!(matches!(engine.start(), Err(EngineError::Running)));
    assert!(matches!(engine.run_cycles(1), Err(EngineError::Running)));

    // Graph changes while running are picked up between cycles.
    let (_, input, seen) = recorder(engine, "rec")?;
    engine.connect(out, input)?;
    std::thread::sleep(Duration::from_millis(100));
    engine.poll()?;

    engine.stop()?;
    assert!(!engine.is_running());
    assert!(matches!(engine.stop(), Err(EngineError::NotRunning)));
    assert!(engine.cycle_count() > 5, "{}", engine.cycle_count());
    assert_eq!(engine.installed_version(), engine.snapshot().version);
    assert_eq!(*seen.lock(), vec![0.5; PERIOD as usize]);

    let report = server.teardown()?;
    assert!(report.cycles > 5);
    Ok(())
}

#[test]
fn test_dropping_running_engine_stops_process_thread() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let driver = DummyDriver::new(PERIOD, RATE)?;
    let mut server = ServerContext::init(config(dir.path(), "dropped"), Box::new(driver))?;
    let engine = server.engine_mut();

    let cycles = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cycles);
    let client = engine.open_client("counter")?;
    engine.activate(
        client,
        boxed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ProcessStatus::Continue
        }),
    )?;
    engine.start()?;
    for _ in 0..100 {
        if cycles.load(Ordering::SeqCst) > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(cycles.load(Ordering::SeqCst) > 0);

    drop(server);
    let after_drop = cycles.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(cycles.load(Ordering::SeqCst), after_drop);
    Ok(())
}

#[test]
fn test_capture_records_wav() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "capture")?;
    let diag = server.diagnostics();
    let engine = server.engine_mut();

    let out = source(engine, "osc", 0.5)?;
    let path = dir.path().join("take.wav");
    let options = CaptureOptions {
        channels: 2,
        format: WavFormat::Int16,
        duration: Some(Duration::from_secs_f64(256.0 / RATE as f64)),
        ..CaptureOptions::new(&path)
    };
    let capture = start_capture(engine, diag, "capture", &options)?;
    assert_eq!(capture.ports().len(), 2);
    engine.connect(out, capture.ports()[0])?;

    engine.run_cycles(10)?;
    let stats = capture.stats();
    assert_eq!(stats.dropped, 0);
    capture.finish()?;

    let mut reader = hound::WavReader::open(&path)?;
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, RATE);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.duration(), 256);

    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 512);
    for frame in samples.chunks_exact(2) {
        assert_eq!(frame, [16_384, 0]);
    }

    server.teardown()?;
    Ok(())
}

#[test]
fn test_teardown_destroys_segments() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "teardown")?;
    let engine = server.engine_mut();
    source(engine, "osc", 0.5)?;
    engine.run_cycles(4)?;

    let report = server.teardown()?;
    assert_eq!(report.cycles, 4);
    assert_eq!(report.xruns, 0);

    let after = ShmContext::init(&ShmConfig {
        directory: dir.path().to_path_buf(),
        prefix: "teardown".to_string(),
        lock_segments: false,
    })?;
    assert!(after.registry().is_empty());
    Ok(())
}

#[test]
fn test_sample_rate_change() -> EngineResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut server = server(dir.path(), "rate")?;
    let engine = server.engine_mut();

    assert!(matches!(
        engine.set_sample_rate(0),
        Err(EngineError::Driver { .. })
    ));
    engine.set_sample_rate(44_100)?;
    assert_eq!(engine.sample_rate(), 44_100);
    assert_eq!(engine.snapshot().sample_rate, 44_100);

    server.teardown()?;
    Ok(())
}
