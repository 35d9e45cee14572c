//! Process cycle coordinator: trigger → invoke → complete, once per period.
//!
//! ## Cycle
//! ```text
//!   Idle ──► WaitForTrigger ──► Invoking ──► Complete ──┐
//!    ▲                                                  │
//!    └──────────────────────────────────────────────────┘
//! ```
//! - **Idle**: install pending graph updates, deliver between-cycle
//!   notifications (buffer size, sample rate, graph order, xrun).
//! - **WaitForTrigger**: block in [`Driver::wait`].
//! - **Invoking**: driver read, then for each active client in snapshot
//!   order: mixdown of multiply connected inputs, `process`. Driver write.
//! - **Complete**: timing statistics, CPU load, deadline check.
//!
//! ## Control hand-off
//! Three SPSC rings connect the coordinator to the control plane. Updates
//! come in boxed; the same box goes back out carrying whatever the process
//! thread let go of (the previous snapshot, removed clients), so nothing is
//! freed here. Events (xruns, failed clients) go out by value and are
//! dropped and counted if the ring is full.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use jackal_common::consts::{LOAD_ROLLING_COUNT, LOAD_ROLLING_INTERVAL_MS};
use jackal_rt::{DiagnosticSubmitter, rt_diag};
use tracing::{info, warn};

use crate::client::{Client, ProcessScope, ProcessStatus};
use crate::driver::Driver;
use crate::graph::{ClientId, GraphSnapshot, PortId};

/// Consecutive late wakeups tolerated before the engine halts.
pub const MAX_CONSECUTIVE_DELAYS: u32 = 10;

// ─── Cycle Statistics ───────────────────────────────────────────────

/// Timing of one run of the process thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    /// Cycles that invoked clients
    pub cycle_count: u64,
    /// Worst processing time [us]
    pub max_process_usecs: u64,
    /// Sum of processing times [us]
    pub total_process_usecs: u64,
    /// Worst wakeup delay reported by the driver [us]
    pub max_delay_usecs: u64,
    /// Missed deadlines, skipped cycles included
    pub xruns: u64,
}

impl CycleStats {
    /// Account one completed cycle.
    #[inline]
    pub fn record(&mut self, process_usecs: u64, delayed_usecs: u64) {
        self.cycle_count += 1;
        self.total_process_usecs += process_usecs;
        self.max_process_usecs = self.max_process_usecs.max(process_usecs);
        self.max_delay_usecs = self.max_delay_usecs.max(delayed_usecs);
    }

    /// Mean processing time [us]; 0 before the first cycle.
    pub fn avg_process_usecs(&self) -> u64 {
        self.total_process_usecs
            .checked_div(self.cycle_count)
            .unwrap_or(0)
    }
}

// ─── CPU Load ───────────────────────────────────────────────────────

/// Rolling CPU load estimate.
///
/// Keeps the last [`LOAD_ROLLING_COUNT`] processing times. Every
/// `rolling_interval` cycles (about [`LOAD_ROLLING_INTERVAL_MS`] worth) the
/// worst of them gives the spare time in a period and the load is smoothed
/// as `load = (1 - spare/period) * 50 + load * 0.5`.
#[derive(Debug, Clone)]
pub struct CpuLoad {
    period_usecs: u64,
    samples: [u64; LOAD_ROLLING_COUNT],
    index: usize,
    rolling_interval: u64,
    countdown: u64,
    spare_usecs: u64,
    load: f32,
}

impl CpuLoad {
    /// Estimator for a period of `period_usecs`.
    pub fn new(period_usecs: u64) -> Self {
        let mut load = Self {
            period_usecs: 0,
            samples: [0; LOAD_ROLLING_COUNT],
            index: 0,
            rolling_interval: 1,
            countdown: 1,
            spare_usecs: 0,
            load: 0.0,
        };
        load.reset(period_usecs);
        load
    }

    /// Restart for a new period length; keeps the last estimate.
    pub fn reset(&mut self, period_usecs: u64) {
        self.period_usecs = period_usecs;
        self.samples = [0; LOAD_ROLLING_COUNT];
        self.index = 0;
        self.rolling_interval = (LOAD_ROLLING_INTERVAL_MS * 1000)
            .checked_div(period_usecs)
            .unwrap_or(1)
            .max(1);
        self.countdown = self.rolling_interval;
        self.spare_usecs = 0;
    }

    /// Account one cycle. Returns the new load when it was recomputed.
    pub fn record(&mut self, usecs: u64) -> Option<f32> {
        self.samples[self.index] = usecs;
        self.index = (self.index + 1) % LOAD_ROLLING_COUNT;

        self.countdown -= 1;
        if self.countdown > 0 {
            return None;
        }
        self.countdown = self.rolling_interval;

        let max = self.samples.iter().copied().max().unwrap_or(0);
        self.spare_usecs = self.period_usecs.saturating_sub(max);
        if self.period_usecs > 0 {
            let busy = 1.0 - self.spare_usecs as f32 / self.period_usecs as f32;
            self.load = busy * 50.0 + self.load * 0.5;
        }
        Some(self.load)
    }

    /// Latest estimate [%].
    pub fn load(&self) -> f32 {
        self.load
    }

    /// Spare time in the worst recent cycle [µs]; 0 until first computed.
    pub fn spare_usecs(&self) -> u64 {
        self.spare_usecs
    }

    /// Period the estimator is sized for [µs].
    pub fn period_usecs(&self) -> u64 {
        self.period_usecs
    }
}

// ─── Control Hand-off ───────────────────────────────────────────────

/// Between-cycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// New period size (driver and buffers switch together)
    BufferSize(u32),
    /// New sample rate
    SampleRate(u32),
    /// Connections or order changed
    GraphReordered,
    /// A port was (un)registered
    PortRegistered {
        /// Port key
        port: PortId,
        /// Registered (true) or gone (false)
        registered: bool,
    },
    /// A client was opened or closed
    ClientRegistered {
        /// Client name
        name: String,
        /// Registered (true) or gone (false)
        registered: bool,
    },
}

/// One batch of changes for the process thread.
///
/// Built on the control thread with every vector pre-sized, applied on the
/// process thread between cycles, then sent back whole.
#[derive(Default)]
pub struct GraphUpdate {
    /// Snapshot to install; on return, the one it replaced
    pub snapshot: Option<Arc<GraphSnapshot>>,
    /// Clients to place in their slots
    pub activate: Vec<(usize, Box<dyn Client>)>,
    /// Slots to empty
    pub remove: Vec<(usize, ClientId)>,
    /// Clients taken out of `remove`'s slots; capacity reserved by the sender
    pub removed: Vec<(usize, ClientId, Box<dyn Client>)>,
    /// Delivered in order once the snapshot is installed
    pub notes: Vec<Notification>,
    /// Version of the snapshot this update installs
    pub version: u64,
}

impl GraphUpdate {
    /// Update installing `snapshot`.
    pub fn new(snapshot: Arc<GraphSnapshot>) -> Self {
        Self {
            version: snapshot.version,
            snapshot: Some(snapshot),
            ..Self::default()
        }
    }

    /// Queue a client removal, reserving room for its return.
    pub fn remove_client(&mut self, slot: usize, id: ClientId) {
        self.remove.push((slot, id));
        self.removed.reserve(self.remove.len() - self.removed.len());
    }
}

impl std::fmt::Debug for GraphUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphUpdate")
            .field("version", &self.version)
            .field("activate", &self.activate.len())
            .field("remove", &self.remove)
            .field("notes", &self.notes)
            .finish()
    }
}

/// Why the coordinator stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Too many consecutive late wakeups
    Delayed,
    /// The driver failed
    DriverFailed,
}

/// Reported from the process thread to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A cycle missed its deadline
    Xrun {
        /// Frame time at the start of the cycle
        frame_time: u64,
        /// Driver wakeup delay [µs]
        delayed_usecs: u64,
        /// Cycle processing time [µs]; 0 for a skipped cycle
        elapsed_usecs: u64,
    },
    /// A callback returned a failure; the client stops being invoked
    ClientFailed {
        /// The client
        client: ClientId,
        /// Failure code
        status: i32,
    },
    /// The coordinator stopped
    Halted {
        /// Cause
        reason: HaltReason,
    },
}

/// Counters shared with the control plane.
#[derive(Debug, Default)]
pub struct CycleShared {
    /// Cleared to stop the process thread
    pub running: AtomicBool,
    /// Completed cycles
    pub cycles: AtomicU64,
    /// Missed deadlines
    pub xruns: AtomicU64,
    /// CPU load [%] as `f32` bits
    pub load_bits: AtomicU32,
    /// Events lost to a full event ring
    pub events_dropped: AtomicU64,
    /// Version of the installed snapshot
    pub snapshot_version: AtomicU64,
}

impl CycleShared {
    /// CPU load [%].
    pub fn cpu_load(&self) -> f32 {
        f32::from_bits(self.load_bits.load(Ordering::Relaxed))
    }
}

/// Coordinator end of the three rings.
pub struct CoordinatorRings {
    /// Control → process thread
    pub updates: rtrb::Consumer<Box<GraphUpdate>>,
    /// Process thread → control, applied updates
    pub returns: rtrb::Producer<Box<GraphUpdate>>,
    /// Process thread → control, events
    pub events: rtrb::Producer<EngineEvent>,
}

/// Control end of the three rings.
pub struct ControlRings {
    /// Control → process thread
    pub updates: rtrb::Producer<Box<GraphUpdate>>,
    /// Process thread → control, applied updates
    pub returns: rtrb::Consumer<Box<GraphUpdate>>,
    /// Process thread → control, events
    pub events: rtrb::Consumer<EngineEvent>,
}

/// Create both ends. `updates` bounds the number of in-flight updates.
pub fn rings(updates: usize, events: usize) -> (ControlRings, CoordinatorRings) {
    let (update_tx, update_rx) = rtrb::RingBuffer::new(updates);
    let (return_tx, return_rx) = rtrb::RingBuffer::new(updates);
    let (event_tx, event_rx) = rtrb::RingBuffer::new(events);
    (
        ControlRings {
            updates: update_tx,
            returns: return_rx,
            events: event_rx,
        },
        CoordinatorRings {
            updates: update_rx,
            returns: return_tx,
            events: event_tx,
        },
    )
}

// ─── Coordinator ────────────────────────────────────────────────────

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Between cycles
    Idle,
    /// Blocked in the driver
    WaitForTrigger,
    /// Calling clients
    Invoking,
    /// Accounting the finished cycle
    Complete,
}

/// Outcome of one pass through the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every active client ran
    Completed,
    /// The wakeup was too late to be worth processing
    Skipped,
    /// The coordinator cannot continue
    Halted(HaltReason),
}

/// Runs the process cycle.
pub struct Coordinator {
    state: CycleState,
    driver: Box<dyn Driver>,
    snapshot: Arc<GraphSnapshot>,
    clients: Vec<Option<Box<dyn Client>>>,
    failed: Vec<bool>,
    rings: CoordinatorRings,
    diag: DiagnosticSubmitter,
    shared: Arc<CycleShared>,
    stats: CycleStats,
    load: CpuLoad,
    realtime: bool,
    frame_time: u64,
    consecutive_delays: u32,
    xrun_pending: bool,
}

impl Coordinator {
    /// Coordinator with room for `max_clients` client slots.
    pub fn new(
        driver: Box<dyn Driver>,
        snapshot: Arc<GraphSnapshot>,
        max_clients: usize,
        rings: CoordinatorRings,
        diag: DiagnosticSubmitter,
        shared: Arc<CycleShared>,
        realtime: bool,
    ) -> Self {
        let load = CpuLoad::new(period_usecs(&snapshot));
        shared
            .snapshot_version
            .store(snapshot.version, Ordering::Release);
        Self {
            state: CycleState::Idle,
            driver,
            snapshot,
            clients: std::iter::repeat_with(|| None).take(max_clients).collect(),
            failed: vec![false; max_clients],
            rings,
            diag,
            shared,
            stats: CycleStats::default(),
            load,
            realtime,
            frame_time: 0,
            consecutive_delays: 0,
            xrun_pending: false,
        }
    }

    /// Thread body: cycle until `running` is cleared or the coordinator halts.
    pub fn run(mut self) -> Self {
        if let Err(e) = self.driver.start() {
            rt_diag!(self.diag, "driver {} failed to start: {e}", self.driver.name());
            self.halt(HaltReason::DriverFailed);
            return self;
        }

        while self.shared.running.load(Ordering::Acquire) {
            if let CycleOutcome::Halted(_) = self.run_cycle() {
                break;
            }
        }

        if let Err(e) = self.driver.stop() {
            rt_diag!(self.diag, "driver {} failed to stop: {e}", self.driver.name());
        }
        self
    }

    /// One full pass: Idle → WaitForTrigger → Invoking → Complete.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.state = CycleState::Idle;
        self.apply_updates();
        if self.xrun_pending {
            self.xrun_pending = false;
            self.notify_each(|client| client.xrun());
        }

        self.state = CycleState::WaitForTrigger;
        let status = match self.driver.wait() {
            Ok(status) => status,
            Err(e) => {
                rt_diag!(self.diag, "driver wait failed: {e}");
                return self.halt(HaltReason::DriverFailed);
            }
        };

        let spare = self.load.spare_usecs();
        if self.realtime && spare > 0 && status.delayed_usecs >= spare {
            self.consecutive_delays += 1;
            rt_diag!(
                self.diag,
                "wakeup delayed {}us with {}us spare, skipping cycle",
                status.delayed_usecs,
                spare
            );
            self.xrun(status.delayed_usecs, 0);
            if self.consecutive_delays > MAX_CONSECUTIVE_DELAYS {
                rt_diag!(self.diag, "too many consecutive delays, halting");
                return self.halt(HaltReason::Delayed);
            }
            self.state = CycleState::Idle;
            return CycleOutcome::Skipped;
        }
        self.consecutive_delays = 0;

        self.state = CycleState::Invoking;
        let started = Instant::now();
        let nframes = self.snapshot.nframes;
        if let Err(e) = self.driver.read(nframes) {
            rt_diag!(self.diag, "driver read failed: {e}");
            return self.halt(HaltReason::DriverFailed);
        }
        self.invoke_clients(nframes);
        if let Err(e) = self.driver.write(nframes) {
            rt_diag!(self.diag, "driver write failed: {e}");
            return self.halt(HaltReason::DriverFailed);
        }

        self.state = CycleState::Complete;
        let elapsed = started.elapsed();
        let elapsed_usecs = elapsed.as_micros() as u64;
        self.stats.record(elapsed_usecs, status.delayed_usecs);
        if let Some(load) = self.load.record(elapsed_usecs) {
            self.shared.load_bits.store(load.to_bits(), Ordering::Relaxed);
        }
        if elapsed_usecs > self.load.period_usecs() {
            rt_diag!(
                self.diag,
                "cycle took {}us, period is {}us",
                elapsed_usecs,
                self.load.period_usecs()
            );
            self.xrun(status.delayed_usecs, elapsed_usecs);
        }

        self.frame_time += nframes as u64;
        self.shared.cycles.fetch_add(1, Ordering::Relaxed);
        self.state = CycleState::Idle;
        CycleOutcome::Completed
    }

    fn invoke_clients(&mut self, nframes: u32) {
        let snapshot = &self.snapshot;
        for entry in &snapshot.order {
            if self.failed[entry.slot] {
                continue;
            }
            let Some(client) = self.clients[entry.slot].as_mut() else {
                continue;
            };

            for port in &entry.ports {
                let Some(kernel) = port.mixdown else {
                    continue;
                };
                let segment = &snapshot.segments[port.type_index];
                // SAFETY: addresses validated at snapshot build; the mixdown
                // region belongs to this input alone and every source was
                // written by a client earlier in the order.
                let dst = unsafe { segment.slice_mut(&port.address) };
                for (i, src) in port.mix.iter().enumerate() {
                    kernel(dst, unsafe { segment.slice(src) }, i == 0);
                }
            }

            let mut scope = ProcessScope::new(nframes, self.frame_time, entry, &snapshot.segments);
            if let ProcessStatus::Failed(status) = client.process(&mut scope) {
                self.failed[entry.slot] = true;
                rt_diag!(self.diag, "client {:?} failed with status {status}", entry.id);
                push_event(
                    &mut self.rings.events,
                    &self.shared,
                    EngineEvent::ClientFailed {
                        client: entry.id,
                        status,
                    },
                );
            }
        }
    }

    fn xrun(&mut self, delayed_usecs: u64, elapsed_usecs: u64) {
        self.stats.xruns += 1;
        self.shared.xruns.fetch_add(1, Ordering::Relaxed);
        self.xrun_pending = true;
        push_event(
            &mut self.rings.events,
            &self.shared,
            EngineEvent::Xrun {
                frame_time: self.frame_time,
                delayed_usecs,
                elapsed_usecs,
            },
        );
    }

    fn halt(&mut self, reason: HaltReason) -> CycleOutcome {
        self.shared.running.store(false, Ordering::Release);
        push_event(&mut self.rings.events, &self.shared, EngineEvent::Halted { reason });
        self.state = CycleState::Idle;
        CycleOutcome::Halted(reason)
    }

    /// Install every queued update the return ring has room for.
    pub fn apply_updates(&mut self) {
        while self.rings.returns.slots() > 0 {
            let Ok(mut update) = self.rings.updates.pop() else {
                break;
            };
            self.install(&mut update);
            if self.rings.returns.push(update).is_err() {
                rt_diag!(self.diag, "update return ring full");
            }
        }
    }

    fn install(&mut self, update: &mut GraphUpdate) {
        for (slot, client) in update.activate.drain(..) {
            if let Some(cell) = self.clients.get_mut(slot) {
                self.failed[slot] = false;
                *cell = Some(client);
            }
        }
        for &(slot, id) in &update.remove {
            if let Some(client) = self.clients.get_mut(slot).and_then(Option::take) {
                update.removed.push((slot, id, client));
            }
        }
        if let Some(snapshot) = update.snapshot.take() {
            let previous = std::mem::replace(&mut self.snapshot, snapshot);
            self.shared
                .snapshot_version
                .store(self.snapshot.version, Ordering::Release);
            update.snapshot = Some(previous);
        }

        for note in &update.notes {
            match note {
                Notification::BufferSize(nframes) => {
                    let nframes = *nframes;
                    if let Err(e) = self.driver.set_buffer_size(nframes) {
                        rt_diag!(self.diag, "driver refused buffer size {nframes}: {e}");
                    }
                    self.load.reset(period_usecs(&self.snapshot));
                    self.notify_each(|client| client.buffer_size_changed(nframes));
                }
                Notification::SampleRate(rate) => {
                    let rate = *rate;
                    if let Err(e) = self.driver.set_sample_rate(rate) {
                        rt_diag!(self.diag, "driver refused sample rate {rate}: {e}");
                    }
                    self.load.reset(period_usecs(&self.snapshot));
                    self.notify_each(|client| client.sample_rate_changed(rate));
                }
                Notification::GraphReordered => {
                    self.notify_each(|client| client.graph_order_changed());
                }
                Notification::PortRegistered { port, registered } => {
                    self.notify_each(|client| {
                        client.port_registered(*port, *registered);
                        ProcessStatus::Continue
                    });
                }
                Notification::ClientRegistered { name, registered } => {
                    self.notify_each(|client| {
                        client.client_registered(name, *registered);
                        ProcessStatus::Continue
                    });
                }
            }
        }
    }

    /// Call `f` on every active, healthy client in graph order.
    fn notify_each(&mut self, mut f: impl FnMut(&mut dyn Client) -> ProcessStatus) {
        for entry in &self.snapshot.order {
            if self.failed[entry.slot] {
                continue;
            }
            let Some(client) = self.clients[entry.slot].as_mut() else {
                continue;
            };
            if let ProcessStatus::Failed(status) = f(client.as_mut()) {
                self.failed[entry.slot] = true;
                rt_diag!(self.diag, "client {:?} failed a notification with status {status}", entry.id);
                push_event(
                    &mut self.rings.events,
                    &self.shared,
                    EngineEvent::ClientFailed {
                        client: entry.id,
                        status,
                    },
                );
            }
        }
    }

    /// Empty every slot (engine shutdown, thread stopped).
    pub fn take_clients(&mut self) -> Vec<(usize, Box<dyn Client>)> {
        self.clients
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, cell)| cell.take().map(|c| (slot, c)))
            .collect()
    }

    /// Current state.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Timing statistics.
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Installed snapshot.
    pub fn snapshot(&self) -> &Arc<GraphSnapshot> {
        &self.snapshot
    }

    /// Frames processed so far.
    pub fn frame_time(&self) -> u64 {
        self.frame_time
    }

    /// Driver in use.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Log a summary of the run (control thread only).
    pub fn log_summary(&self) {
        let s = &self.stats;
        if s.cycle_count == 0 {
            return;
        }
        info!(
            cycles = s.cycle_count,
            avg_us = s.avg_process_usecs(),
            max_us = s.max_process_usecs,
            max_delay_us = s.max_delay_usecs,
            "Process cycle statistics"
        );
        if s.xruns > 0 {
            warn!(xruns = s.xruns, "Deadlines were missed during the run");
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("driver", &self.driver.name())
            .field("version", &self.snapshot.version)
            .field("frame_time", &self.frame_time)
            .finish_non_exhaustive()
    }
}

fn push_event(events: &mut rtrb::Producer<EngineEvent>, shared: &CycleShared, event: EngineEvent) {
    if events.push(event).is_err() {
        shared.events_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

fn period_usecs(snapshot: &GraphSnapshot) -> u64 {
    (snapshot.nframes as u64 * 1_000_000)
        .checked_div(snapshot.sample_rate as u64)
        .unwrap_or(0)
}
