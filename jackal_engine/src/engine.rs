//! Engine control plane
//!
//! Owns the shared memory context, one port pool per port type, the
//! connection graph and the control end of the coordinator rings. Every
//! change to the graph publishes a new snapshot; the process thread picks it
//! up before its next cycle and hands the old one back.
//!
//! Buffers and pool generations the process thread may still reference are
//! not reused until a snapshot without them has been installed: frees are
//! tagged with the version that first excludes them and released once that
//! version comes back through the return ring.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use jackal_rt::{DiagnosticSubmitter, RealtimeThreadManager, RtThread, lock_process_memory};
use jackal_shared_memory::{
    AUDIO, BufferAddress, EVENT, PortBuffer, PortPool, PortType, PortTypeId, ShmContext, ShmError,
};
use tracing::{debug, error, info, warn};

use crate::client::{Client, InputPort, OutputPort};
use crate::config::{EngineConfig, EngineSection};
use crate::cycle::{
    ControlRings, Coordinator, CycleOutcome, CycleShared, EngineEvent, GraphUpdate, Notification,
    rings,
};
use crate::driver::Driver;
use crate::error::{DriverError, EngineError, EngineResult, GraphError};
use crate::graph::{ClientId, Graph, GraphSnapshot, PortDirection, PortId, TypeBuffers};

/// Buffers per port type before the first pool growth.
pub const INITIAL_POOL_CAPACITY: usize = 16;

/// Updates in flight between control and process thread.
const UPDATE_RING_SIZE: usize = 64;

/// Events buffered from the process thread.
const EVENT_RING_SIZE: usize = 256;

struct PendingFree {
    version: u64,
    type_index: usize,
    buffer: PortBuffer,
}

struct RetiredPool {
    version: u64,
    pool: PortPool,
}

/// The engine.
pub struct Engine {
    section: EngineSection,
    ctx: Option<ShmContext>,
    threads: RealtimeThreadManager,
    types: Vec<PortType>,
    pools: Vec<PortPool>,
    graph: Graph,
    nframes: u32,
    sample_rate: u32,
    version: u64,
    installed_version: u64,
    latest: Arc<GraphSnapshot>,
    free_slots: Vec<usize>,
    rings: ControlRings,
    backlog: VecDeque<Box<GraphUpdate>>,
    pending_frees: Vec<PendingFree>,
    retired_pools: Vec<RetiredPool>,
    shutdown_on_return: BTreeSet<ClientId>,
    shared: Arc<CycleShared>,
    coordinator: Option<Coordinator>,
    rt: Option<RtThread<Coordinator>>,
}

impl Engine {
    /// Build a stopped engine.
    pub fn new(
        config: &EngineConfig,
        mut ctx: ShmContext,
        threads: RealtimeThreadManager,
        diag: DiagnosticSubmitter,
        mut driver: Box<dyn Driver>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let section = config.engine.clone();
        driver.set_buffer_size(section.period_frames)?;
        driver.set_sample_rate(section.sample_rate)?;

        let types = vec![AUDIO, EVENT];
        let capacity = INITIAL_POOL_CAPACITY.min(section.max_ports);
        let pools = types
            .iter()
            .map(|t| PortPool::create(&mut ctx, *t, section.period_frames, capacity))
            .collect::<Result<Vec<_>, _>>()?;

        let graph = Graph::new();
        let snapshot = Arc::new(graph.snapshot(
            0,
            section.period_frames,
            section.sample_rate,
            &type_buffers(&pools),
        )?);

        let (control, coordinator_rings) = rings(UPDATE_RING_SIZE, EVENT_RING_SIZE);
        let shared = Arc::new(CycleShared::default());
        info!(
            driver = driver.name(),
            period_frames = section.period_frames,
            sample_rate = section.sample_rate,
            period_us = section.period_usecs(),
            "Engine created"
        );
        let coordinator = Coordinator::new(
            driver,
            Arc::clone(&snapshot),
            section.max_clients,
            coordinator_rings,
            diag,
            Arc::clone(&shared),
            section.realtime,
        );

        Ok(Self {
            nframes: section.period_frames,
            sample_rate: section.sample_rate,
            free_slots: (0..section.max_clients).rev().collect(),
            section,
            ctx: Some(ctx),
            threads,
            types,
            pools,
            graph,
            version: 0,
            installed_version: 0,
            latest: snapshot,
            rings: control,
            backlog: VecDeque::new(),
            pending_frees: Vec::new(),
            retired_pools: Vec::new(),
            shutdown_on_return: BTreeSet::new(),
            shared,
            coordinator: Some(coordinator),
            rt: None,
        })
    }

    // ─── Clients ────────────────────────────────────────────────────

    /// Register a client. It is not invoked until activated.
    pub fn open_client(&mut self, name: &str) -> EngineResult<ClientId> {
        let slot = self.free_slots.pop().ok_or(EngineError::TooManyClients {
            max: self.section.max_clients,
        })?;
        let id = match self.graph.add_client(name, slot) {
            Ok(id) => id,
            Err(e) => {
                self.free_slots.push(slot);
                return Err(e.into());
            }
        };
        info!(client = name, slot, "Client opened");
        self.publish(
            Vec::new(),
            Vec::new(),
            vec![Notification::ClientRegistered {
                name: name.to_string(),
                registered: true,
            }],
        )?;
        Ok(id)
    }

    /// Start invoking `handler` for `client` from the next cycle on.
    ///
    /// Every port buffer of the client is validated first; a client whose
    /// buffers cannot be resolved is not activated.
    pub fn activate(&mut self, client: ClientId, handler: Box<dyn Client>) -> EngineResult<()> {
        let info = self.graph.client(client)?;
        if info.active {
            return Err(EngineError::AlreadyActive { id: client });
        }
        for port in &info.ports {
            let port = self.graph.port(*port)?;
            self.pools[port.type_index].validate(&port.buffer)?;
        }
        let slot = info.slot;

        self.graph.set_active(client, true)?;
        info!(client = ?client, "Client activated");
        self.publish(
            vec![(slot, handler)],
            Vec::new(),
            vec![Notification::GraphReordered],
        )
    }

    /// Stop invoking a client. Its handler is dropped off the process thread.
    pub fn deactivate(&mut self, client: ClientId) -> EngineResult<()> {
        let info = self.graph.client(client)?;
        if !info.active {
            return Err(EngineError::NotActive { id: client });
        }
        let slot = info.slot;
        self.graph.set_active(client, false)?;
        info!(client = ?client, "Client deactivated");
        self.publish(
            Vec::new(),
            vec![(slot, client)],
            vec![Notification::GraphReordered],
        )
    }

    /// Unregister a client and all its ports. An active client is removed
    /// from the graph first and its `shutdown` callback runs once the
    /// process thread has let go of it.
    pub fn close_client(&mut self, client: ClientId) -> EngineResult<()> {
        let info = self.graph.client(client)?.clone();
        let mut remove = Vec::new();
        if info.active {
            self.shutdown_on_return.insert(client);
            remove.push((info.slot, client));
        }

        let had_connections = info
            .ports
            .iter()
            .any(|p| self.graph.connections_of(*p).next().is_some());
        let (info, ports) = self.graph.remove_client(client)?;
        let version = self.version + 1;
        let mut notes = Vec::with_capacity(ports.len() + 2);
        for port in ports {
            notes.push(Notification::PortRegistered {
                port: port.id,
                registered: false,
            });
            self.pending_frees.push(PendingFree {
                version,
                type_index: port.type_index,
                buffer: port.buffer,
            });
        }
        notes.push(Notification::ClientRegistered {
            name: info.name.clone(),
            registered: false,
        });
        if had_connections || info.active {
            notes.push(Notification::GraphReordered);
        }
        self.free_slots.push(info.slot);

        info!(client = %info.name, "Client closed");
        self.publish(Vec::new(), remove, notes)
    }

    // ─── Ports ──────────────────────────────────────────────────────

    /// Register an input port.
    pub fn register_input(
        &mut self,
        client: ClientId,
        name: &str,
        port_type: PortTypeId,
    ) -> EngineResult<InputPort> {
        let id = self.register_port(client, name, PortDirection::Input, port_type)?;
        Ok(InputPort {
            id,
            client,
            type_id: port_type,
        })
    }

    /// Register an output port.
    pub fn register_output(
        &mut self,
        client: ClientId,
        name: &str,
        port_type: PortTypeId,
    ) -> EngineResult<OutputPort> {
        let id = self.register_port(client, name, PortDirection::Output, port_type)?;
        Ok(OutputPort {
            id,
            client,
            type_id: port_type,
        })
    }

    fn register_port(
        &mut self,
        client: ClientId,
        name: &str,
        direction: PortDirection,
        port_type: PortTypeId,
    ) -> EngineResult<PortId> {
        self.graph.client(client)?;
        let type_index = self.type_index(port_type)?;
        let buffer = self.alloc_buffer(type_index)?;

        let port = match self.graph.add_port(
            client,
            name,
            direction,
            &self.types[type_index],
            type_index,
            buffer,
        ) {
            Ok(port) => port,
            Err(e) => {
                self.pools[type_index].free(&buffer);
                return Err(e.into());
            }
        };
        debug!(port = ?port, name, offset = buffer.address.offset, "Port registered");
        self.publish(
            Vec::new(),
            Vec::new(),
            vec![Notification::PortRegistered {
                port,
                registered: true,
            }],
        )?;
        Ok(port)
    }

    /// Unregister a port, dropping its connections.
    pub fn unregister_port(&mut self, port: PortId) -> EngineResult<()> {
        let had_connections = self.graph.connections_of(port).next().is_some();
        let info = self.graph.remove_port(port)?;
        self.pending_frees.push(PendingFree {
            version: self.version + 1,
            type_index: info.type_index,
            buffer: info.buffer,
        });

        let mut notes = vec![Notification::PortRegistered {
            port,
            registered: false,
        }];
        if had_connections {
            notes.push(Notification::GraphReordered);
        }
        debug!(port = %info.name, "Port unregistered");
        self.publish(Vec::new(), Vec::new(), notes)
    }

    fn type_index(&self, id: PortTypeId) -> EngineResult<usize> {
        self.types
            .iter()
            .position(|t| t.id == id)
            .ok_or(EngineError::UnknownPortType { id: id.0 })
    }

    fn alloc_buffer(&mut self, type_index: usize) -> EngineResult<PortBuffer> {
        match self.pools[type_index].alloc() {
            Ok(buffer) => Ok(buffer),
            Err(ShmError::ResourceExhausted) => {
                let capacity = self.pools[type_index].capacity();
                let max = self.section.max_ports;
                if capacity >= max {
                    return Err(EngineError::TooManyPorts { max });
                }
                let grown = (capacity * 2).min(max);
                info!(
                    port_type = self.types[type_index].name,
                    from = capacity,
                    to = grown,
                    "Growing port pool"
                );
                self.regenerate(type_index, grown, self.nframes)?;
                Ok(self.pools[type_index].alloc()?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a pool with a fresh segment and re-place every port of its
    /// type. The old pool is retired with the next published version.
    fn regenerate(&mut self, type_index: usize, capacity: usize, nframes: u32) -> EngineResult<()> {
        let ctx = self.ctx.as_mut().ok_or(EngineError::Closed)?;
        let mut pool = PortPool::create(ctx, self.types[type_index], nframes, capacity)?;
        let ports: Vec<PortId> = self
            .graph
            .ports()
            .filter(|p| p.type_index == type_index)
            .map(|p| p.id)
            .collect();
        for port in ports {
            let buffer = pool.alloc()?;
            self.graph.set_buffer(port, buffer)?;
        }

        let old = std::mem::replace(&mut self.pools[type_index], pool);
        self.retired_pools.push(RetiredPool {
            version: self.version + 1,
            pool: old,
        });
        Ok(())
    }

    // ─── Connections ────────────────────────────────────────────────

    /// Connect an output to an input.
    pub fn connect(&mut self, src: PortId, dst: PortId) -> EngineResult<()> {
        self.graph.connect(src, dst)?;
        debug!(src = ?src, dst = ?dst, "Connected");
        self.publish(Vec::new(), Vec::new(), vec![Notification::GraphReordered])
    }

    /// Connect by `client:port` names.
    pub fn connect_by_name(&mut self, src: &str, dst: &str) -> EngineResult<()> {
        let src = self.graph.port_by_name(src)?;
        let dst = self.graph.port_by_name(dst)?;
        self.connect(src, dst)
    }

    /// Remove a connection.
    pub fn disconnect(&mut self, src: PortId, dst: PortId) -> EngineResult<()> {
        self.graph.disconnect(src, dst)?;
        debug!(src = ?src, dst = ?dst, "Disconnected");
        self.publish(Vec::new(), Vec::new(), vec![Notification::GraphReordered])
    }

    /// Remove a connection by `client:port` names.
    pub fn disconnect_by_name(&mut self, src: &str, dst: &str) -> EngineResult<()> {
        let src = self.graph.port_by_name(src)?;
        let dst = self.graph.port_by_name(dst)?;
        self.disconnect(src, dst)
    }

    // ─── Geometry ───────────────────────────────────────────────────

    /// Change the period size. Every port moves to a new segment sized for
    /// `nframes`; clients see `buffer_size_changed` before the first cycle
    /// at the new size.
    pub fn set_buffer_size(&mut self, nframes: u32) -> EngineResult<()> {
        if !nframes.is_power_of_two() {
            return Err(EngineError::InvalidBufferSize { nframes });
        }
        if nframes == self.nframes {
            return Ok(());
        }
        for type_index in 0..self.types.len() {
            let capacity = self.pools[type_index].capacity();
            self.regenerate(type_index, capacity, nframes)?;
        }
        info!(from = self.nframes, to = nframes, "Buffer size change");
        self.nframes = nframes;
        self.section.period_frames = nframes;
        self.publish(Vec::new(), Vec::new(), vec![Notification::BufferSize(nframes)])
    }

    /// Change the sample rate.
    pub fn set_sample_rate(&mut self, rate: u32) -> EngineResult<()> {
        if rate == 0 {
            return Err(DriverError::Unsupported {
                what: "sample_rate",
                value: rate,
            }
            .into());
        }
        if rate == self.sample_rate {
            return Ok(());
        }
        info!(from = self.sample_rate, to = rate, "Sample rate change");
        self.sample_rate = rate;
        self.section.sample_rate = rate;
        self.publish(Vec::new(), Vec::new(), vec![Notification::SampleRate(rate)])
    }

    // ─── Snapshot Hand-off ──────────────────────────────────────────

    fn publish(
        &mut self,
        activate: Vec<(usize, Box<dyn Client>)>,
        remove: Vec<(usize, ClientId)>,
        notes: Vec<Notification>,
    ) -> EngineResult<()> {
        let version = self.version + 1;
        let snapshot = self.graph.snapshot(
            version,
            self.nframes,
            self.sample_rate,
            &type_buffers(&self.pools),
        )?;
        self.version = version;
        let snapshot = Arc::new(snapshot);
        self.latest = Arc::clone(&snapshot);

        let mut update = Box::new(GraphUpdate::new(snapshot));
        update.activate = activate;
        for (slot, id) in remove {
            update.remove_client(slot, id);
        }
        update.notes = notes;
        self.backlog.push_back(update);
        self.pump()
    }

    /// Push queued updates to the process thread and collect what it
    /// returned. With the process thread stopped the updates are applied
    /// here directly.
    fn pump(&mut self) -> EngineResult<()> {
        loop {
            while let Some(update) = self.backlog.pop_front() {
                if let Err(rtrb::PushError::Full(update)) = self.rings.updates.push(update) {
                    self.backlog.push_front(update);
                    break;
                }
            }
            if let Some(coordinator) = self.coordinator.as_mut() {
                coordinator.apply_updates();
            }
            self.collect_returns()?;
            if self.backlog.is_empty() || self.coordinator.is_none() {
                break;
            }
        }
        if !self.backlog.is_empty() {
            debug!(queued = self.backlog.len(), "Graph updates waiting for the process thread");
        }
        Ok(())
    }

    fn collect_returns(&mut self) -> EngineResult<()> {
        while let Ok(mut update) = self.rings.returns.pop() {
            self.installed_version = self.installed_version.max(update.version);
            for (_slot, id, mut client) in update.removed.drain(..) {
                if self.shutdown_on_return.remove(&id) {
                    client.shutdown();
                    debug!(client = ?id, "Client shut down");
                }
            }
        }
        self.release_retired()
    }

    fn release_retired(&mut self) -> EngineResult<()> {
        let installed = self.installed_version;
        let pools = &mut self.pools;
        self.pending_frees.retain(|free| {
            if free.version > installed {
                return true;
            }
            // Frees of a retired generation die with that generation.
            if let Some(pool) = pools.get_mut(free.type_index) {
                if pool.attachment().index() == free.buffer.address.segment {
                    pool.free(&free.buffer);
                }
            }
            false
        });

        let (done, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired_pools)
            .into_iter()
            .partition(|r| r.version <= installed);
        self.retired_pools = keep;
        for retired in done {
            let index = retired.pool.attachment().index();
            drop(retired.pool);
            self.ctx.as_mut().ok_or(EngineError::Closed)?.release(index)?;
            debug!(segment = index, "Retired port segment released");
        }
        Ok(())
    }

    // ─── Running ────────────────────────────────────────────────────

    /// Start the process thread.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.rt.is_some() {
            return Err(EngineError::Running);
        }
        let coordinator = self.coordinator.take().ok_or(EngineError::Defunct)?;

        if self.section.realtime {
            if let Err(e) = lock_process_memory() {
                warn!("Cannot lock process memory: {e}");
            }
        }

        self.shared.running.store(true, Ordering::Release);
        let thread = self
            .threads
            .create_thread(
                "jackal-process",
                self.section.rt_priority,
                self.section.realtime,
                move || coordinator.run(),
            )
            .inspect_err(|_| self.shared.running.store(false, Ordering::Release))?;

        if self.section.realtime && !thread.outcome().is_granted() {
            warn!(
                outcome = ?thread.outcome(),
                "Process thread runs without realtime scheduling"
            );
        }
        info!(outcome = ?thread.outcome(), "Process thread started");
        self.rt = Some(thread);
        Ok(())
    }

    /// Stop the process thread after its current cycle.
    pub fn stop(&mut self) -> EngineResult<()> {
        let thread = self.rt.take().ok_or(EngineError::NotRunning)?;
        self.shared.running.store(false, Ordering::Release);
        let coordinator = thread.join()?;
        coordinator.log_summary();
        self.coordinator = Some(coordinator);
        self.pump()?;
        info!("Process thread stopped");
        Ok(())
    }

    /// Process thread exists and has not halted.
    pub fn is_running(&self) -> bool {
        self.rt.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    /// Run `cycles` cycles on the calling thread. Only while stopped.
    ///
    /// Returns the number of cycles that completed.
    pub fn run_cycles(&mut self, cycles: u64) -> EngineResult<u64> {
        let coordinator = self.coordinator.as_mut().ok_or(EngineError::Running)?;
        let mut completed = 0;
        for _ in 0..cycles {
            match coordinator.run_cycle() {
                CycleOutcome::Completed => completed += 1,
                CycleOutcome::Skipped => {}
                CycleOutcome::Halted(reason) => {
                    warn!(?reason, "Process cycle halted");
                    break;
                }
            }
        }
        self.pump()?;
        Ok(completed)
    }

    /// Handle what the process thread reported since the last call.
    ///
    /// Failed clients are taken out of the graph here and shut down once
    /// the process thread returns them.
    pub fn poll(&mut self) -> EngineResult<Vec<EngineEvent>> {
        self.pump()?;
        let mut events = Vec::new();
        while let Ok(event) = self.rings.events.pop() {
            match event {
                EngineEvent::Xrun {
                    frame_time,
                    delayed_usecs,
                    elapsed_usecs,
                } => warn!(frame_time, delayed_usecs, elapsed_usecs, "xrun"),
                EngineEvent::ClientFailed { client, status } => {
                    warn!(client = ?client, status, "Client failed, removing it from the graph");
                    self.remove_failed(client)?;
                }
                EngineEvent::Halted { reason } => error!(?reason, "Process cycle halted"),
            }
            events.push(event);
        }
        Ok(events)
    }

    fn remove_failed(&mut self, client: ClientId) -> EngineResult<()> {
        let Ok(info) = self.graph.client(client) else {
            return Ok(());
        };
        if !info.active {
            return Ok(());
        }
        let slot = info.slot;
        self.graph.set_active(client, false)?;
        self.shutdown_on_return.insert(client);
        self.publish(
            Vec::new(),
            vec![(slot, client)],
            vec![Notification::GraphReordered],
        )
    }

    // ─── Queries ────────────────────────────────────────────────────

    /// Connection graph (read-only).
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Most recently published snapshot.
    pub fn snapshot(&self) -> &Arc<GraphSnapshot> {
        &self.latest
    }

    /// Version of the snapshot the process thread has installed.
    pub fn installed_version(&self) -> u64 {
        self.shared.snapshot_version.load(Ordering::Acquire)
    }

    /// Where `port`'s owner reads or writes this cycle, per the latest
    /// snapshot. `None` unless the owner is active.
    pub fn port_address(&self, port: PortId) -> Option<BufferAddress> {
        self.latest.port(port).map(|p| p.address)
    }

    /// Copy the samples `port`'s owner sees into `dst`.
    pub fn read_port(&self, port: PortId, dst: &mut [f32]) -> EngineResult<usize> {
        let resolved = self
            .latest
            .port(port)
            .ok_or(GraphError::UnknownPort { id: port })?;
        let segment = &self.latest.segments[resolved.type_index];
        let mut bytes = vec![0u8; resolved.address.len];
        let n = segment.read_into(&resolved.address, &mut bytes)?;
        let mut copied = 0;
        for (out, chunk) in dst.iter_mut().zip(bytes[..n].chunks_exact(4)) {
            *out = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            copied += 1;
        }
        Ok(copied)
    }

    /// Buffers in use in the pool of `port_type`.
    pub fn ports_in_use(&self, port_type: PortTypeId) -> EngineResult<usize> {
        Ok(self.pools[self.type_index(port_type)?].in_use())
    }

    /// Capacity of the pool of `port_type`.
    pub fn pool_capacity(&self, port_type: PortTypeId) -> EngineResult<usize> {
        Ok(self.pools[self.type_index(port_type)?].capacity())
    }

    /// Frames per cycle.
    pub fn nframes(&self) -> u32 {
        self.nframes
    }

    /// Sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// CPU load estimate [%].
    pub fn cpu_load(&self) -> f32 {
        self.shared.cpu_load()
    }

    /// Missed deadlines so far.
    pub fn xrun_count(&self) -> u64 {
        self.shared.xruns.load(Ordering::Relaxed)
    }

    /// Completed cycles so far.
    pub fn cycle_count(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Events lost because the event ring was full.
    pub fn events_dropped(&self) -> u64 {
        self.shared.events_dropped.load(Ordering::Relaxed)
    }

    /// Thread manager used for the process thread.
    pub fn threads(&self) -> &RealtimeThreadManager {
        &self.threads
    }

    /// Stop, shut down every remaining client and hand back the shared
    /// memory context for teardown.
    pub fn close(mut self) -> EngineResult<ShmContext> {
        if self.rt.is_some() {
            self.stop()?;
        }
        self.pump()?;
        if let Some(mut coordinator) = self.coordinator.take() {
            for (slot, mut client) in coordinator.take_clients() {
                client.shutdown();
                debug!(slot, "Client shut down at engine close");
            }
        }
        info!(
            cycles = self.cycle_count(),
            xruns = self.xrun_count(),
            "Engine closed"
        );
        self.ctx.take().ok_or(EngineError::Closed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.rt.is_some() {
            if let Err(e) = self.stop() {
                warn!("Process thread did not stop cleanly: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nframes", &self.nframes)
            .field("sample_rate", &self.sample_rate)
            .field("version", &self.version)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn type_buffers(pools: &[PortPool]) -> Vec<TypeBuffers> {
    pools
        .iter()
        .map(|pool| TypeBuffers {
            attachment: Arc::clone(pool.attachment()),
            zero: pool.zero_buffer().address,
            mixdown: pool.port_type().mixdown,
        })
        .collect()
}
