//! Client/connection graph and the immutable snapshot the process thread reads
//!
//! The control thread owns a mutable [`Graph`]: clients and ports live in
//! maps keyed by stable integer ids, connections are `(output, input)` pairs.
//! Every change produces a new [`GraphSnapshot`] holding the invocation order
//! of the active clients and each port's resolved buffer address. The process
//! thread swaps snapshots between cycles and never sees the graph itself.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use jackal_shared_memory::{Attachment, BufferAddress, MixdownFn, PortBuffer, PortType, PortTypeId};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};

use crate::error::GraphError;

/// Stable client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

/// Stable port key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Data flow direction of a port, seen from its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    /// Read by the owner
    Input,
    /// Written by the owner
    Output,
}

/// A registered port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port key
    pub id: PortId,
    /// Owning client
    pub client: ClientId,
    /// `client:port`
    pub name: String,
    /// Direction
    pub direction: PortDirection,
    /// Index into the engine's port type table
    pub type_index: usize,
    /// Port type id; connections require equal ids
    pub type_id: PortTypeId,
    /// The type can sum several sources
    pub mixable: bool,
    /// The port's own region
    pub buffer: PortBuffer,
}

/// A registered client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client key
    pub id: ClientId,
    /// Unique name
    pub name: String,
    /// Slot in the process thread's client table
    pub slot: usize,
    /// Invoked by the process cycle
    pub active: bool,
    /// Owned ports, in registration order
    pub ports: Vec<PortId>,
}

/// Per port type inputs to snapshot construction.
#[derive(Debug, Clone)]
pub struct TypeBuffers {
    /// Segment holding every buffer of this type
    pub attachment: Arc<Attachment>,
    /// Region shared by unconnected inputs
    pub zero: BufferAddress,
    /// Mixdown kernel
    pub mixdown: Option<MixdownFn>,
}

/// A port as the process thread sees it.
#[derive(Debug, Clone)]
pub struct ResolvedPort {
    /// Port key
    pub id: PortId,
    /// Direction
    pub direction: PortDirection,
    /// Index into [`GraphSnapshot::segments`]
    pub type_index: usize,
    /// Where the owner reads or writes this cycle
    pub address: BufferAddress,
    /// Sources summed into `address` before the owner runs; empty unless
    /// the input has more than one connection
    pub mix: Vec<BufferAddress>,
    /// Kernel used for `mix`
    pub mixdown: Option<MixdownFn>,
}

/// An active client in invocation order.
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    /// Client key
    pub id: ClientId,
    /// Slot in the process thread's client table
    pub slot: usize,
    /// Resolved ports
    pub ports: Vec<ResolvedPort>,
}

/// Immutable, versioned view of the graph for one or more cycles.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// Monotonic version; later snapshots have larger versions
    pub version: u64,
    /// Frames per cycle the buffers are sized for
    pub nframes: u32,
    /// Sample rate
    pub sample_rate: u32,
    /// One segment per port type, by type index
    pub segments: Vec<Arc<Attachment>>,
    /// Active clients, upstream first
    pub order: Vec<SnapshotClient>,
}

impl GraphSnapshot {
    /// Snapshot with no clients.
    pub fn empty(version: u64, nframes: u32, sample_rate: u32, segments: Vec<Arc<Attachment>>) -> Self {
        Self {
            version,
            nframes,
            sample_rate,
            segments,
            order: Vec::new(),
        }
    }

    /// Resolved entry for `port`, if its owner is active.
    pub fn port(&self, port: PortId) -> Option<&ResolvedPort> {
        self.order
            .iter()
            .flat_map(|c| c.ports.iter())
            .find(|p| p.id == port)
    }

    /// Invocation position of `client`.
    pub fn position(&self, client: ClientId) -> Option<usize> {
        self.order.iter().position(|c| c.id == client)
    }
}

/// The mutable connection graph.
#[derive(Debug, Default)]
pub struct Graph {
    clients: BTreeMap<ClientId, ClientInfo>,
    ports: BTreeMap<PortId, PortInfo>,
    connections: BTreeSet<(PortId, PortId)>,
    deps: StableGraph<ClientId, ()>,
    nodes: HashMap<ClientId, NodeIndex>,
    next_client: u32,
    next_port: u32,
}

impl Graph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inactive client.
    pub fn add_client(&mut self, name: &str, slot: usize) -> Result<ClientId, GraphError> {
        if name.is_empty() || name.contains(':') || self.clients.values().any(|c| c.name == name) {
            return Err(GraphError::DuplicateName {
                name: name.to_string(),
            });
        }
        let id = ClientId(self.next_client);
        self.next_client += 1;

        let node = self.deps.add_node(id);
        self.nodes.insert(id, node);
        self.clients.insert(
            id,
            ClientInfo {
                id,
                name: name.to_string(),
                slot,
                active: false,
                ports: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Remove a client together with its ports and their connections.
    ///
    /// Returns the client and the removed ports so the caller can release
    /// their buffers.
    pub fn remove_client(&mut self, id: ClientId) -> Result<(ClientInfo, Vec<PortInfo>), GraphError> {
        let port_ids = self.client(id)?.ports.clone();
        let mut removed = Vec::with_capacity(port_ids.len());
        for port in port_ids {
            removed.push(self.remove_port(port)?);
        }

        let info = self
            .clients
            .remove(&id)
            .ok_or(GraphError::UnknownClient { id })?;
        if let Some(node) = self.nodes.remove(&id) {
            self.deps.remove_node(node);
        }
        Ok((info, removed))
    }

    /// Mark a client (in)active. Returns the previous state.
    pub fn set_active(&mut self, id: ClientId, active: bool) -> Result<bool, GraphError> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or(GraphError::UnknownClient { id })?;
        Ok(std::mem::replace(&mut client.active, active))
    }

    /// Register a port whose buffer has already been allocated.
    pub fn add_port(
        &mut self,
        client: ClientId,
        short_name: &str,
        direction: PortDirection,
        port_type: &PortType,
        type_index: usize,
        buffer: PortBuffer,
    ) -> Result<PortId, GraphError> {
        let owner = self.client(client)?;
        let name = format!("{}:{}", owner.name, short_name);
        if short_name.is_empty() || self.ports.values().any(|p| p.name == name) {
            return Err(GraphError::DuplicateName { name });
        }

        let id = PortId(self.next_port);
        self.next_port += 1;
        self.ports.insert(
            id,
            PortInfo {
                id,
                client,
                name,
                direction,
                type_index,
                type_id: port_type.id,
                mixable: port_type.mixdown.is_some(),
                buffer,
            },
        );
        if let Some(owner) = self.clients.get_mut(&client) {
            owner.ports.push(id);
        }
        Ok(id)
    }

    /// Unregister a port and drop its connections.
    pub fn remove_port(&mut self, id: PortId) -> Result<PortInfo, GraphError> {
        let attached: Vec<(PortId, PortId)> = self
            .connections
            .iter()
            .filter(|(src, dst)| *src == id || *dst == id)
            .copied()
            .collect();
        for (src, dst) in attached {
            self.disconnect(src, dst)?;
        }

        let info = self.ports.remove(&id).ok_or(GraphError::UnknownPort { id })?;
        if let Some(owner) = self.clients.get_mut(&info.client) {
            owner.ports.retain(|p| *p != id);
        }
        Ok(info)
    }

    /// Connect an output to an input.
    pub fn connect(&mut self, src: PortId, dst: PortId) -> Result<(), GraphError> {
        let from = self.port(src)?;
        let to = self.port(dst)?;

        if from.direction != PortDirection::Output || to.direction != PortDirection::Input {
            return Err(GraphError::WrongDirection { src, dst });
        }
        if from.type_id != to.type_id {
            return Err(GraphError::TypeMismatch { src, dst });
        }
        if self.connections.contains(&(src, dst)) {
            return Err(GraphError::AlreadyConnected { src, dst });
        }
        if !to.mixable && self.sources(dst).next().is_some() {
            return Err(GraphError::NoMixdown { port: dst });
        }

        let (a, b) = (self.node(from.client)?, self.node(to.client)?);
        let edge = self.deps.add_edge(a, b, ());
        if toposort(&self.deps, None).is_err() {
            self.deps.remove_edge(edge);
            return Err(GraphError::CycleDetected);
        }

        self.connections.insert((src, dst));
        Ok(())
    }

    /// Remove a connection.
    pub fn disconnect(&mut self, src: PortId, dst: PortId) -> Result<(), GraphError> {
        if !self.connections.remove(&(src, dst)) {
            return Err(GraphError::NotConnected { src, dst });
        }
        let (a, b) = (self.node(self.port(src)?.client)?, self.node(self.port(dst)?.client)?);
        // One dependency edge per connection, so parallel edges are expected.
        if let Some(edge) = self.deps.find_edge(a, b) {
            self.deps.remove_edge(edge);
        }
        Ok(())
    }

    /// Port by `client:port` name.
    pub fn port_by_name(&self, name: &str) -> Result<PortId, GraphError> {
        self.ports
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| GraphError::NoSuchPortName {
                name: name.to_string(),
            })
    }

    /// Outputs connected to `dst`.
    pub fn sources(&self, dst: PortId) -> impl Iterator<Item = PortId> + '_ {
        self.connections
            .iter()
            .filter(move |(_, d)| *d == dst)
            .map(|(s, _)| *s)
    }

    /// Every connection touching `port`.
    pub fn connections_of(&self, port: PortId) -> impl Iterator<Item = (PortId, PortId)> + '_ {
        self.connections
            .iter()
            .filter(move |(s, d)| *s == port || *d == port)
            .copied()
    }

    /// Client lookup.
    pub fn client(&self, id: ClientId) -> Result<&ClientInfo, GraphError> {
        self.clients.get(&id).ok_or(GraphError::UnknownClient { id })
    }

    /// Port lookup.
    pub fn port(&self, id: PortId) -> Result<&PortInfo, GraphError> {
        self.ports.get(&id).ok_or(GraphError::UnknownPort { id })
    }

    /// Replace a port's buffer (new pool generation).
    pub fn set_buffer(&mut self, id: PortId, buffer: PortBuffer) -> Result<(), GraphError> {
        let port = self.ports.get_mut(&id).ok_or(GraphError::UnknownPort { id })?;
        port.buffer = buffer;
        Ok(())
    }

    /// All clients.
    pub fn clients(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients.values()
    }

    /// All ports.
    pub fn ports(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports.values()
    }

    /// Number of connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn node(&self, id: ClientId) -> Result<NodeIndex, GraphError> {
        self.nodes
            .get(&id)
            .copied()
            .ok_or(GraphError::UnknownClient { id })
    }

    /// Every client, upstream first.
    pub fn client_order(&self) -> Result<Vec<ClientId>, GraphError> {
        let order = toposort(&self.deps, None).map_err(|_| GraphError::CycleDetected)?;
        Ok(order.into_iter().map(|n| self.deps[n]).collect())
    }

    /// Build the snapshot the process thread will run.
    ///
    /// Only active clients appear; connections from inactive owners are
    /// ignored. Every address of an active client is validated against its
    /// segment here, so the process thread can resolve them without checks;
    /// one that does not fit fails the whole snapshot.
    pub fn snapshot(
        &self,
        version: u64,
        nframes: u32,
        sample_rate: u32,
        types: &[TypeBuffers],
    ) -> Result<GraphSnapshot, GraphError> {
        let mut order = Vec::new();
        for id in self.client_order()? {
            let client = self.client(id)?;
            if !client.active {
                continue;
            }

            let mut ports = Vec::with_capacity(client.ports.len());
            for port_id in &client.ports {
                let port = self.port(*port_id)?;
                let buffers =
                    types
                        .get(port.type_index)
                        .ok_or_else(|| GraphError::InvalidBuffer {
                            port: port.id,
                            reason: format!("no segment for type index {}", port.type_index),
                        })?;
                buffers
                    .attachment
                    .validate(&port.buffer.address)
                    .map_err(|e| GraphError::InvalidBuffer {
                        port: port.id,
                        reason: e.to_string(),
                    })?;
                ports.push(self.resolve(port, buffers)?);
            }
            order.push(SnapshotClient {
                id,
                slot: client.slot,
                ports,
            });
        }

        Ok(GraphSnapshot {
            version,
            nframes,
            sample_rate,
            segments: types.iter().map(|t| Arc::clone(&t.attachment)).collect(),
            order,
        })
    }

    fn resolve(&self, port: &PortInfo, buffers: &TypeBuffers) -> Result<ResolvedPort, GraphError> {
        let mut resolved = ResolvedPort {
            id: port.id,
            direction: port.direction,
            type_index: port.type_index,
            address: port.buffer.address,
            mix: Vec::new(),
            mixdown: None,
        };
        if port.direction == PortDirection::Output {
            return Ok(resolved);
        }

        let mut live = Vec::new();
        for src in self.sources(port.id) {
            let src = self.port(src)?;
            if self.client(src.client)?.active
                && buffers.attachment.validate(&src.buffer.address).is_ok()
            {
                live.push(src.buffer.address);
            }
        }

        match (live.len(), buffers.mixdown) {
            (0, _) => resolved.address = buffers.zero,
            (1, _) | (_, None) => resolved.address = live[0],
            (_, Some(kernel)) => {
                resolved.mix = live;
                resolved.mixdown = Some(kernel);
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackal_shared_memory::{AUDIO, EVENT, ShmConfig, ShmContext};

    fn buffer(offset: usize, port_type: &PortType) -> PortBuffer {
        PortBuffer {
            address: BufferAddress {
                segment: port_type.id.0,
                offset,
                len: port_type.buffer_size(64),
            },
            scale_factor: port_type.scale_factor,
            type_id: port_type.id,
        }
    }

    fn add(graph: &mut Graph, client: ClientId, name: &str, dir: PortDirection) -> PortId {
        let offset = (graph.ports().count() + 1) * 256;
        graph
            .add_port(client, name, dir, &AUDIO, 0, buffer(offset, &AUDIO))
            .unwrap()
    }

    #[test]
    fn test_names_are_unique() {
        let mut graph = Graph::new();
        let a = graph.add_client("a", 0).unwrap();
        assert!(matches!(
            graph.add_client("a", 1),
            Err(GraphError::DuplicateName { .. })
        ));
        add(&mut graph, a, "out", PortDirection::Output);
        assert!(
            graph
                .add_port(a, "out", PortDirection::Output, &AUDIO, 0, buffer(4096, &AUDIO))
                .is_err()
        );
        assert_eq!(graph.port_by_name("a:out").unwrap(), PortId(0));
    }

    #[test]
    fn test_connect_rules() {
        let mut graph = Graph::new();
        let a = graph.add_client("a", 0).unwrap();
        let b = graph.add_client("b", 1).unwrap();
        let out = add(&mut graph, a, "out", PortDirection::Output);
        let input = add(&mut graph, b, "in", PortDirection::Input);

        assert!(matches!(
            graph.connect(input, out),
            Err(GraphError::WrongDirection { .. })
        ));
        graph.connect(out, input).unwrap();
        assert!(matches!(
            graph.connect(out, input),
            Err(GraphError::AlreadyConnected { .. })
        ));

        let events = graph
            .add_port(b, "midi", PortDirection::Input, &EVENT, 1, buffer(0, &EVENT))
            .unwrap();
        assert!(matches!(
            graph.connect(out, events),
            Err(GraphError::TypeMismatch { .. })
        ));

        graph.disconnect(out, input).unwrap();
        assert!(matches!(
            graph.disconnect(out, input),
            Err(GraphError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_second_event_source_rejected() {
        let mut graph = Graph::new();
        let a = graph.add_client("a", 0).unwrap();
        let b = graph.add_client("b", 1).unwrap();
        let c = graph.add_client("c", 2).unwrap();
        fn ev(g: &mut Graph, client: ClientId, name: &str, dir: PortDirection, off: usize) -> PortId {
            g.add_port(client, name, dir, &EVENT, 1, buffer(off, &EVENT))
                .unwrap()
        }
        let out_a = ev(&mut graph, a, "out", PortDirection::Output, 4096);
        let out_b = ev(&mut graph, b, "out", PortDirection::Output, 8192);
        let input = ev(&mut graph, c, "in", PortDirection::Input, 12288);

        graph.connect(out_a, input).unwrap();
        assert_eq!(
            graph.connect(out_b, input),
            Err(GraphError::NoMixdown { port: input })
        );
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut graph = Graph::new();
        let a = graph.add_client("a", 0).unwrap();
        let b = graph.add_client("b", 1).unwrap();
        let a_out = add(&mut graph, a, "out", PortDirection::Output);
        let a_in = add(&mut graph, a, "in", PortDirection::Input);
        let b_out = add(&mut graph, b, "out", PortDirection::Output);
        let b_in = add(&mut graph, b, "in", PortDirection::Input);

        graph.connect(a_out, b_in).unwrap();
        assert_eq!(graph.connect(b_out, a_in), Err(GraphError::CycleDetected));
        assert_eq!(graph.connect(a_out, a_in), Err(GraphError::CycleDetected));
        assert_eq!(graph.connection_count(), 1);
        assert_eq!(graph.client_order().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_order_follows_connections() {
        let mut graph = Graph::new();
        let sink = graph.add_client("sink", 0).unwrap();
        let source = graph.add_client("source", 1).unwrap();
        let s_in = add(&mut graph, sink, "in", PortDirection::Input);
        let src_out = add(&mut graph, source, "out", PortDirection::Output);

        graph.connect(src_out, s_in).unwrap();
        assert_eq!(graph.client_order().unwrap(), vec![source, sink]);
    }

    #[test]
    fn test_remove_client_drops_connections() {
        let mut graph = Graph::new();
        let a = graph.add_client("a", 0).unwrap();
        let b = graph.add_client("b", 1).unwrap();
        let out = add(&mut graph, a, "out", PortDirection::Output);
        let input = add(&mut graph, b, "in", PortDirection::Input);
        graph.connect(out, input).unwrap();

        let (info, ports) = graph.remove_client(a).unwrap();
        assert_eq!(info.name, "a");
        assert_eq!(ports.len(), 1);
        assert_eq!(graph.connection_count(), 0);
        assert_eq!(graph.sources(input).count(), 0);
        assert!(graph.port(out).is_err());
    }

    #[test]
    fn test_snapshot_rejects_buffer_outside_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ShmContext::init(&ShmConfig {
            directory: dir.path().to_path_buf(),
            prefix: "graph".to_string(),
            lock_segments: false,
        })
        .unwrap();
        let attachment = ctx.shmalloc(4096).unwrap();
        let len = AUDIO.buffer_size(64);
        let types = [TypeBuffers {
            attachment: Arc::clone(&attachment),
            zero: BufferAddress {
                segment: attachment.index(),
                offset: 0,
                len,
            },
            mixdown: AUDIO.mixdown,
        }];
        let place = |offset| PortBuffer {
            address: BufferAddress {
                segment: attachment.index(),
                offset,
                len,
            },
            scale_factor: AUDIO.scale_factor,
            type_id: AUDIO.id,
        };

        let mut graph = Graph::new();
        let a = graph.add_client("a", 0).unwrap();
        graph
            .add_port(a, "ok", PortDirection::Output, &AUDIO, 0, place(len))
            .unwrap();
        let bad = graph
            .add_port(a, "bad", PortDirection::Output, &AUDIO, 0, place(8192))
            .unwrap();

        // Inactive clients are not resolved.
        assert!(graph.snapshot(1, 64, 48_000, &types).is_ok());

        graph.set_active(a, true).unwrap();
        assert!(matches!(
            graph.snapshot(2, 64, 48_000, &types),
            Err(GraphError::InvalidBuffer { port, .. }) if port == bad
        ));

        drop(types);
        drop(attachment);
        ctx.teardown().unwrap();
    }
}
