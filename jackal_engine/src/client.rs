//! Client callbacks and the per-cycle process scope

use std::sync::Arc;

use jackal_shared_memory::{Attachment, PortTypeId, as_f32, as_f32_mut};

use crate::graph::{ClientId, PortDirection, PortId, ResolvedPort, SnapshotClient};

/// Result of a client callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Keep running
    Continue,
    /// Remove this client from the graph; the code is reported
    Failed(i32),
}

impl ProcessStatus {
    /// True for [`ProcessStatus::Continue`].
    pub fn is_continue(self) -> bool {
        self == ProcessStatus::Continue
    }

    /// `0` for success, the failure code otherwise.
    pub fn code(self) -> i32 {
        match self {
            ProcessStatus::Continue => 0,
            ProcessStatus::Failed(code) => code,
        }
    }
}

/// Callbacks a client implements.
///
/// Everything here runs on the process thread, either inside a cycle
/// (`process`) or between two cycles (the rest, except `shutdown`). None of
/// it may block, allocate or do I/O. `shutdown` runs on the control thread
/// after the client has left the graph.
pub trait Client: Send + 'static {
    /// Produce and consume one period of data.
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> ProcessStatus;

    /// The period size changed; buffers are already resized.
    fn buffer_size_changed(&mut self, _nframes: u32) -> ProcessStatus {
        ProcessStatus::Continue
    }

    /// The sample rate changed.
    fn sample_rate_changed(&mut self, _rate: u32) -> ProcessStatus {
        ProcessStatus::Continue
    }

    /// Connections or the invocation order changed.
    fn graph_order_changed(&mut self) -> ProcessStatus {
        ProcessStatus::Continue
    }

    /// A cycle missed its deadline.
    fn xrun(&mut self) -> ProcessStatus {
        ProcessStatus::Continue
    }

    /// A port was (un)registered by any client.
    fn port_registered(&mut self, _port: PortId, _registered: bool) {}

    /// A client was opened or closed.
    fn client_registered(&mut self, _name: &str, _registered: bool) {}

    /// The client was removed or the server is going away.
    fn shutdown(&mut self) {}
}

/// Handle to a registered input port. Not `Clone`: one handle per port.
#[derive(Debug, PartialEq, Eq)]
pub struct InputPort {
    pub(crate) id: PortId,
    pub(crate) client: ClientId,
    pub(crate) type_id: PortTypeId,
}

/// Handle to a registered output port. Not `Clone`: writing needs `&mut`.
#[derive(Debug, PartialEq, Eq)]
pub struct OutputPort {
    pub(crate) id: PortId,
    pub(crate) client: ClientId,
    pub(crate) type_id: PortTypeId,
}

macro_rules! port_accessors {
    ($ty:ty) => {
        impl $ty {
            /// Port key.
            pub fn id(&self) -> PortId {
                self.id
            }

            /// Owning client.
            pub fn client(&self) -> ClientId {
                self.client
            }

            /// Port type.
            pub fn type_id(&self) -> PortTypeId {
                self.type_id
            }
        }
    };
}

port_accessors!(InputPort);
port_accessors!(OutputPort);

/// What one client sees during one `process` call.
pub struct ProcessScope<'a> {
    nframes: u32,
    frame_time: u64,
    client: &'a SnapshotClient,
    segments: &'a [Arc<Attachment>],
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(
        nframes: u32,
        frame_time: u64,
        client: &'a SnapshotClient,
        segments: &'a [Arc<Attachment>],
    ) -> Self {
        Self {
            nframes,
            frame_time,
            client,
            segments,
        }
    }

    /// Frames in this cycle.
    pub fn nframes(&self) -> u32 {
        self.nframes
    }

    /// Frames processed before this cycle.
    pub fn frame_time(&self) -> u64 {
        self.frame_time
    }

    /// Client being invoked.
    pub fn client_id(&self) -> ClientId {
        self.client.id
    }

    fn find(&self, id: PortId, direction: PortDirection) -> Option<(&Attachment, &ResolvedPort)> {
        let port = self
            .client
            .ports
            .iter()
            .find(|p| p.id == id && p.direction == direction)?;
        let segment = self.segments.get(port.type_index)?;
        Some((segment.as_ref(), port))
    }

    /// Raw bytes of an input. Empty if the port is not in this cycle's graph.
    pub fn input_bytes(&self, port: &InputPort) -> &[u8] {
        match self.find(port.id, PortDirection::Input) {
            // SAFETY: addresses were validated against these segments when the
            // snapshot was built; outputs feeding this input belong to clients
            // that already ran this cycle.
            Some((segment, resolved)) => unsafe { segment.slice(&resolved.address) },
            None => &[],
        }
    }

    /// Raw bytes of an output. Empty if the port is not in this cycle's graph.
    pub fn output_bytes<'p>(&'p self, port: &'p mut OutputPort) -> &'p mut [u8] {
        match self.find(port.id, PortDirection::Output) {
            // SAFETY: validated at snapshot build; the region belongs to this
            // port alone and `port` is borrowed mutably for the slice lifetime.
            Some((segment, resolved)) => unsafe { segment.slice_mut(&resolved.address) },
            None => &mut [],
        }
    }

    /// Audio samples of an input.
    pub fn input(&self, port: &InputPort) -> &[f32] {
        as_f32(self.input_bytes(port))
    }

    /// Audio samples of an output.
    pub fn output<'p>(&'p self, port: &'p mut OutputPort) -> &'p mut [f32] {
        as_f32_mut(self.output_bytes(port))
    }
}

impl std::fmt::Debug for ProcessScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessScope")
            .field("nframes", &self.nframes)
            .field("frame_time", &self.frame_time)
            .field("client", &self.client.id)
            .finish()
    }
}

/// Adapter turning a closure into a [`Client`].
pub struct ClosureClient<F>(pub F);

impl<F> Client for ClosureClient<F>
where
    F: FnMut(&mut ProcessScope<'_>) -> ProcessStatus + Send + 'static,
{
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> ProcessStatus {
        (self.0)(scope)
    }
}
