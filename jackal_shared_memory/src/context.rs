//! Per-process shared memory context
//!
//! One `ShmContext` exists per process. It owns the registry handle and the
//! process-local attachments; operations take it explicitly instead of
//! reaching for process-wide globals.

use crate::error::{ShmError, ShmResult};
use crate::platform::{
    LinuxMemoryConfig, attach_segment_mmap, create_segment_mmap, destroy_segment,
    get_current_pid, resize_segment_mmap,
};
use crate::registry::SegmentRegistry;
use crate::segment::{Attachment, mapped_len, validate_segment_size};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where segments and the registry live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShmConfig {
    /// Directory on a tmpfs holding segment files
    pub directory: PathBuf,
    /// Name prefix for segment and registry files
    pub prefix: String,
    /// Lock newly created segments in RAM
    pub lock_segments: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/dev/shm"),
            prefix: "jackal".to_string(),
            lock_segments: false,
        }
    }
}

/// Process-local view of the shared memory registry.
#[derive(Debug)]
pub struct ShmContext {
    registry: SegmentRegistry,
    attachments: HashMap<u32, Arc<Attachment>>,
    created: BTreeSet<u32>,
    map_config: LinuxMemoryConfig,
    pid: u32,
}

impl ShmContext {
    /// Open the registry and reclaim segments whose creator has died.
    pub fn init(config: &ShmConfig) -> ShmResult<Self> {
        let mut registry = SegmentRegistry::open(&config.directory, &config.prefix)?;
        let cleaned = registry.cleanup_orphaned_segments()?;
        if cleaned > 0 {
            info!("Reclaimed {cleaned} orphaned segment(s) from a previous run");
        }

        Ok(Self {
            registry,
            attachments: HashMap::new(),
            created: BTreeSet::new(),
            map_config: LinuxMemoryConfig {
                populate: true,
                locked: config.lock_segments,
            },
            pid: get_current_pid(),
        })
    }

    /// Allocate a new segment with `size` data bytes and attach it.
    pub fn shmalloc(&mut self, size: usize) -> ShmResult<Arc<Attachment>> {
        validate_segment_size(size)?;

        let entry = self.registry.allocate(size, self.pid)?;
        let path = self.registry.segment_path(&entry);

        let mmap = match create_segment_mmap(&path, mapped_len(size), &self.map_config) {
            Ok(mmap) => mmap,
            Err(e) => {
                self.registry.remove(entry.index);
                return Err(e);
            }
        };

        let attachment = Arc::new(Attachment::initialize(entry.index, size, self.pid, mmap)?);
        self.registry.save()?;

        self.attachments.insert(entry.index, Arc::clone(&attachment));
        self.created.insert(entry.index);
        debug!(index = entry.index, size, "Allocated segment {}", entry.os_id);
        Ok(attachment)
    }

    /// Map a registry entry into this process, whoever created it.
    pub fn attach(&mut self, index: u32) -> ShmResult<Arc<Attachment>> {
        if let Some(existing) = self.attachments.get(&index) {
            return Ok(Arc::clone(existing));
        }

        let entry = self
            .registry
            .get(index)
            .ok_or(ShmError::UnknownSegment { index })?
            .clone();
        let mmap = attach_segment_mmap(&self.registry.segment_path(&entry))?;
        let attachment = Arc::new(Attachment::open(index, mmap)?);

        if attachment.size() != entry.size {
            return Err(ShmError::AttachFailed {
                index,
                reason: format!(
                    "registry records {} bytes, segment holds {}",
                    entry.size,
                    attachment.size()
                ),
            });
        }

        self.attachments.insert(index, Arc::clone(&attachment));
        Ok(attachment)
    }

    /// Map a segment without caching it, producing an attachment
    /// independent of any other mapping in this process.
    pub fn attach_fresh(&self, index: u32) -> ShmResult<Attachment> {
        let entry = self
            .registry
            .get(index)
            .ok_or(ShmError::UnknownSegment { index })?;
        let mmap = attach_segment_mmap(&self.registry.segment_path(entry))?;
        Attachment::open(index, mmap)
    }

    /// Change a segment's size.
    ///
    /// Only legal between cycles: refused with `SegmentBusy` while any
    /// attachment handle other than the context's own is alive.
    pub fn resize(&mut self, index: u32, size: usize) -> ShmResult<Arc<Attachment>> {
        validate_segment_size(size)?;

        let current = self
            .attachments
            .remove(&index)
            .ok_or(ShmError::UnknownSegment { index })?;
        if Arc::strong_count(&current) > 1 {
            self.attachments.insert(index, current);
            return Err(ShmError::SegmentBusy { index });
        }
        drop(current);

        let entry = self
            .registry
            .get(index)
            .ok_or(ShmError::UnknownSegment { index })?
            .clone();
        let mmap = resize_segment_mmap(&self.registry.segment_path(&entry), mapped_len(size))?;
        let attachment = Arc::new(Attachment::initialize(index, size, entry.creator_pid, mmap)?);

        self.registry.set_size(index, size)?;
        self.registry.save()?;
        self.attachments.insert(index, Arc::clone(&attachment));
        debug!(index, size, "Resized segment");
        Ok(attachment)
    }

    /// Drop this process's attachment; destroy the segment if we created it.
    pub fn release(&mut self, index: u32) -> ShmResult<()> {
        self.attachments.remove(&index);

        if self.created.remove(&index) {
            if let Some(entry) = self.registry.remove(index) {
                destroy_segment(&self.registry.segment_path(&entry))?;
                self.registry.save()?;
                debug!(index, "Destroyed segment {}", entry.os_id);
            }
        }
        Ok(())
    }

    /// Number of live handles to an attachment, the context's own included.
    pub fn ref_count(&self, index: u32) -> usize {
        self.attachments.get(&index).map_or(0, Arc::strong_count)
    }

    /// Registry handle (read-only).
    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// Destroy every segment this process created and detach the rest.
    pub fn teardown(mut self) -> ShmResult<()> {
        let created: Vec<u32> = self.created.iter().copied().collect();
        for index in created {
            if self.ref_count(index) > 1 {
                warn!(index, "Segment still referenced at teardown, destroying anyway");
            }
            self.release(index)?;
        }
        self.attachments.clear();
        info!("Shared memory context torn down");
        Ok(())
    }
}
