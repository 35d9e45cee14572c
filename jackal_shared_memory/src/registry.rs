//! Persistent segment registry and orphan cleanup
//!
//! The registry is a JSON file living next to the segments it describes
//! (`{dir}/{prefix}-registry.json`). It outlives any single server run so
//! that a later run can find and release segments left behind by a crash.
//! Only the server process writes it; clients read it to attach.

use crate::error::{ShmError, ShmResult};
use crate::platform::{destroy_segment, is_process_alive};
use jackal_common::consts::SHM_REGISTRY_MAX_ENTRIES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// One shared memory object known to the registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// Process-independent registry index
    pub index: u32,
    /// OS-level identifier (file name inside the registry directory)
    pub os_id: String,
    /// Data section size in bytes
    pub size: usize,
    /// Process that allocated the segment
    pub creator_pid: u32,
    /// Creation timestamp
    pub created_at: SystemTime,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct RegistryFile {
    next_index: u32,
    entries: Vec<RegistryEntry>,
}

/// Registry of segments backed by a JSON file.
#[derive(Debug)]
pub struct SegmentRegistry {
    dir: PathBuf,
    prefix: String,
    next_index: u32,
    entries: BTreeMap<u32, RegistryEntry>,
}

impl SegmentRegistry {
    /// Open the registry in `dir`, loading any entries a previous run left.
    pub fn open(dir: &Path, prefix: &str) -> ShmResult<Self> {
        std::fs::create_dir_all(dir)?;

        let mut registry = Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            next_index: 0,
            entries: BTreeMap::new(),
        };

        match std::fs::read_to_string(registry.file_path()) {
            Ok(content) => {
                let file: RegistryFile = serde_json::from_str(&content)?;
                registry.next_index = file.next_index;
                for entry in file.entries {
                    registry.entries.insert(entry.index, entry);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ShmError::Io { source: e }),
        }

        Ok(registry)
    }

    /// Path of the JSON registry file.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(format!("{}-registry.json", self.prefix))
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Filesystem path for an entry's segment file.
    pub fn segment_path(&self, entry: &RegistryEntry) -> PathBuf {
        self.dir.join(&entry.os_id)
    }

    /// Reserve a new entry for a segment of `size` bytes owned by `creator_pid`.
    ///
    /// The entry is not persisted until [`SegmentRegistry::save`].
    pub fn allocate(&mut self, size: usize, creator_pid: u32) -> ShmResult<RegistryEntry> {
        if self.entries.len() >= SHM_REGISTRY_MAX_ENTRIES {
            return Err(ShmError::RegistryFull {
                capacity: SHM_REGISTRY_MAX_ENTRIES,
            });
        }

        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);

        let entry = RegistryEntry {
            index,
            os_id: format!("{}-{}-{}", self.prefix, creator_pid, index),
            size,
            creator_pid,
            created_at: SystemTime::now(),
        };
        self.entries.insert(index, entry.clone());
        Ok(entry)
    }

    /// Look up an entry by index.
    pub fn get(&self, index: u32) -> Option<&RegistryEntry> {
        self.entries.get(&index)
    }

    /// Update the recorded size of an entry.
    pub fn set_size(&mut self, index: u32, size: usize) -> ShmResult<()> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(ShmError::UnknownSegment { index })?;
        entry.size = size;
        Ok(())
    }

    /// Remove an entry. The segment file is left to the caller.
    pub fn remove(&mut self, index: u32) -> Option<RegistryEntry> {
        self.entries.remove(&index)
    }

    /// All entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the registry (write-then-rename, so readers never see a torn file).
    pub fn save(&self) -> ShmResult<()> {
        let file = RegistryFile {
            next_index: self.next_index,
            entries: self.entries.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.dir.join(format!(".{}-registry.json.tmp", self.prefix));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.file_path())?;
        Ok(())
    }

    /// Release every segment whose creating process no longer exists.
    ///
    /// Returns the number of segments reclaimed.
    pub fn cleanup_orphaned_segments(&mut self) -> ShmResult<usize> {
        let orphaned: Vec<RegistryEntry> = self
            .entries
            .values()
            .filter(|entry| !is_process_alive(entry.creator_pid))
            .cloned()
            .collect();

        let mut cleaned_count = 0;
        for entry in orphaned {
            tracing::info!(
                index = entry.index,
                pid = entry.creator_pid,
                "Cleaning up orphaned segment: {}",
                entry.os_id
            );
            match destroy_segment(&self.segment_path(&entry)) {
                Ok(()) => {
                    self.entries.remove(&entry.index);
                    cleaned_count += 1;
                }
                Err(e) => tracing::warn!("cannot remove orphaned segment {}: {e}", entry.os_id),
            }
        }

        if cleaned_count > 0 {
            self.save()?;
        }
        Ok(cleaned_count)
    }
}
