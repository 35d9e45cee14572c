//! Port types and the port buffer pool
//!
//! Every port type gets its own segment, carved into equal regions of
//! `buffer_size(nframes)` bytes. Region 0 is never handed out: it stays
//! zero-filled and backs every unconnected input. Freed regions go back on a
//! free list; live regions never move.

use crate::context::ShmContext;
use crate::error::{ShmError, ShmResult};
use crate::segment::{Attachment, BufferAddress};
use jackal_common::consts::CACHE_LINE_SIZE;
use std::sync::Arc;

/// Combines one source region into a destination region.
///
/// Called once per source; `first` is set for the first source so the
/// kernel overwrites rather than accumulates.
pub type MixdownFn = fn(dst: &mut [u8], src: &[u8], first: bool);

/// Port type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PortTypeId(pub u32);

/// Static description of a port type.
#[derive(Debug, Clone, Copy)]
pub struct PortType {
    /// Type identifier; connections require equal ids
    pub id: PortTypeId,
    /// Human readable type name
    pub name: &'static str,
    /// Elements per frame; negative means "use `fixed_size`"
    pub scale_factor: i32,
    /// Bytes per element
    pub element_size: usize,
    /// Buffer size in bytes when `scale_factor` is negative
    pub fixed_size: usize,
    /// Mixdown kernel; `None` forbids multiple incoming connections
    pub mixdown: Option<MixdownFn>,
}

/// 32-bit float mono audio.
pub const AUDIO: PortType = PortType {
    id: PortTypeId(0),
    name: "32 bit float mono audio",
    scale_factor: 1,
    element_size: std::mem::size_of::<f32>(),
    fixed_size: 0,
    mixdown: Some(mix_f32),
};

/// Opaque fixed-size event buffer (encoding is up to the clients).
pub const EVENT: PortType = PortType {
    id: PortTypeId(1),
    name: "8 bit raw event",
    scale_factor: -1,
    element_size: 1,
    fixed_size: 4096,
    mixdown: None,
};

impl PortType {
    /// Bytes needed for one buffer at `nframes` frames.
    pub fn buffer_size(&self, nframes: u32) -> usize {
        if self.scale_factor < 0 {
            self.fixed_size
        } else {
            self.scale_factor as usize * nframes as usize * self.element_size
        }
    }

    /// Buffer size rounded up so consecutive regions stay cache-line aligned.
    pub fn region_size(&self, nframes: u32) -> usize {
        self.buffer_size(nframes).div_ceil(CACHE_LINE_SIZE).max(1) * CACHE_LINE_SIZE
    }
}

/// A port's data region: where it lives and how to interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBuffer {
    /// Segment, offset and length
    pub address: BufferAddress,
    /// Element scale factor of the port type
    pub scale_factor: i32,
    /// Port type
    pub type_id: PortTypeId,
}

/// Equal-sized port buffers carved out of one segment.
#[derive(Debug)]
pub struct PortPool {
    port_type: PortType,
    nframes: u32,
    region_size: usize,
    capacity: usize,
    attachment: Arc<Attachment>,
    free: Vec<usize>,
}

impl PortPool {
    /// Allocate a segment holding `capacity` buffers plus the zero region.
    pub fn create(
        ctx: &mut ShmContext,
        port_type: PortType,
        nframes: u32,
        capacity: usize,
    ) -> ShmResult<Self> {
        let region_size = port_type.region_size(nframes);
        let attachment = ctx.shmalloc(region_size * (capacity + 1))?;

        // Lowest offsets first.
        let free = (1..=capacity).rev().map(|slot| slot * region_size).collect();

        Ok(Self {
            port_type,
            nframes,
            region_size,
            capacity,
            attachment,
            free,
        })
    }

    /// Take a free region for a new port.
    pub fn alloc(&mut self) -> ShmResult<PortBuffer> {
        let offset = self.free.pop().ok_or(ShmError::ResourceExhausted)?;
        let buffer = self.buffer_at(offset);
        self.attachment.zero(&buffer.address)?;
        Ok(buffer)
    }

    /// Return a region to the pool. Other ports keep their offsets.
    pub fn free(&mut self, buffer: &PortBuffer) {
        let offset = buffer.address.offset;
        debug_assert!(offset != 0 && offset % self.region_size == 0);
        if offset != 0 && !self.free.contains(&offset) {
            self.free.push(offset);
        }
    }

    /// Region shared by every unconnected input.
    pub fn zero_buffer(&self) -> PortBuffer {
        self.buffer_at(0)
    }

    /// Check the port-size invariant for a buffer of this pool.
    pub fn validate(&self, buffer: &PortBuffer) -> ShmResult<()> {
        if buffer.type_id != self.port_type.id {
            return Err(ShmError::AttachFailed {
                index: buffer.address.segment,
                reason: "port type does not match pool".to_string(),
            });
        }
        let needed = self.port_type.buffer_size(self.nframes);
        if buffer.address.len < needed {
            return Err(ShmError::OutOfBounds {
                offset: buffer.address.offset,
                len: needed,
                size: buffer.address.len,
            });
        }
        self.attachment.validate(&buffer.address)
    }

    fn buffer_at(&self, offset: usize) -> PortBuffer {
        PortBuffer {
            address: BufferAddress {
                segment: self.attachment.index(),
                offset,
                len: self.port_type.buffer_size(self.nframes),
            },
            scale_factor: self.port_type.scale_factor,
            type_id: self.port_type.id,
        }
    }

    /// Segment backing the pool.
    pub fn attachment(&self) -> &Arc<Attachment> {
        &self.attachment
    }

    /// Port type served by this pool.
    pub fn port_type(&self) -> &PortType {
        &self.port_type
    }

    /// Frames per buffer.
    pub fn nframes(&self) -> u32 {
        self.nframes
    }

    /// Maximum simultaneously allocated buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently allocated.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }
}

/// View an aligned byte region as `f32` samples.
#[inline]
pub fn as_f32(bytes: &[u8]) -> &[f32] {
    // SAFETY: every bit pattern is a valid f32.
    let (head, samples, _) = unsafe { bytes.align_to::<f32>() };
    debug_assert!(head.is_empty(), "port buffer not f32 aligned");
    samples
}

/// View an aligned byte region as mutable `f32` samples.
#[inline]
pub fn as_f32_mut(bytes: &mut [u8]) -> &mut [f32] {
    // SAFETY: every bit pattern is a valid f32.
    let (head, samples, _) = unsafe { bytes.align_to_mut::<f32>() };
    debug_assert!(head.is_empty(), "port buffer not f32 aligned");
    samples
}

/// Summing mixdown for float audio.
pub fn mix_f32(dst: &mut [u8], src: &[u8], first: bool) {
    let dst = as_f32_mut(dst);
    let src = as_f32(src);
    if first {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s;
        }
    } else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ShmConfig;

    fn ctx(dir: &std::path::Path) -> ShmContext {
        ShmContext::init(&ShmConfig {
            directory: dir.to_path_buf(),
            prefix: "port".to_string(),
            lock_segments: false,
        })
        .unwrap()
    }

    #[test]
    fn test_buffer_sizes() {
        assert_eq!(AUDIO.buffer_size(256), 1024);
        assert_eq!(AUDIO.region_size(256), 1024);
        assert_eq!(AUDIO.region_size(3), 64);
        assert_eq!(EVENT.buffer_size(256), 4096);
        assert_eq!(EVENT.buffer_size(1024), 4096);
    }

    #[test]
    fn test_alloc_free_keeps_offsets_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        let mut pool = PortPool::create(&mut ctx, AUDIO, 64, 3).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(a.address.offset, 256);
        assert_eq!(b.address.offset, 512);
        assert!(matches!(pool.alloc(), Err(ShmError::ResourceExhausted)));

        pool.free(&b);
        assert_eq!(pool.in_use(), 2);
        // Survivors keep their regions.
        assert!(pool.validate(&a).is_ok());
        assert!(pool.validate(&c).is_ok());
        assert_eq!(pool.alloc().unwrap().address.offset, 512);
    }

    #[test]
    fn test_zero_buffer_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        let pool = PortPool::create(&mut ctx, AUDIO, 32, 2).unwrap();
        let zero = pool.zero_buffer();
        assert_eq!(zero.address.offset, 0);

        let mut out = vec![0xFFu8; zero.address.len];
        pool.attachment().read_into(&zero.address, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mix_f32_sums_sources() {
        let a: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|f| f.to_ne_bytes()).collect();
        let b: Vec<u8> = [0.5f32, -1.0].iter().flat_map(|f| f.to_ne_bytes()).collect();
        // Vec<f32> backing guarantees alignment for the destination.
        let mut dst_samples = vec![9.0f32; 2];
        let dst = unsafe {
            std::slice::from_raw_parts_mut(dst_samples.as_mut_ptr().cast::<u8>(), 8)
        };
        let a_aligned: Vec<f32> = a.chunks(4).map(|c| f32::from_ne_bytes(c.try_into().unwrap())).collect();
        let b_aligned: Vec<f32> = b.chunks(4).map(|c| f32::from_ne_bytes(c.try_into().unwrap())).collect();
        let a_bytes = unsafe { std::slice::from_raw_parts(a_aligned.as_ptr().cast::<u8>(), 8) };
        let b_bytes = unsafe { std::slice::from_raw_parts(b_aligned.as_ptr().cast::<u8>(), 8) };

        mix_f32(dst, a_bytes, true);
        mix_f32(dst, b_bytes, false);
        assert_eq!(dst_samples, vec![1.5, 1.0]);
    }
}
