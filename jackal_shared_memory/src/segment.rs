//! Shared memory segment layout and per-process attachments

use crate::error::{ShmError, ShmResult};
use crate::platform::lock_memory;
use jackal_common::consts::{CACHE_LINE_SIZE, SHM_MAX_SIZE, SHM_PAGE_SIZE};
use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::ptr::NonNull;

/// Magic number identifying a jackal segment: `"JACKSHM\0"`.
pub const JACKAL_SHM_MAGIC: u64 = u64::from_le_bytes(*b"JACKSHM\0");

/// Segment header, cache-line aligned, at byte 0 of every segment file.
///
/// Written once by the creator; attachers validate it against their
/// registry entry before exposing any data.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: u64,
    /// Registry index of this segment
    pub index: u32,
    /// Creating process ID
    pub creator_pid: u32,
    /// Data section size
    pub size: u64,
    _padding: [u8; 104],
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), 128);
const_assert_eq!(core::mem::align_of::<SegmentHeader>(), CACHE_LINE_SIZE);

/// Size of the header preceding the data section.
pub const SEGMENT_HEADER_SIZE: usize = core::mem::size_of::<SegmentHeader>();

impl SegmentHeader {
    /// Create new segment header
    pub fn new(index: u32, size: usize, creator_pid: u32) -> Self {
        Self {
            magic: JACKAL_SHM_MAGIC,
            index,
            creator_pid,
            size: size as u64,
            _padding: [0; 104],
        }
    }

    /// Validate header against the registry's view of the segment
    pub fn validate(&self, index: u32, mapped_len: usize) -> ShmResult<()> {
        if self.magic != JACKAL_SHM_MAGIC {
            return Err(ShmError::AttachFailed {
                index,
                reason: "invalid magic".to_string(),
            });
        }
        if self.index != index {
            return Err(ShmError::AttachFailed {
                index,
                reason: format!("header names segment {}", self.index),
            });
        }
        if self.size as usize + SEGMENT_HEADER_SIZE > mapped_len {
            return Err(ShmError::AttachFailed {
                index,
                reason: format!(
                    "header claims {} bytes but only {} are mapped",
                    self.size,
                    mapped_len.saturating_sub(SEGMENT_HEADER_SIZE)
                ),
            });
        }
        Ok(())
    }
}

/// Location of a byte region inside a segment, valid in every process.
///
/// This is the only form in which shared addresses cross the process
/// boundary; each process resolves it against its own [`Attachment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BufferAddress {
    /// Registry index of the segment
    pub segment: u32,
    /// Byte offset from the start of the data section
    pub offset: usize,
    /// Region length in bytes
    pub len: usize,
}

impl BufferAddress {
    /// End offset (exclusive).
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// A segment mapped into the calling process.
///
/// Attachments are process-local: they carry the local base address and are
/// never written to the registry. Unmapped on drop.
pub struct Attachment {
    index: u32,
    size: usize,
    data: NonNull<u8>,
    mmap: MmapMut,
}

// SAFETY: the mapping is MAP_SHARED memory outside any Rust object; access
// discipline (one writer per region, regions never overlap) is upheld by the
// port pool and the process cycle, not by this type.
unsafe impl Send for Attachment {}
unsafe impl Sync for Attachment {}

impl Attachment {
    /// Initialise a freshly created mapping: write the header, expose the data.
    pub fn initialize(index: u32, size: usize, creator_pid: u32, mut mmap: MmapMut) -> ShmResult<Self> {
        if mmap.len() < size + SEGMENT_HEADER_SIZE {
            return Err(ShmError::InvalidSize { size });
        }
        validate_memory_alignment(mmap.as_ptr() as usize)?;

        let header = SegmentHeader::new(index, size, creator_pid);
        // SAFETY: mapping is page aligned and at least header-sized.
        unsafe { std::ptr::write(mmap.as_mut_ptr().cast::<SegmentHeader>(), header) };

        Self::wrap(index, size, mmap)
    }

    /// Wrap an existing mapping after validating its header.
    pub fn open(index: u32, mut mmap: MmapMut) -> ShmResult<Self> {
        if mmap.len() < SEGMENT_HEADER_SIZE {
            return Err(ShmError::AttachFailed {
                index,
                reason: "mapping smaller than header".to_string(),
            });
        }
        validate_memory_alignment(mmap.as_ptr() as usize)?;

        // SAFETY: length checked above; page-aligned mapping.
        let header = unsafe { std::ptr::read(mmap.as_mut_ptr().cast::<SegmentHeader>()) };
        header.validate(index, mmap.len())?;

        Self::wrap(index, header.size as usize, mmap)
    }

    fn wrap(index: u32, size: usize, mut mmap: MmapMut) -> ShmResult<Self> {
        // SAFETY: mmap.len() >= SEGMENT_HEADER_SIZE was checked by both callers.
        let data = unsafe { mmap.as_mut_ptr().add(SEGMENT_HEADER_SIZE) };
        let data = NonNull::new(data).ok_or(ShmError::AttachFailed {
            index,
            reason: "null mapping".to_string(),
        })?;
        Ok(Self {
            index,
            size,
            data,
            mmap,
        })
    }

    /// Registry index of this segment
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Data section size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Local base address of the data section
    pub fn base(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Check that an address names a region inside this segment
    pub fn validate(&self, addr: &BufferAddress) -> ShmResult<()> {
        if addr.segment != self.index {
            return Err(ShmError::UnknownSegment {
                index: addr.segment,
            });
        }
        match addr.offset.checked_add(addr.len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset: addr.offset,
                len: addr.len,
                size: self.size,
            }),
        }
    }

    /// Resolve an address to a local pointer.
    ///
    /// # Safety
    ///
    /// `addr` must have passed [`Attachment::validate`] against this attachment.
    #[inline]
    pub unsafe fn resolve(&self, addr: &BufferAddress) -> *mut u8 {
        debug_assert!(self.validate(addr).is_ok());
        unsafe { self.data.as_ptr().add(addr.offset) }
    }

    /// Borrow a validated region immutably.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for this attachment and no `&mut` to an
    /// overlapping region may be live for the returned lifetime.
    #[inline]
    pub unsafe fn slice(&self, addr: &BufferAddress) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.resolve(addr), addr.len) }
    }

    /// Borrow a validated region mutably.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for this attachment and the caller must be the
    /// only party touching the region for the returned lifetime.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, addr: &BufferAddress) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.resolve(addr), addr.len) }
    }

    /// Copy a region out of the segment.
    pub fn read_into(&self, addr: &BufferAddress, dst: &mut [u8]) -> ShmResult<usize> {
        self.validate(addr)?;
        let n = addr.len.min(dst.len());
        // SAFETY: validated; the copy tolerates concurrent writers (bytes only).
        unsafe { std::ptr::copy_nonoverlapping(self.resolve(addr), dst.as_mut_ptr(), n) };
        Ok(n)
    }

    /// Copy bytes into a region of the segment.
    pub fn write_from(&self, addr: &BufferAddress, src: &[u8]) -> ShmResult<usize> {
        self.validate(addr)?;
        let n = addr.len.min(src.len());
        // SAFETY: validated; caller owns the region per the port discipline.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.resolve(addr), n) };
        Ok(n)
    }

    /// Fill a region with zero bytes.
    pub fn zero(&self, addr: &BufferAddress) -> ShmResult<()> {
        self.validate(addr)?;
        // SAFETY: validated.
        unsafe { std::ptr::write_bytes(self.resolve(addr), 0, addr.len) };
        Ok(())
    }

    /// Pin the whole mapping in RAM.
    pub fn lock(&self) -> ShmResult<()> {
        lock_memory(self.mmap.as_ptr(), self.mmap.len())?;
        Ok(())
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("base", &self.data)
            .finish()
    }
}

/// Validate segment size constraints
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if size == 0 || size > SHM_MAX_SIZE {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// Total file length for a data section of `size` bytes, rounded to pages.
pub fn mapped_len(size: usize) -> usize {
    let total = size + SEGMENT_HEADER_SIZE;
    total.div_ceil(SHM_PAGE_SIZE) * SHM_PAGE_SIZE
}

/// Validate memory alignment
pub fn validate_memory_alignment(address: usize) -> ShmResult<()> {
    if address % CACHE_LINE_SIZE != 0 {
        return Err(ShmError::AttachFailed {
            index: u32::MAX,
            reason: format!("address {address:#x} not aligned to {CACHE_LINE_SIZE}"),
        });
    }
    Ok(())
}
