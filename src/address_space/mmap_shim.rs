//! Thin platform shim over host memory mapping: `reserve`, `map_shared`,
//! `unmap`, `protect`. The rest of the system only knows about the shim.

use crate::error::{Error, Result};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

#[cfg(unix)]
use nix::sys::mman::{mmap, mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
#[cfg(unix)]
use nix::sys::memfd::{memfd_create, MFdFlags};
#[cfg(unix)]
use nix::unistd::ftruncate;
#[cfg(unix)]
use std::os::fd::{AsFd, OwnedFd};

/// A reserved, possibly protected, host virtual-address window.
pub struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Reserves `len` bytes of anonymous, initially-inaccessible host memory.
    #[cfg(unix)]
    pub fn reserve(len: usize) -> Result<Self> {
        let len = NonZeroUsize::new(len).ok_or_else(|| Error::AllocationFailure("zero-length mapping".into()))?;
        let ptr = unsafe { mmap_anonymous(None, len, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE) }
            .map_err(|e| Error::AllocationFailure(format!("mmap reserve failed: {e}")))?;
        Ok(HostMapping { ptr: ptr.cast(), len: len.get() })
    }

    #[cfg(not(unix))]
    pub fn reserve(len: usize) -> Result<Self> {
        Err(Error::AllocationFailure("unsupported platform".into()))
    }

    /// Makes the whole mapping (or an initial `prefix` of it) readable and writable.
    #[cfg(unix)]
    pub fn make_read_write(&mut self, prefix: usize) -> Result<()> {
        let n = prefix.min(self.len);
        if n == 0 {
            return Ok(());
        }
        unsafe { mprotect(self.ptr.cast(), n, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }
            .map_err(|e| Error::AllocationFailure(format!("mprotect rw failed: {e}")))
    }

    /// Makes the whole mapping (or an initial `prefix` of it) executable and
    /// read-only, for JIT code buffers.
    #[cfg(unix)]
    pub fn make_read_exec(&mut self, prefix: usize) -> Result<()> {
        let n = prefix.min(self.len);
        if n == 0 {
            return Ok(());
        }
        unsafe { mprotect(self.ptr.cast(), n, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC) }
            .map_err(|e| Error::AllocationFailure(format!("mprotect rx failed: {e}")))
    }

    /// Revokes all access, used for the protected shadow alias over dynamic pages.
    #[cfg(unix)]
    pub fn make_none(&mut self, prefix: usize) -> Result<()> {
        let n = prefix.min(self.len);
        if n == 0 {
            return Ok(());
        }
        unsafe { mprotect(self.ptr.cast(), n, ProtFlags::PROT_NONE) }
            .map_err(|e| Error::AllocationFailure(format!("mprotect none failed: {e}")))
    }

    /// Overlays `len` bytes of `phys` (at `phys_offset`) onto this mapping at
    /// `local_offset`, `MAP_FIXED | MAP_SHARED`. Used to make the static
    /// regions of both `virtual_base` and `protected_base` true aliases of the
    /// same physical bytes, rather than copies.
    #[cfg(unix)]
    pub fn alias_fixed_shared(
        &mut self,
        local_offset: usize,
        phys: &PhysicalMemory,
        phys_offset: usize,
        len: usize,
        writable: bool,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let addr = unsafe { self.ptr.as_ptr().add(local_offset) } as usize;
        let addr = NonZeroUsize::new(addr).ok_or_else(|| Error::AllocationFailure("null alias target".into()))?;
        let len_nz = NonZeroUsize::new(len).ok_or_else(|| Error::AllocationFailure("zero-length alias".into()))?;
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };
        unsafe {
            mmap(
                Some(addr),
                len_nz,
                prot,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                phys.fd.as_fd(),
                phys_offset as i64,
            )
        }
        .map_err(|e| Error::AllocationFailure(format!("fixed alias mmap failed: {e}")))?;
        Ok(())
    }
}

/// The "physical shared-memory object" backing every static region: a single memfd-backed allocation, mmap'd into every virtual alias of
/// the static windows that reference it so writes through one alias are
/// visible through every other.
#[cfg(unix)]
pub struct PhysicalMemory {
    fd: OwnedFd,
    size: usize,
}

#[cfg(unix)]
impl PhysicalMemory {
    pub fn new(size: usize) -> Result<Self> {
        let fd = memfd_create(c"dc-recomp-phys", MFdFlags::empty())
            .map_err(|e| Error::AllocationFailure(format!("memfd_create failed: {e}")))?;
        ftruncate(&fd, size as i64).map_err(|e| Error::AllocationFailure(format!("ftruncate failed: {e}")))?;
        Ok(PhysicalMemory { fd, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(not(unix))]
pub struct PhysicalMemory {
    size: usize,
}

#[cfg(not(unix))]
impl PhysicalMemory {
    pub fn new(_size: usize) -> Result<Self> {
        Err(Error::AllocationFailure("unsupported platform".into()))
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for HostMapping {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {}
}
