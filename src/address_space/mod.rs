//! 32-bit guest virtual memory.
//!
//! A [`MemoryMap`] of mount/mirror entries is flattened by [`install_map`]
//! into a [`PageTable`] plus two host virtual-address aliases of every static
//! region: `virtual_base` (read/write, used by slow-path accessors and the
//! interpreter) and `protected_base` (dynamic pages revoked, used by
//! JIT-generated fastmem loads/stores so that touching an MMIO page raises a
//! host fault).

pub mod mmap_shim;
pub mod page_table;
pub mod region;

use crate::error::{Error, Result};
use crate::layout::{ADDRESS_SPACE_SIZE, PAGE_SIZE};
use mmap_shim::{HostMapping, PhysicalMemory};
use page_table::{PageEntry, PageTable, RawEntry, RegionHandle};
use region::{DynamicCallbacks, Region, RegionKind};

/// One entry of a declarative [`MemoryMap`].
pub enum MapEntry {
    /// Attach `region` at virtual address `virt_addr`.
    Mount { virt_addr: u32, region: RegionHandle },
    /// Duplicate the virtual range `[src, src+size)` at `dst`.
    Mirror { src: u32, dst: u32, size: u32 },
}

/// An ordered sequence of mount/mirror entries.
#[derive(Default)]
pub struct MemoryMap {
    entries: Vec<MapEntry>,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap { entries: Vec::new() }
    }

    pub fn mount(&mut self, virt_addr: u32, region: RegionHandle) -> &mut Self {
        self.entries.push(MapEntry::Mount { virt_addr, region });
        self
    }

    pub fn mirror(&mut self, src: u32, dst: u32, size: u32) -> &mut Self {
        self.entries.push(MapEntry::Mirror { src, dst, size });
        self
    }
}

fn is_page_aligned(v: u32) -> bool {
    v % PAGE_SIZE == 0
}

pub struct AddressSpace {
    regions: Vec<Region>,
    page_table: PageTable,
    virtual_base: Option<HostMapping>,
    protected_base: Option<HostMapping>,
    phys: Option<PhysicalMemory>,
    /// Running allocator over the physical shared-memory object; one entry
    /// per static region, in creation order.
    phys_cursor: usize,
    /// Byte offset into the physical shared-memory object backing each
    /// currently-mapped static page, keyed by page index. Populated by
    /// `mount` and consulted by `mirror` so mirrors alias the same physical
    /// bytes instead of copying them.
    static_phys_offset: std::collections::HashMap<usize, usize>,
}

impl AddressSpace {
    pub fn new() -> Self {
        let num_pages = (ADDRESS_SPACE_SIZE / PAGE_SIZE as u64) as usize;
        AddressSpace {
            regions: Vec::new(),
            page_table: PageTable::new(num_pages),
            virtual_base: None,
            protected_base: None,
            phys: None,
            phys_cursor: 0,
            static_phys_offset: std::collections::HashMap::new(),
        }
    }

    /// Reserves a static window; no host allocation happens until
    /// [`install_map`] runs.
    pub fn create_region_static(&mut self, phys_addr: u32, size: u32) -> Result<RegionHandle> {
        if !is_page_aligned(phys_addr) || !is_page_aligned(size) {
            return Err(Error::MapMisalignment(phys_addr, size));
        }
        for existing in &self.regions {
            if existing.is_static() && ranges_overlap(existing.phys_addr, existing.end(), phys_addr, phys_addr + size) {
                return Err(Error::RegionOverlap(phys_addr, phys_addr + size));
            }
        }
        let handle = self.regions.len() as RegionHandle;
        let phys_mem_offset = self.phys_cursor;
        self.phys_cursor += size as usize;
        self.regions.push(Region {
            handle,
            phys_addr,
            size,
            kind: RegionKind::Static,
            phys_mem_offset,
        });
        Ok(handle)
    }

    /// Reserves a dynamic window whose accesses invoke `callbacks`.
    pub fn create_region_dynamic(&mut self, phys_addr: u32, size: u32, callbacks: DynamicCallbacks) -> Result<RegionHandle> {
        if !is_page_aligned(phys_addr) || !is_page_aligned(size) {
            return Err(Error::MapMisalignment(phys_addr, size));
        }
        let handle = self.regions.len() as RegionHandle;
        self.regions.push(Region {
            handle,
            phys_addr,
            size,
            kind: RegionKind::Dynamic(callbacks),
            phys_mem_offset: 0,
        });
        Ok(handle)
    }

    /// Materializes the page table and host mappings from `map`. Idempotent
    /// on a fresh address space; re-running it first tears down any existing
    /// mappings.
    pub fn install_map(&mut self, map: &MemoryMap) -> Result<()> {
        self.teardown();

        let total_phys = self.phys_cursor;
        let phys = PhysicalMemory::new(total_phys.max(PAGE_SIZE as usize))?;
        let space_len = ADDRESS_SPACE_SIZE as usize;
        let mut virtual_base = HostMapping::reserve(space_len)?;
        let mut protected_base = HostMapping::reserve(space_len)?;

        for entry in &map.entries {
            match entry {
                MapEntry::Mount { virt_addr, region } => {
                    self.mount(&mut virtual_base, &mut protected_base, &phys, *virt_addr, *region)?;
                }
                MapEntry::Mirror { src, dst, size } => {
                    self.mirror(*src, *dst, *size)?;
                }
            }
        }

        self.phys = Some(phys);
        self.virtual_base = Some(virtual_base);
        self.protected_base = Some(protected_base);
        Ok(())
    }

    fn teardown(&mut self) {
        self.page_table.clear();
        self.virtual_base = None;
        self.protected_base = None;
        self.phys = None;
        self.static_phys_offset.clear();
    }

    fn mount(
        &mut self,
        virtual_base: &mut HostMapping,
        protected_base: &mut HostMapping,
        phys: &PhysicalMemory,
        virt_addr: u32,
        region: RegionHandle,
    ) -> Result<()> {
        if !is_page_aligned(virt_addr) {
            return Err(Error::MapMisalignment(virt_addr, 0));
        }
        let region = self
            .regions
            .get(region as usize)
            .ok_or_else(|| Error::Bug(format!("unknown region handle {region}")))?;
        if !is_page_aligned(region.size) {
            return Err(Error::MapMisalignment(virt_addr, region.size));
        }
        let first_page = (virt_addr / PAGE_SIZE) as usize;
        let num_pages = (region.size / PAGE_SIZE) as usize;

        match &region.kind {
            RegionKind::Static => {
                let local_off = first_page * PAGE_SIZE as usize;
                virtual_base.alias_fixed_shared(local_off, phys, region.phys_mem_offset, region.size as usize, true)?;
                protected_base.alias_fixed_shared(local_off, phys, region.phys_mem_offset, region.size as usize, true)?;
                for p in 0..num_pages {
                    let host_ptr = unsafe { virtual_base.as_ptr().add((first_page + p) * PAGE_SIZE as usize) };
                    self.page_table.set(first_page + p, RawEntry::from_static_ptr(host_ptr));
                    self.static_phys_offset.insert(first_page + p, region.phys_mem_offset + p * PAGE_SIZE as usize);
                }
            }
            RegionKind::Dynamic(_) => {
                // The protected alias stays PROT_NONE for these pages so that a
                // fastmem instruction touching them faults.
                for p in 0..num_pages {
                    let offset = (p as u32) * PAGE_SIZE;
                    self.page_table.set(first_page + p, RawEntry::from_dynamic(region.handle, offset));
                }
            }
        }
        Ok(())
    }

    fn mirror(&mut self, src: u32, dst: u32, size: u32) -> Result<()> {
        if !is_page_aligned(src) || !is_page_aligned(dst) || !is_page_aligned(size) {
            return Err(Error::MapMisalignment(dst, size));
        }
        let src_first = (src / PAGE_SIZE) as usize;
        let dst_first = (dst / PAGE_SIZE) as usize;
        let num_pages = (size / PAGE_SIZE) as usize;
        let virtual_base = self.virtual_base.as_mut().ok_or_else(|| Error::Bug("mirror before install".into()))?;
        let protected_base = self.protected_base.as_mut().ok_or_else(|| Error::Bug("mirror before install".into()))?;

        for p in 0..num_pages {
            let entry = self.page_table.get(src_first + p);
            match entry {
                PageEntry::Static { .. } => {
                    let phys_off = *self
                        .static_phys_offset
                        .get(&(src_first + p))
                        .ok_or_else(|| Error::Bug("mirrored static page has no physical backing".into()))?;
                    let dst_local_off = (dst_first + p) * PAGE_SIZE as usize;
                    let phys = self.phys.as_ref().ok_or_else(|| Error::Bug("mirror before install".into()))?;
                    virtual_base.alias_fixed_shared(dst_local_off, phys, phys_off, PAGE_SIZE as usize, true)?;
                    protected_base.alias_fixed_shared(dst_local_off, phys, phys_off, PAGE_SIZE as usize, true)?;
                    let host_ptr = unsafe { virtual_base.as_ptr().add(dst_local_off) };
                    self.page_table.set(dst_first + p, RawEntry::from_static_ptr(host_ptr));
                    self.static_phys_offset.insert(dst_first + p, phys_off);
                }
                PageEntry::Dynamic { region, offset } => {
                    self.page_table.set(dst_first + p, RawEntry::from_dynamic(region, offset));
                }
                PageEntry::Unmapped => {}
            }
        }
        Ok(())
    }

    pub fn lookup(&self, virt_addr: u32) -> PageEntry {
        let page = (virt_addr / PAGE_SIZE) as usize;
        if page >= self.page_table.len() {
            return PageEntry::Unmapped;
        }
        self.page_table.get(page)
    }

    pub fn virtual_base_ptr(&self) -> Option<*mut u8> {
        self.virtual_base.as_ref().map(|m| m.as_ptr())
    }

    pub fn protected_base_ptr(&self) -> Option<*mut u8> {
        self.protected_base.as_ref().map(|m| m.as_ptr())
    }

    fn dynamic_region(&self, handle: RegionHandle) -> Option<&DynamicCallbacks> {
        match &self.regions.get(handle as usize)?.kind {
            RegionKind::Dynamic(cb) => Some(cb),
            RegionKind::Static => None,
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        match self.lookup(addr) {
            PageEntry::Unmapped => {
                log::warn!("read8 from unmapped address {addr:#010x}");
                0
            }
            PageEntry::Static { host_ptr } => unsafe {
                let page_off = (addr % PAGE_SIZE) as usize;
                *host_ptr.add(page_off)
            },
            PageEntry::Dynamic { region, offset } => {
                let region_offset = offset + (addr % PAGE_SIZE);
                match self.dynamic_region(region) {
                    Some(cb) => (cb.read8)(region_offset),
                    None => 0,
                }
            }
        }
    }

    pub fn read16(&self, addr: u32) -> u16 {
        self.read_width(addr, |p| u16::from_le_bytes([unsafe { *p }, unsafe { *p.add(1) }]), |cb, o| (cb.read16)(o))
    }

    pub fn read32(&self, addr: u32) -> u32 {
        self.read_width(
            addr,
            |p| unsafe { (p as *const u32).read_unaligned() },
            |cb, o| (cb.read32)(o),
        )
    }

    pub fn read64(&self, addr: u32) -> u64 {
        self.read_width(
            addr,
            |p| unsafe { (p as *const u64).read_unaligned() },
            |cb, o| (cb.read64)(o),
        )
    }

    fn read_width<T: Default>(&self, addr: u32, from_host: impl Fn(*mut u8) -> T, from_cb: impl Fn(&DynamicCallbacks, u32) -> T) -> T {
        match self.lookup(addr) {
            PageEntry::Unmapped => {
                log::warn!("read from unmapped address {addr:#010x}");
                T::default()
            }
            PageEntry::Static { host_ptr } => {
                let page_off = (addr % PAGE_SIZE) as usize;
                from_host(unsafe { host_ptr.add(page_off) })
            }
            PageEntry::Dynamic { region, offset } => {
                let region_offset = offset + (addr % PAGE_SIZE);
                match self.dynamic_region(region) {
                    Some(cb) => from_cb(cb, region_offset),
                    None => T::default(),
                }
            }
        }
    }

    pub fn write8(&self, addr: u32, value: u8) {
        match self.lookup(addr) {
            PageEntry::Unmapped => log::warn!("write8 to unmapped address {addr:#010x}"),
            PageEntry::Static { host_ptr } => unsafe { *host_ptr.add((addr % PAGE_SIZE) as usize) = value },
            PageEntry::Dynamic { region, offset } => {
                if let Some(cb) = self.dynamic_region(region) {
                    (cb.write8)(offset + (addr % PAGE_SIZE), value);
                }
            }
        }
    }

    pub fn write16(&self, addr: u32, value: u16) {
        self.write_width(addr, value, |p, v| unsafe { (p as *mut u16).write_unaligned(v) }, |cb, o, v| (cb.write16)(o, v));
    }

    pub fn write32(&self, addr: u32, value: u32) {
        self.write_width(addr, value, |p, v| unsafe { (p as *mut u32).write_unaligned(v) }, |cb, o, v| (cb.write32)(o, v));
    }

    pub fn write64(&self, addr: u32, value: u64) {
        self.write_width(addr, value, |p, v| unsafe { (p as *mut u64).write_unaligned(v) }, |cb, o, v| (cb.write64)(o, v));
    }

    fn write_width<T: Copy>(&self, addr: u32, value: T, to_host: impl Fn(*mut u8, T), to_cb: impl Fn(&DynamicCallbacks, u32, T)) {
        match self.lookup(addr) {
            PageEntry::Unmapped => log::warn!("write to unmapped address {addr:#010x}"),
            PageEntry::Static { host_ptr } => {
                let page_off = (addr % PAGE_SIZE) as usize;
                to_host(unsafe { host_ptr.add(page_off) }, value)
            }
            PageEntry::Dynamic { region, offset } => {
                if let Some(cb) = self.dynamic_region(region) {
                    to_cb(cb, offset + (addr % PAGE_SIZE), value);
                }
            }
        }
    }

    pub fn memcpy_from_guest(&self, dst: &mut [u8], src_addr: u32) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.read8(src_addr + i as u32);
        }
    }

    pub fn memcpy_to_guest(&self, dst_addr: u32, src: &[u8]) {
        for (i, &b) in src.iter().enumerate() {
            self.write8(dst_addr + i as u32, b);
        }
    }

    pub fn memcpy_guest_to_guest(&self, dst_addr: u32, src_addr: u32, len: u32) {
        for i in 0..len {
            let b = self.read8(src_addr + i);
            self.write8(dst_addr + i, b);
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn ranges_overlap(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> bool {
    a_start < b_end && b_start < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_load_store() {
        let mut space = AddressSpace::new();
        let region = space.create_region_static(0x0c00_0000, PAGE_SIZE).unwrap();
        let mut map = MemoryMap::new();
        map.mount(0x0c00_0000, region);
        map.mirror(0x0c00_0000, 0x8c00_0000, PAGE_SIZE);
        space.install_map(&map).unwrap();

        space.write32(0x8c00_0010, 0xdeadbeef);
        assert_eq!(space.read32(0x0c00_0010), 0xdeadbeef);
    }
}
