//! Tagged, page-mapped memory
//!
//! Memory is a set of regions created by [`Memory::mmap`]. Each region is
//! stored as 16-byte granules that hold either plain bytes or one tagged
//! capability, so a capability survives a round trip through memory only when
//! it is written and read back whole.
//!
//! # Rules
//!
//! 1. **W^X**: no page is ever writable and executable at the same time
//! 2. **Maximum protection**: `mprotect` can never exceed the protection the
//!    mapping was created with
//! 3. **No address reuse**: unmapped ranges are never handed out again
//! 4. **Instruction cache**: a write marks its page stale until
//!    [`Memory::clear_cache`] flushes it; fetching from a stale page faults

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use cmpt_cap::{Capability, Perms, RootAuthority, CAP_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{Fault, MapError};

/// Lowest address handed out by `mmap`.
pub const MAP_BASE: u64 = 0x4000_0000;

bitflags! {
    /// Page protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Prot: u8 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXEC       = 1 << 2;
        /// The returned capability may take part in a branch-sealed-pair
        const CAP_INVOKE = 1 << 3;

        const RW  = Self::READ.bits() | Self::WRITE.bits();
        const RX  = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::RW.bits() | Self::EXEC.bits();
    }
}

impl Prot {
    /// Capability permissions granted by a mapping with this maximum protection.
    pub fn capability_perms(self) -> Perms {
        let mut perms = Perms::GLOBAL | Perms::VMEM;
        if self.contains(Prot::READ) {
            perms |= Perms::READ_CAP;
        }
        if self.contains(Prot::WRITE) {
            perms |= Perms::WRITE_CAP;
        }
        if self.contains(Prot::EXEC) {
            perms |= Perms::EXECUTE | Perms::EXECUTIVE;
        }
        if self.contains(Prot::CAP_INVOKE) {
            perms |= Perms::CAP_INVOKE;
        }
        perms
    }

    fn access(self) -> Prot {
        self & Prot::RWX
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Granule {
    Bytes([u8; CAP_SIZE as usize]),
    Cap(Capability),
}

impl Granule {
    const ZERO: Granule = Granule::Bytes([0; CAP_SIZE as usize]);

    /// Byte view. A capability shows its address in the low eight bytes.
    fn bytes(&self) -> [u8; CAP_SIZE as usize] {
        match self {
            Granule::Bytes(b) => *b,
            Granule::Cap(cap) => {
                let mut b = [0u8; CAP_SIZE as usize];
                b[..8].copy_from_slice(&cap.address().to_le_bytes());
                b
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Page {
    prot: Prot,
    stale: bool,
}

struct Region {
    len: u64,
    max_prot: Prot,
    pages: Vec<Page>,
    granules: Vec<Granule>,
}

/// Public view of one mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegionInfo {
    pub base: u64,
    pub len: u64,
    pub max_prot: Prot,
    /// Protection of each page, in order
    pub page_prot: Vec<Prot>,
}

/// The machine's address space.
pub struct Memory {
    page_size: u64,
    limit_pages: u64,
    mapped_pages: u64,
    next_base: u64,
    regions: BTreeMap<u64, Region>,
    /// Mints the capability returned for each new mapping
    authority: &'static RootAuthority,
}

impl Memory {
    /// Create an empty address space.
    pub(crate) fn new(page_size: u64, limit_pages: u64, authority: &'static RootAuthority) -> Self {
        Self {
            page_size,
            limit_pages,
            mapped_pages: 0,
            next_base: MAP_BASE,
            regions: BTreeMap::new(),
            authority,
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Pages currently mapped through `mmap`.
    pub fn mapped_pages(&self) -> u64 {
        self.mapped_pages
    }

    /// Maximum number of pages that may be mapped through `mmap`.
    pub fn limit_pages(&self) -> u64 {
        self.limit_pages
    }

    /// Next address `mmap` will consider.
    pub fn next_base(&self) -> u64 {
        self.next_base
    }

    fn round_to_pages(&self, len: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        let mask = self.page_size - 1;
        len.checked_add(mask).map(|l| l & !mask)
    }

    fn insert_region(&mut self, base: u64, len: u64, prot: Prot, max_prot: Prot) {
        let page_count = (len / self.page_size) as usize;
        let region = Region {
            len,
            max_prot,
            pages: vec![
                Page {
                    prot: prot.access(),
                    stale: false,
                };
                page_count
            ],
            granules: vec![Granule::ZERO; (len / CAP_SIZE) as usize],
        };
        self.regions.insert(base, region);
    }

    /// Install the fixed text segment. Not counted against the memory limit.
    pub(crate) fn map_text(&mut self, base: u64, len: u64) {
        self.insert_region(base, len, Prot::RX, Prot::RX);
    }

    // ========================================================================
    // Mapping management
    // ========================================================================

    /// Map `len` bytes (rounded up to pages) with protection `prot`.
    ///
    /// `max_prot` bounds every later `mprotect`; an empty `max_prot` means
    /// `prot`. The returned capability covers the mapping and carries the
    /// permissions of `max_prot` plus VMEM.
    pub fn mmap(&mut self, len: u64, prot: Prot, max_prot: Prot) -> Result<Capability, MapError> {
        let len = self.round_to_pages(len).ok_or(MapError::InvalidLength)?;
        let max_prot = if max_prot.access().is_empty() {
            prot
        } else {
            max_prot | (prot & Prot::CAP_INVOKE)
        };
        if prot.contains(Prot::WRITE | Prot::EXEC) {
            return Err(MapError::WriteExecute);
        }
        if !max_prot.access().contains(prot.access()) {
            return Err(MapError::ExceedsMaxProt);
        }
        let pages = len / self.page_size;
        if self.mapped_pages.saturating_add(pages) > self.limit_pages {
            return Err(MapError::OutOfMemory);
        }
        let base = self.next_base;
        // One unmapped guard page between mappings.
        self.next_base = base
            .checked_add(len)
            .and_then(|end| end.checked_add(self.page_size))
            .ok_or(MapError::OutOfMemory)?;
        self.insert_region(base, len, prot, max_prot);
        self.mapped_pages += pages;
        Ok(self.authority.new_root(base, len, max_prot.capability_perms()))
    }

    fn check_authority(&self, auth: &Capability, addr: u64, len: u64) -> Result<(), MapError> {
        if auth.is_valid()
            && !auth.is_sealed()
            && auth.check_perms(Perms::VMEM)
            && auth.covers(addr, len)
        {
            Ok(())
        } else {
            Err(MapError::InvalidAuthority)
        }
    }

    /// Change the protection of whole pages in `[addr, addr + len)`.
    pub fn mprotect(
        &mut self,
        auth: &Capability,
        addr: u64,
        len: u64,
        prot: Prot,
    ) -> Result<(), MapError> {
        let len = self.round_to_pages(len).ok_or(MapError::InvalidLength)?;
        if addr % self.page_size != 0 {
            return Err(MapError::InvalidLength);
        }
        self.check_authority(auth, addr, len)?;
        if prot.contains(Prot::WRITE | Prot::EXEC) {
            return Err(MapError::WriteExecute);
        }
        let page_size = self.page_size;
        let (base, region) = self
            .regions
            .range_mut(..=addr)
            .next_back()
            .ok_or(MapError::NotMapped)?;
        if addr + len > base + region.len {
            return Err(MapError::NotMapped);
        }
        if !region.max_prot.access().contains(prot.access()) {
            return Err(MapError::ExceedsMaxProt);
        }
        let first = ((addr - base) / page_size) as usize;
        let count = (len / page_size) as usize;
        for page in &mut region.pages[first..first + count] {
            page.prot = prot.access();
        }
        Ok(())
    }

    /// Unmap a whole region. Partial unmaps are refused.
    pub fn munmap(&mut self, auth: &Capability, addr: u64, len: u64) -> Result<(), MapError> {
        let len = self.round_to_pages(len).ok_or(MapError::InvalidLength)?;
        self.check_authority(auth, addr, len)?;
        let region_len = self
            .regions
            .get(&addr)
            .map(|r| r.len)
            .ok_or(MapError::NotMapped)?;
        if region_len != len {
            return Err(MapError::InvalidLength);
        }
        self.regions.remove(&addr);
        self.mapped_pages -= len / self.page_size;
        Ok(())
    }

    /// Flush the instruction cache for every mapped page touching the range.
    pub fn clear_cache(&mut self, addr: u64, len: u64) {
        let page_size = self.page_size;
        let end = addr.saturating_add(len);
        for (base, region) in self.regions.range_mut(..end) {
            let region_end = base + region.len;
            if region_end <= addr {
                continue;
            }
            for (i, page) in region.pages.iter_mut().enumerate() {
                let start = base + i as u64 * page_size;
                if start < end && start + page_size > addr {
                    page.stale = false;
                }
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Snapshot of every mapping, text segment included.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .iter()
            .map(|(base, r)| RegionInfo {
                base: *base,
                len: r.len,
                max_prot: r.max_prot,
                page_prot: r.pages.iter().map(|p| p.prot).collect(),
            })
            .collect()
    }

    /// Protection of the page containing `addr`.
    pub fn prot_at(&self, addr: u64) -> Option<Prot> {
        let (base, region) = self.locate(addr)?;
        Some(region.pages[((addr - base) / self.page_size) as usize].prot)
    }

    /// True if any byte of `[addr, addr + len)` is mapped.
    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        let end = addr.saturating_add(len);
        self.regions
            .range(..end)
            .any(|(base, r)| base + r.len > addr)
    }

    // ========================================================================
    // Access (capability checks are the caller's job)
    // ========================================================================

    fn locate(&self, addr: u64) -> Option<(u64, &Region)> {
        let (base, region) = self.regions.range(..=addr).next_back()?;
        if addr < base + region.len {
            Some((*base, region))
        } else {
            None
        }
    }

    fn locate_mut(&mut self, addr: u64) -> Option<(u64, &mut Region)> {
        let (base, region) = self.regions.range_mut(..=addr).next_back()?;
        if addr < *base + region.len {
            Some((*base, region))
        } else {
            None
        }
    }

    /// Check that `[addr, addr + len)` lies in one region whose pages allow
    /// `access`.
    fn check_range(&self, addr: u64, len: u64, access: Prot) -> Result<(), Fault> {
        let (base, region) = self.locate(addr).ok_or(Fault::Unmapped { addr })?;
        let end = addr.checked_add(len).ok_or(Fault::Unmapped { addr })?;
        if end > base + region.len {
            return Err(Fault::Unmapped { addr: base + region.len });
        }
        let first = (addr - base) / self.page_size;
        let last = (end - 1 - base) / self.page_size;
        for index in first..=last {
            let page = &region.pages[index as usize];
            if !page.prot.contains(access) {
                return Err(Fault::Protection {
                    addr: base + index * self.page_size,
                });
            }
        }
        Ok(())
    }

    /// Read plain bytes. Capabilities read as their address.
    pub(crate) fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.check_range(addr, buf.len() as u64, Prot::READ)?;
        let Some((base, region)) = self.locate(addr) else {
            return Err(Fault::Unmapped { addr });
        };
        for (i, byte) in buf.iter_mut().enumerate() {
            let off = addr + i as u64 - base;
            *byte = region.granules[(off / CAP_SIZE) as usize].bytes()[(off % CAP_SIZE) as usize];
        }
        Ok(())
    }

    /// Write plain bytes, clearing the tag of every granule touched.
    pub(crate) fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Fault> {
        self.check_range(addr, bytes.len() as u64, Prot::WRITE)?;
        let page_size = self.page_size;
        let Some((base, region)) = self.locate_mut(addr) else {
            return Err(Fault::Unmapped { addr });
        };
        for (i, byte) in bytes.iter().enumerate() {
            let off = addr + i as u64 - base;
            let slot = &mut region.granules[(off / CAP_SIZE) as usize];
            let mut raw = slot.bytes();
            raw[(off % CAP_SIZE) as usize] = *byte;
            *slot = Granule::Bytes(raw);
            region.pages[(off / page_size) as usize].stale = true;
        }
        Ok(())
    }

    /// Read one capability-sized granule. Plain bytes read as an untagged
    /// capability holding the low eight bytes.
    pub(crate) fn read_cap(&self, addr: u64) -> Result<Capability, Fault> {
        if addr % CAP_SIZE != 0 {
            return Err(Fault::Alignment { addr });
        }
        self.check_range(addr, CAP_SIZE, Prot::READ)?;
        let Some((base, region)) = self.locate(addr) else {
            return Err(Fault::Unmapped { addr });
        };
        Ok(match region.granules[((addr - base) / CAP_SIZE) as usize] {
            Granule::Cap(cap) => cap,
            Granule::Bytes(b) => {
                let mut low = [0u8; 8];
                low.copy_from_slice(&b[..8]);
                Capability::from_int(u64::from_le_bytes(low))
            }
        })
    }

    /// Write one capability-sized granule.
    pub(crate) fn write_cap(&mut self, addr: u64, value: Capability) -> Result<(), Fault> {
        if addr % CAP_SIZE != 0 {
            return Err(Fault::Alignment { addr });
        }
        self.check_range(addr, CAP_SIZE, Prot::WRITE)?;
        let page_size = self.page_size;
        let Some((base, region)) = self.locate_mut(addr) else {
            return Err(Fault::Unmapped { addr });
        };
        let off = addr - base;
        region.granules[(off / CAP_SIZE) as usize] = if value.is_valid() {
            Granule::Cap(value)
        } else {
            let mut raw = [0u8; CAP_SIZE as usize];
            raw[..8].copy_from_slice(&value.address().to_le_bytes());
            Granule::Bytes(raw)
        };
        region.pages[(off / page_size) as usize].stale = true;
        Ok(())
    }

    /// Fetch one instruction word.
    pub(crate) fn fetch(&self, addr: u64) -> Result<u32, Fault> {
        self.check_range(addr, 4, Prot::EXEC)?;
        let Some((base, region)) = self.locate(addr) else {
            return Err(Fault::Unmapped { addr });
        };
        if region.pages[((addr - base) / self.page_size) as usize].stale {
            return Err(Fault::StaleInstruction { addr });
        }
        let mut word = [0u8; 4];
        let off = addr - base;
        let granule = region.granules[(off / CAP_SIZE) as usize].bytes();
        let at = (off % CAP_SIZE) as usize;
        word.copy_from_slice(&granule[at..at + 4]);
        Ok(u32::from_le_bytes(word))
    }

    /// Every tagged capability currently stored in memory, with its address.
    pub fn stored_capabilities(&self) -> Vec<(u64, Capability)> {
        let mut out = Vec::new();
        for (base, region) in &self.regions {
            for (i, granule) in region.granules.iter().enumerate() {
                if let Granule::Cap(cap) = granule {
                    out.push((base + i as u64 * CAP_SIZE, *cap));
                }
            }
        }
        out
    }
}
