//! Multi-level table construction and mutation.
//!
//! All walks are driven by a [`TableKind`] descriptor so the same code can
//! serve table families with different presence encodings, large-page rules,
//! and cache-maintenance needs. Only the hypervisor's own kind ([`HostKind`])
//! exists here; a guest-facing kind plugs in by implementing the trait.

use keel_hal::{Platform, VmxCaps};
use thiserror::Error;

use crate::pool::PagePool;
use crate::{align_down, align_up, PageTableLevel, PteFlags, ENTRY_REF_MASK, PAGE_SIZE_4K, TABLE_ENTRIES};

/// Warnings about non-present entries are suppressed below this address;
/// the service OS rewrites attributes there whether mapped or not.
const MEM_1M: u64 = 0x10_0000;

/// Capability record for one family of tables.
///
/// The hooks default to no-ops, which is correct for the hypervisor's own
/// tables; guest-facing kinds override them for execute-permission games and
/// per-entry cache maintenance.
pub trait TableKind {
    /// Access bits stamped on newly created non-leaf entries.
    fn default_access(&self) -> PteFlags;

    /// May `level` hold a large-page leaf for a mapping with `prot`?
    fn large_page_supported(&self, level: PageTableLevel, prot: PteFlags) -> bool;

    /// Is this raw entry present?
    fn entry_present(&self, raw: u64) -> bool;

    /// Cache maintenance after an entry write.
    fn flush_entry(&self, platform: &dyn Platform, entry_hva: usize) {
        let _ = (platform, entry_hva);
    }

    /// Adjust execute permission on attributes for a new non-leaf entry.
    fn tweak_exe_right(&self, flags: &mut u64) {
        let _ = flags;
    }

    /// Undo [`TableKind::tweak_exe_right`] on leaf attributes recovered while
    /// splitting a large page.
    fn recover_exe_right(&self, flags: &mut u64) {
        let _ = flags;
    }
}

/// Descriptor for the hypervisor's own identity-mapped tables.
pub struct HostKind {
    caps: VmxCaps,
}

impl HostKind {
    pub fn new(caps: VmxCaps) -> Self {
        Self { caps }
    }
}

impl TableKind for HostKind {
    fn default_access(&self) -> PteFlags {
        PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER
    }

    fn large_page_supported(&self, level: PageTableLevel, _prot: PteFlags) -> bool {
        // 2 MiB leaves always work; 1 GiB only where the processor honors
        // them (the same probe gates both table families).
        match level {
            PageTableLevel::Pd => true,
            PageTableLevel::Pdpt => self.caps.contains(VmxCaps::EPT_1GB_PAGE),
            _ => false,
        }
    }

    fn entry_present(&self, raw: u64) -> bool {
        raw & PteFlags::PRESENT.bits() != 0
    }
}

/// Top-level table of one address space; created once, mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingRoot(u64);

impl PagingRoot {
    #[inline]
    pub fn hpa(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("page-table node pool exhausted")]
    PoolExhausted,
}

/// Whether `modify_or_delete_map` rewrites attributes or removes mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    Modify,
    Delete,
}

/// One family of page tables plus the pool its nodes come from.
///
/// Mutation requires `&mut self`; keeping one mutator per table family is the
/// caller's concurrency contract, checked here by the borrow rules.
pub struct PageTables<K: TableKind> {
    pool: PagePool,
    kind: K,
    sanitized_hpa: u64,
}

impl<K: TableKind> PageTables<K> {
    /// `sanitized_hpa` is the shared never-writable page that removed or
    /// not-yet-used entries point at; zero means "point removed entries at
    /// nothing".
    pub fn new(pool: PagePool, kind: K, sanitized_hpa: u64) -> Self {
        Self {
            pool,
            kind,
            sanitized_hpa,
        }
    }

    #[inline]
    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    #[inline]
    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Allocates and sanitizes a new top-level table.
    pub fn create_root<P: Platform>(&mut self, platform: &P) -> Result<PagingRoot, MapError> {
        let hpa = self.pool.allocate_page().ok_or(MapError::PoolExhausted)?;
        self.sanitize_table(platform, hpa);
        Ok(PagingRoot(hpa))
    }

    /// Maps `[vaddr, vaddr + size)` to `[paddr, ...)` with `prot` on the leaf
    /// entries, building intermediate tables on demand and using large-page
    /// leaves wherever the kind allows and alignment permits.
    ///
    /// Base addresses and size must be 4 KiB aligned; existing mappings in
    /// the range are logged and left untouched, not replaced.
    pub fn add_map<P: Platform>(
        &mut self,
        platform: &P,
        root: PagingRoot,
        paddr: u64,
        vaddr: u64,
        size: u64,
        prot: PteFlags,
    ) -> Result<(), MapError> {
        debug_assert_eq!(paddr % PAGE_SIZE_4K, 0);
        debug_assert_eq!(vaddr % PAGE_SIZE_4K, 0);
        debug_assert_eq!(size % PAGE_SIZE_4K, 0);
        log::debug!(
            "add_map: va {:#x}..{:#x} -> pa {:#x}",
            vaddr,
            vaddr + size,
            paddr
        );
        self.map_range(
            platform,
            root.hpa(),
            PageTableLevel::Pml4,
            paddr,
            vaddr,
            vaddr + size,
            prot,
        )
    }

    /// ORs `prot_set` and clears `prot_clr` over every mapped entry in the
    /// range (`Modify`), or removes the range and returns emptied tables to
    /// the pool (`Delete`). Large pages covered only partially are split
    /// first.
    pub fn modify_or_delete_map<P: Platform>(
        &mut self,
        platform: &P,
        root: PagingRoot,
        vaddr_base: u64,
        size: u64,
        prot_set: PteFlags,
        prot_clr: PteFlags,
        op: MapOp,
    ) -> Result<(), MapError> {
        let vaddr = align_up(vaddr_base, PAGE_SIZE_4K);
        let vaddr_end = vaddr + align_down(size, PAGE_SIZE_4K);
        self.modify_range(
            platform,
            root.hpa(),
            PageTableLevel::Pml4,
            vaddr,
            vaddr_end,
            prot_set,
            prot_clr,
            op,
        )
    }

    /// Walks the tables for `addr`, returning the raw leaf entry and the
    /// leaf's page size.
    pub fn lookup(&self, root: PagingRoot, addr: u64) -> Option<(u64, u64)> {
        let mut table_hpa = root.hpa();
        let mut level = PageTableLevel::Pml4;
        loop {
            let raw = self.pool.page(table_hpa).0[level.index(addr)];
            if !self.kind.entry_present(raw) {
                return None;
            }
            match level.next() {
                None => return Some((raw, level.entry_size())),
                Some(next) => {
                    if raw & PteFlags::PAGE_SIZE.bits() != 0 {
                        return Some((raw, level.entry_size()));
                    }
                    table_hpa = raw & ENTRY_REF_MASK;
                    level = next;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn map_range<P: Platform>(
        &mut self,
        platform: &P,
        table_hpa: u64,
        level: PageTableLevel,
        mut paddr: u64,
        mut vaddr: u64,
        vaddr_end: u64,
        prot: PteFlags,
    ) -> Result<(), MapError> {
        let span = level.entry_size();
        let mut index = level.index(vaddr);
        while index < TABLE_ENTRIES && vaddr < vaddr_end {
            let vaddr_next = (vaddr & !(span - 1)) + span;
            let raw = self.pool.page(table_hpa).0[index];
            match level.next() {
                None => {
                    if self.kind.entry_present(raw) {
                        log::error!("add_map: entry at {:#x} is already present", vaddr);
                    } else {
                        self.set_entry(platform, table_hpa, index, paddr | prot.bits());
                    }
                }
                Some(child_level) => {
                    let large_leaf_fits = !self.kind.entry_present(raw)
                        && self.kind.large_page_supported(level, prot)
                        && paddr % span == 0
                        && vaddr % span == 0
                        && vaddr_next <= vaddr_end;
                    if raw & PteFlags::PAGE_SIZE.bits() != 0 {
                        log::error!("add_map: large entry at {:#x} is already present", vaddr);
                    } else if large_leaf_fits {
                        self.set_entry(
                            platform,
                            table_hpa,
                            index,
                            paddr | (prot | PteFlags::PAGE_SIZE).bits(),
                        );
                    } else {
                        let child = if self.kind.entry_present(raw) {
                            raw & ENTRY_REF_MASK
                        } else {
                            let page =
                                self.pool.allocate_page().ok_or(MapError::PoolExhausted)?;
                            self.construct_entry(platform, table_hpa, index, page);
                            page
                        };
                        self.map_range(
                            platform,
                            child,
                            child_level,
                            paddr,
                            vaddr,
                            vaddr_end.min(vaddr_next),
                            prot,
                        )?;
                    }
                }
            }
            paddr += vaddr_next - vaddr;
            vaddr = vaddr_next;
            index += 1;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_range<P: Platform>(
        &mut self,
        platform: &P,
        table_hpa: u64,
        level: PageTableLevel,
        vaddr_start: u64,
        vaddr_end: u64,
        prot_set: PteFlags,
        prot_clr: PteFlags,
        op: MapOp,
    ) -> Result<(), MapError> {
        let span = level.entry_size();
        let mut vaddr = vaddr_start;
        let mut index = level.index(vaddr);
        while index < TABLE_ENTRIES && vaddr < vaddr_end {
            let vaddr_next = (vaddr & !(span - 1)) + span;
            let raw = self.pool.page(table_hpa).0[index];
            match level.next() {
                None => {
                    if !self.kind.entry_present(raw) {
                        if op == MapOp::Modify && vaddr >= MEM_1M {
                            log::warn!("modify: entry at {:#x} is not present", vaddr);
                        }
                    } else {
                        self.update_entry(platform, table_hpa, index, raw, prot_set, prot_clr, op);
                    }
                }
                Some(child_level) => {
                    if !self.kind.entry_present(raw) {
                        if op == MapOp::Modify {
                            log::warn!("modify: table at {:#x} is not present", vaddr);
                        }
                    } else {
                        let mut raw = raw;
                        let mut descend = true;
                        if raw & PteFlags::PAGE_SIZE.bits() != 0 {
                            if vaddr_next > vaddr_end || vaddr % span != 0 {
                                self.split_large_page(platform, table_hpa, index, level)?;
                                raw = self.pool.page(table_hpa).0[index];
                            } else {
                                self.update_entry(
                                    platform, table_hpa, index, raw, prot_set, prot_clr, op,
                                );
                                descend = false;
                            }
                        }
                        if descend {
                            let child = raw & ENTRY_REF_MASK;
                            self.modify_range(
                                platform,
                                child,
                                child_level,
                                vaddr,
                                vaddr_end.min(vaddr_next),
                                prot_set,
                                prot_clr,
                                op,
                            )?;
                            if op == MapOp::Delete && self.table_empty(child) {
                                self.pool.free_page(child);
                                self.set_entry(platform, table_hpa, index, self.sanitized_hpa);
                            }
                        }
                    }
                }
            }
            vaddr = vaddr_next;
            index += 1;
        }
        Ok(())
    }

    /// Replaces the large-page leaf at `table_hpa[index]` with a child table
    /// reproducing the same translation at the next-smaller page size.
    ///
    /// The stale large-page translation survives in TLBs until the caller
    /// invalidates.
    fn split_large_page<P: Platform>(
        &mut self,
        platform: &P,
        table_hpa: u64,
        index: usize,
        level: PageTableLevel,
    ) -> Result<(), MapError> {
        let child_level = match level.next() {
            Some(next) => next,
            None => return Ok(()),
        };
        let raw = self.pool.page(table_hpa).0[index];
        let frame_mask = ENTRY_REF_MASK & !(level.entry_size() - 1);
        let ref_paddr = raw & frame_mask;
        let mut ref_prot = raw & !frame_mask;
        if child_level == PageTableLevel::Pt {
            ref_prot &= !PteFlags::PAGE_SIZE.bits();
            self.kind.recover_exe_right(&mut ref_prot);
        }
        let child = self.pool.allocate_page().ok_or(MapError::PoolExhausted)?;
        let mut paddr = ref_paddr;
        for i in 0..TABLE_ENTRIES {
            self.set_entry(platform, child, i, paddr | ref_prot);
            paddr += child_level.entry_size();
        }
        let mut access = self.kind.default_access().bits();
        self.kind.tweak_exe_right(&mut access);
        self.set_entry(platform, table_hpa, index, child | access);
        Ok(())
    }

    fn update_entry<P: Platform>(
        &mut self,
        platform: &P,
        table_hpa: u64,
        index: usize,
        raw: u64,
        prot_set: PteFlags,
        prot_clr: PteFlags,
        op: MapOp,
    ) {
        match op {
            MapOp::Modify => {
                let new = (raw & !prot_clr.bits()) | prot_set.bits();
                self.set_entry(platform, table_hpa, index, new);
            }
            MapOp::Delete => {
                self.set_entry(platform, table_hpa, index, self.sanitized_hpa);
            }
        }
    }

    fn construct_entry<P: Platform>(
        &mut self,
        platform: &P,
        table_hpa: u64,
        index: usize,
        child_hpa: u64,
    ) {
        self.sanitize_table(platform, child_hpa);
        let mut access = self.kind.default_access().bits();
        self.kind.tweak_exe_right(&mut access);
        self.set_entry(platform, table_hpa, index, child_hpa | access);
    }

    /// Points every entry of `table_hpa` at the sanitized page.
    fn sanitize_table<P: Platform>(&mut self, platform: &P, table_hpa: u64) {
        for i in 0..TABLE_ENTRIES {
            self.set_entry(platform, table_hpa, i, self.sanitized_hpa);
        }
    }

    fn table_empty(&self, table_hpa: u64) -> bool {
        self.pool
            .page(table_hpa)
            .0
            .iter()
            .all(|&raw| !self.kind.entry_present(raw))
    }

    fn set_entry<P: Platform>(&mut self, platform: &P, table_hpa: u64, index: usize, value: u64) {
        self.pool.page_mut(table_hpa).0[index] = value;
        let entry_hva = &self.pool.page(table_hpa).0[index] as *const u64 as usize;
        self.kind.flush_entry(platform, entry_hva);
    }
}
