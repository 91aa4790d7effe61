//! The hypervisor's own page tables: node pool, multi-level table
//! construction and mutation, translation-cache invalidation, and the boot
//! sequence that switches the processor onto the new tables.
//!
//! Table layouts are x86-style 4-level with 512 entries per node. Which
//! levels may hold large-page leaves, what a "present" entry means, and any
//! per-entry flush requirement are questions answered by a [`TableKind`]
//! descriptor, so a second (guest-facing) kind can be added without touching
//! the walk code.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

mod mmu;
mod pool;
mod table;

pub use mmu::{
    enable_paging, flush_address_space, flush_vpid_global, flush_vpid_single, init_paging,
    init_sanitized_page, invept, HostPaging,
};
pub use pool::{PagePool, TablePage};
pub use table::{HostKind, MapError, MapOp, PageTables, PagingRoot, TableKind};


pub const PAGE_SIZE_4K: u64 = 1 << 12;
pub const PAGE_SIZE_2M: u64 = 1 << 21;
pub const PAGE_SIZE_1G: u64 = 1 << 30;

/// Entries per table node at every level.
pub const TABLE_ENTRIES: usize = 512;

/// Frame bits of an entry (51:12); everything else is attributes.
pub const ENTRY_REF_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Attribute bits of a table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Large-page leaf at the directory levels.
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NX = 1 << 63;
    }
}

impl PteFlags {
    /// Boot-time identity-map attributes: full access, data-only until the
    /// code section is re-widened.
    #[inline]
    pub fn map_default() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER | Self::NX
    }

    /// Write-back cacheable (no attribute bits set).
    #[inline]
    pub fn cache_wb() -> Self {
        Self::empty()
    }

    /// Strongly uncacheable.
    #[inline]
    pub fn cache_uc() -> Self {
        Self::PCD | Self::PWT
    }
}

pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub(crate) const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// The four levels of a 4-level table, top-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl PageTableLevel {
    /// Bit position of this level's index field within an address.
    #[inline]
    pub fn shift(self) -> u32 {
        match self {
            PageTableLevel::Pml4 => 39,
            PageTableLevel::Pdpt => 30,
            PageTableLevel::Pd => 21,
            PageTableLevel::Pt => 12,
        }
    }

    /// Bytes covered by a single entry at this level.
    #[inline]
    pub fn entry_size(self) -> u64 {
        1u64 << self.shift()
    }

    /// Index of `addr` within a node at this level.
    #[inline]
    pub fn index(self, addr: u64) -> usize {
        ((addr >> self.shift()) as usize) & (TABLE_ENTRIES - 1)
    }

    /// The level one step down, or `None` at the bottom.
    #[inline]
    pub fn next(self) -> Option<PageTableLevel> {
        match self {
            PageTableLevel::Pml4 => Some(PageTableLevel::Pdpt),
            PageTableLevel::Pdpt => Some(PageTableLevel::Pd),
            PageTableLevel::Pd => Some(PageTableLevel::Pt),
            PageTableLevel::Pt => None,
        }
    }
}
