//! Access to memory owned by a running guest.
//!
//! Two layers live here:
//!
//! - a software walk of the guest's own page tables ([`gva2gpa`]), needed
//!   whenever the hypervisor must interpret a guest-virtual pointer (page
//!   faults, instruction operands, hypercall arguments);
//! - chunked bulk copies between hypervisor buffers and guest memory, by
//!   guest-physical ([`copy_from_gpa`]/[`copy_to_gpa`]) or guest-virtual
//!   ([`copy_from_gva`]/[`copy_to_gva`]) address.
//!
//! Everything in the guest's tables is attacker-controlled, so the walk
//! treats every entry as hostile: unmapped table bases, missing entries, and
//! permission violations all surface as faults for the caller to inject, and
//! nothing here ever dereferences guest-chosen addresses directly. Actual
//! byte access goes through the [`GuestMemory`] trait, implemented by the
//! second-stage translation owner.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

mod access;
mod walk;

pub use access::{copy_from_gpa, copy_from_gva, copy_to_gpa, copy_to_gva, AccessError};
pub use walk::{gva2gpa, PageFault, PageFaultCode};

#[cfg(test)]
mod tests;

pub const PAGE_SIZE_4K: u64 = 1 << 12;

pub const CR0_PG: u64 = 1 << 31;
pub const CR0_WP: u64 = 1 << 16;
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_SMEP: u64 = 1 << 20;
pub const CR4_SMAP: u64 = 1 << 21;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;
pub const RFLAGS_AC: u64 = 1 << 18;

/// Guest page-table entry bits consumed by the walk.
pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_PS: u64 = 1 << 7;

/// Frame bits of an entry (51:12); also applied to carried table bases.
pub const ENTRY_REF_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Result of a second-stage lookup for one guest-physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMapping {
    /// Host-physical address of the queried byte itself.
    pub hpa: u64,
    /// Size of the backing leaf mapping, a power of two of at least 4 KiB;
    /// the mapping is contiguous from the containing boundary.
    pub page_size: u64,
}

/// Second-stage translation and host byte access, implemented by the owner
/// of the guest's extended page tables.
pub trait GuestMemory {
    /// Resolves one guest-physical address, or `None` for unmapped space.
    fn gpa2hpa(&mut self, gpa: u64) -> Option<HostMapping>;

    fn read_u8(&mut self, hpa: u64) -> u8;
    fn write_u8(&mut self, hpa: u64, value: u8);

    /// Read a byte slice from resolved host memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`GuestMemory::read_u8`]; backends with directly addressable storage
    /// should override it.
    #[inline]
    fn read_bytes(&mut self, hpa: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(hpa.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to resolved host memory.
    ///
    /// Defaults to byte-at-a-time writes via [`GuestMemory::write_u8`].
    #[inline]
    fn write_bytes(&mut self, hpa: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(hpa.wrapping_add(i as u64), byte);
        }
    }

    #[inline]
    fn read_u32(&mut self, hpa: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_bytes(hpa, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    #[inline]
    fn read_u64(&mut self, hpa: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_bytes(hpa, &mut bytes);
        u64::from_le_bytes(bytes)
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for &mut T {
    #[inline]
    fn gpa2hpa(&mut self, gpa: u64) -> Option<HostMapping> {
        (**self).gpa2hpa(gpa)
    }

    #[inline]
    fn read_u8(&mut self, hpa: u64) -> u8 {
        (**self).read_u8(hpa)
    }

    #[inline]
    fn write_u8(&mut self, hpa: u64, value: u8) {
        (**self).write_u8(hpa, value)
    }

    #[inline]
    fn read_bytes(&mut self, hpa: u64, dst: &mut [u8]) {
        (**self).read_bytes(hpa, dst)
    }

    #[inline]
    fn write_bytes(&mut self, hpa: u64, src: &[u8]) {
        (**self).write_bytes(hpa, src)
    }

    #[inline]
    fn read_u32(&mut self, hpa: u64) -> u32 {
        (**self).read_u32(hpa)
    }

    #[inline]
    fn read_u64(&mut self, hpa: u64) -> u64 {
        (**self).read_u64(hpa)
    }
}

/// Control-register snapshot of the vcpu on whose behalf a walk runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagingRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub rflags: u64,
    /// Current privilege level; 3 is user mode.
    pub cpl: u8,
}

/// Active translation scheme, derived from the control registers once per
/// walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Paging off; guest-physical equals guest-virtual.
    Disabled,
    /// Two levels of 10-bit indices, 32-bit entries.
    Legacy32,
    /// A 4-entry top directory over two standard levels.
    Pae,
    /// Four levels of 9-bit indices.
    Long4,
}

impl PagingMode {
    pub fn from_registers(regs: &PagingRegisters) -> Self {
        if regs.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if regs.efer & EFER_LMA != 0 {
            PagingMode::Long4
        } else if regs.cr4 & CR4_PAE != 0 {
            PagingMode::Pae
        } else {
            PagingMode::Legacy32
        }
    }
}
