//! Platform abstraction for the privileged operations the memory core needs.
//!
//! Everything the paging and cross-core code must ask the hardware for goes
//! through the [`Platform`] trait: cache-line flushes, TLB/EPT invalidation
//! instructions, control-register and EFER access, and the minimal SMP
//! primitives (core id, online probe, software-interrupt send). The rest of
//! the workspace contains no inline machine code; the one bare-metal
//! implementation lives in [`x86`] behind `cfg(target_arch = "x86_64")`, and
//! tests substitute recording fakes.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use thiserror::Error;

#[cfg(target_arch = "x86_64")]
pub mod x86;

/// Highest supported core count; pending-call masks are one 64-bit word.
pub const MAX_CPUS: usize = 64;

/// Stride used when flushing a range of page-table memory from the cache.
pub const CACHE_LINE_SIZE: usize = 64;

/// EFER.NXE, enabling the No-Execute bit in page-table entries.
pub const EFER_NXE: u64 = 1 << 11;

/// CR0.WP, making supervisor writes honor read-only mappings.
pub const CR0_WP: u64 = 1 << 16;

bitflags! {
    /// Invalidation and large-page capabilities reported by the processor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmxCaps: u64 {
        /// 1 GiB leaf entries are honored by the second-stage walker.
        const EPT_1GB_PAGE = 1 << 0;
        /// Single-context INVEPT.
        const INVEPT_SINGLE_CONTEXT = 1 << 1;
        /// All-context INVEPT.
        const INVEPT_ALL_CONTEXT = 1 << 2;
        /// INVVPID in any scope.
        const INVVPID = 1 << 3;
    }
}

/// Scope operand for the VPID invalidation instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum VpidScope {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContext = 2,
}

/// Scope operand for the EPT invalidation instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum EptScope {
    SingleContext = 1,
    AllContext = 2,
}

/// Failure of a privileged invalidation instruction, decoded from the
/// processor flags it leaves behind.
///
/// Neither condition is recoverable by retrying; callers log and continue,
/// relying on the next full flush event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmxFail {
    /// The operand or scope was rejected (carry flag set).
    #[error("invalid invalidation operand")]
    InvalidOperand,
    /// The instruction failed with an error number (zero flag set).
    #[error("invalidation instruction failed")]
    Failed,
}

impl VmxFail {
    /// Numeric code kept for log parity with older tooling: 1 for an invalid
    /// operand, 2 for a reported failure.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            VmxFail::InvalidOperand => 1,
            VmxFail::Failed => 2,
        }
    }
}

/// One entry of the platform memory map, consumed during `init_paging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Ram,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
}

impl MemoryRegion {
    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Where the hypervisor image sits in physical memory.
///
/// `base..end` is narrowed to supervisor-only during `init_paging`;
/// `base..text_end` is the code section that stays executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub base: u64,
    pub end: u64,
    pub text_end: u64,
}

impl ImageLayout {
    #[inline]
    pub fn size(&self) -> u64 {
        self.end - self.base
    }
}

/// Per-core online state, one bit per core id.
///
/// Bring-up code (outside this workspace) sets a core's bit once the core can
/// take interrupts and clears it on offline; the dispatcher only reads it.
pub struct CpuOnlineMap(AtomicU64);

impl CpuOnlineMap {
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn set_online(&self, cpu: u16) {
        self.0.fetch_or(1 << cpu, Ordering::Release);
    }

    #[inline]
    pub fn set_offline(&self, cpu: u16) {
        self.0.fetch_and(!(1 << cpu), Ordering::Release);
    }

    #[inline]
    pub fn is_online(&self, cpu: u16) -> bool {
        self.0.load(Ordering::Acquire) & (1 << cpu) != 0
    }
}

impl Default for CpuOnlineMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The privileged-operation surface.
///
/// All methods take `&self`; implementations that need state use atomics or
/// interior mutability so a single instance can be shared by every core.
pub trait Platform {
    /// Id of the core executing the call.
    fn cpu_id(&self) -> u16;

    /// Whether `cpu` is online and able to take interrupts.
    fn cpu_online(&self, cpu: u16) -> bool;

    /// Sends the software interrupt `vector` to one core.
    fn send_swi(&self, cpu: u16, vector: u8);

    /// Sends `vector` to every core whose bit is set in `mask`.
    fn send_swi_mask(&self, mask: u64, vector: u8) {
        let mut remaining = mask;
        while remaining != 0 {
            let cpu = remaining.trailing_zeros() as u16;
            self.send_swi(cpu, vector);
            remaining &= remaining - 1;
        }
    }

    /// Pause hint for busy-wait loops.
    #[inline]
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Flushes the cache line containing `hva` to memory.
    fn clflush(&self, hva: usize);

    /// Invalidation and large-page support reported by the processor.
    fn vmx_caps(&self) -> VmxCaps;

    /// VPID invalidation. `gva` is consulted only for
    /// [`VpidScope::IndividualAddress`].
    fn invvpid(&self, scope: VpidScope, vpid: u16, gva: u64) -> Result<(), VmxFail>;

    /// EPT invalidation against the given extended-page-table pointer.
    fn invept(&self, scope: EptScope, eptp: u64) -> Result<(), VmxFail>;

    fn read_cr0(&self) -> u64;
    fn write_cr0(&self, value: u64);

    /// Installs a new paging root. Takes effect on the issuing core only.
    fn write_cr3(&self, value: u64);

    fn read_efer(&self) -> u64;
    fn write_efer(&self, value: u64);
}

impl<T: Platform + ?Sized> Platform for &T {
    #[inline]
    fn cpu_id(&self) -> u16 {
        (**self).cpu_id()
    }

    #[inline]
    fn cpu_online(&self, cpu: u16) -> bool {
        (**self).cpu_online(cpu)
    }

    #[inline]
    fn send_swi(&self, cpu: u16, vector: u8) {
        (**self).send_swi(cpu, vector)
    }

    #[inline]
    fn send_swi_mask(&self, mask: u64, vector: u8) {
        (**self).send_swi_mask(mask, vector)
    }

    #[inline]
    fn cpu_relax(&self) {
        (**self).cpu_relax()
    }

    #[inline]
    fn clflush(&self, hva: usize) {
        (**self).clflush(hva)
    }

    #[inline]
    fn vmx_caps(&self) -> VmxCaps {
        (**self).vmx_caps()
    }

    #[inline]
    fn invvpid(&self, scope: VpidScope, vpid: u16, gva: u64) -> Result<(), VmxFail> {
        (**self).invvpid(scope, vpid, gva)
    }

    #[inline]
    fn invept(&self, scope: EptScope, eptp: u64) -> Result<(), VmxFail> {
        (**self).invept(scope, eptp)
    }

    #[inline]
    fn read_cr0(&self) -> u64 {
        (**self).read_cr0()
    }

    #[inline]
    fn write_cr0(&self, value: u64) {
        (**self).write_cr0(value)
    }

    #[inline]
    fn write_cr3(&self, value: u64) {
        (**self).write_cr3(value)
    }

    #[inline]
    fn read_efer(&self) -> u64 {
        (**self).read_efer()
    }

    #[inline]
    fn write_efer(&self, value: u64) {
        (**self).write_efer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingSwi {
        sent: RefCell<Vec<u16>>,
    }

    impl Platform for RecordingSwi {
        fn cpu_id(&self) -> u16 {
            0
        }
        fn cpu_online(&self, _cpu: u16) -> bool {
            true
        }
        fn send_swi(&self, cpu: u16, _vector: u8) {
            self.sent.borrow_mut().push(cpu);
        }
        fn clflush(&self, _hva: usize) {}
        fn vmx_caps(&self) -> VmxCaps {
            VmxCaps::empty()
        }
        fn invvpid(&self, _s: VpidScope, _v: u16, _g: u64) -> Result<(), VmxFail> {
            Ok(())
        }
        fn invept(&self, _s: EptScope, _e: u64) -> Result<(), VmxFail> {
            Ok(())
        }
        fn read_cr0(&self) -> u64 {
            0
        }
        fn write_cr0(&self, _value: u64) {}
        fn write_cr3(&self, _value: u64) {}
        fn read_efer(&self) -> u64 {
            0
        }
        fn write_efer(&self, _value: u64) {}
    }

    #[test]
    fn swi_mask_hits_every_set_bit_once() {
        let p = RecordingSwi {
            sent: RefCell::new(Vec::new()),
        };
        p.send_swi_mask(0b1010_0101, 0x20);
        assert_eq!(*p.sent.borrow(), vec![0, 2, 5, 7]);
    }

    #[test]
    fn swi_mask_empty_sends_nothing() {
        let p = RecordingSwi {
            sent: RefCell::new(Vec::new()),
        };
        p.send_swi_mask(0, 0x20);
        assert!(p.sent.borrow().is_empty());
    }

    #[test]
    fn swi_mask_high_bit() {
        let p = RecordingSwi {
            sent: RefCell::new(Vec::new()),
        };
        p.send_swi_mask(1 << 63, 0x20);
        assert_eq!(*p.sent.borrow(), vec![63]);
    }

    #[test]
    fn online_map_tracks_bits() {
        let map = CpuOnlineMap::new();
        assert!(!map.is_online(3));
        map.set_online(3);
        map.set_online(0);
        assert!(map.is_online(3));
        assert!(map.is_online(0));
        map.set_offline(3);
        assert!(!map.is_online(3));
        assert!(map.is_online(0));
    }

    #[test]
    fn vmxfail_codes_match_flag_encoding() {
        assert_eq!(VmxFail::InvalidOperand.code(), 1);
        assert_eq!(VmxFail::Failed.code(), 2);
    }
}
