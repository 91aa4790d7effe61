//! Bare-metal x86_64 implementation of [`Platform`].
//!
//! Every method here is a thin wrapper over one privileged instruction, so
//! the rest of the workspace never names a register or an opcode. The
//! processor must be in VMX root operation at ring 0 before any of this runs;
//! [`X86Platform::new`] is `unsafe` to record that requirement once instead
//! of per call.

use core::arch::asm;

use crate::{CpuOnlineMap, EptScope, Platform, VmxCaps, VmxFail, VpidScope};

const MSR_IA32_EFER: u32 = 0xC000_0080;
const MSR_IA32_TSC_AUX: u32 = 0xC000_0103;
const MSR_IA32_VMX_EPT_VPID_CAP: u32 = 0x048C;
const MSR_X2APIC_ICR: u32 = 0x0830;

// IA32_VMX_EPT_VPID_CAP bits of interest.
const CAP_EPT_1GB_PAGE: u64 = 1 << 17;
const CAP_INVEPT_SINGLE: u64 = 1 << 25;
const CAP_INVEPT_ALL: u64 = 1 << 26;
const CAP_INVVPID: u64 = 1 << 32;

/// 128-bit operand for `invvpid`. The id occupies the low 16 bits; the rest
/// of the first word is reserved and must be zero.
#[repr(C, align(16))]
struct InvvpidDescriptor {
    vpid: u64,
    gva: u64,
}

/// 128-bit operand for `invept`.
#[repr(C, align(16))]
struct InveptDescriptor {
    eptp: u64,
    reserved: u64,
}

pub struct X86Platform {
    online: &'static CpuOnlineMap,
    caps: VmxCaps,
}

impl X86Platform {
    /// Probes invalidation capabilities and binds the online map maintained
    /// by core bring-up.
    ///
    /// # Safety
    ///
    /// The caller must guarantee ring-0 execution with VMX enabled on every
    /// core that will use the returned value, and that `IA32_TSC_AUX` holds
    /// each core's id (set during bring-up).
    pub unsafe fn new(online: &'static CpuOnlineMap) -> Self {
        let raw = rdmsr(MSR_IA32_VMX_EPT_VPID_CAP);
        let mut caps = VmxCaps::empty();
        if raw & CAP_EPT_1GB_PAGE != 0 {
            caps |= VmxCaps::EPT_1GB_PAGE;
        }
        if raw & CAP_INVEPT_SINGLE != 0 {
            caps |= VmxCaps::INVEPT_SINGLE_CONTEXT;
        }
        if raw & CAP_INVEPT_ALL != 0 {
            caps |= VmxCaps::INVEPT_ALL_CONTEXT;
        }
        if raw & CAP_INVVPID != 0 {
            caps |= VmxCaps::INVVPID;
        }
        Self { online, caps }
    }
}

impl Platform for X86Platform {
    fn cpu_id(&self) -> u16 {
        // Bring-up stores the core id in IA32_TSC_AUX.
        // Safety: rdmsr of a valid MSR at ring 0.
        (unsafe { rdmsr(MSR_IA32_TSC_AUX) }) as u16
    }

    fn cpu_online(&self, cpu: u16) -> bool {
        self.online.is_online(cpu)
    }

    fn send_swi(&self, cpu: u16, vector: u8) {
        // Fixed delivery through the x2APIC ICR; destination in the high
        // word. Core ids map 1:1 onto x2APIC ids (flat topology).
        let icr = ((cpu as u64) << 32) | vector as u64;
        // Safety: x2APIC is enabled before any core comes online.
        unsafe { wrmsr(MSR_X2APIC_ICR, icr) };
    }

    fn clflush(&self, hva: usize) {
        // Safety: flushing any mapped byte is architecturally harmless.
        unsafe {
            asm!("clflushopt [{0}]", in(reg) hva, options(nostack, preserves_flags));
        }
    }

    fn vmx_caps(&self) -> VmxCaps {
        self.caps
    }

    fn invvpid(&self, scope: VpidScope, vpid: u16, gva: u64) -> Result<(), VmxFail> {
        let desc = InvvpidDescriptor {
            vpid: vpid as u64,
            gva,
        };
        let cf: u8;
        let zf: u8;
        // Safety: VMX root operation; the descriptor lives on the stack for
        // the duration of the instruction.
        unsafe {
            asm!(
                "invvpid {ty}, [{desc}]",
                "setc {cf}",
                "setz {zf}",
                ty = in(reg) scope as u64,
                desc = in(reg) &desc as *const InvvpidDescriptor,
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        decode_vmfail(cf, zf)
    }

    fn invept(&self, scope: EptScope, eptp: u64) -> Result<(), VmxFail> {
        let desc = InveptDescriptor { eptp, reserved: 0 };
        let cf: u8;
        let zf: u8;
        // Safety: as for invvpid.
        unsafe {
            asm!(
                "invept {ty}, [{desc}]",
                "setc {cf}",
                "setz {zf}",
                ty = in(reg) scope as u64,
                desc = in(reg) &desc as *const InveptDescriptor,
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        decode_vmfail(cf, zf)
    }

    fn read_cr0(&self) -> u64 {
        let value: u64;
        // Safety: CR reads are side-effect free at ring 0.
        unsafe {
            asm!("mov {0}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn write_cr0(&self, value: u64) {
        // Safety: the caller picked the bits; this is the designated seam
        // for control-register updates.
        unsafe {
            asm!("mov cr0, {0}", in(reg) value, options(nomem, nostack, preserves_flags));
        }
    }

    fn write_cr3(&self, value: u64) {
        // Safety: as for write_cr0. Also serializes and flushes non-global
        // TLB entries on this core.
        unsafe {
            asm!("mov cr3, {0}", in(reg) value, options(nomem, nostack, preserves_flags));
        }
    }

    fn read_efer(&self) -> u64 {
        // Safety: rdmsr of a valid MSR at ring 0.
        unsafe { rdmsr(MSR_IA32_EFER) }
    }

    fn write_efer(&self, value: u64) {
        // Safety: as for read_efer.
        unsafe { wrmsr(MSR_IA32_EFER, value) };
    }
}

/// Maps the carry/zero flag outcome of a VMX instruction to a result.
#[inline]
fn decode_vmfail(cf: u8, zf: u8) -> Result<(), VmxFail> {
    if cf != 0 {
        Err(VmxFail::InvalidOperand)
    } else if zf != 0 {
        Err(VmxFail::Failed)
    } else {
        Ok(())
    }
}

#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    asm!(
        "rdmsr",
        in("ecx") msr,
        out("eax") lo,
        out("edx") hi,
        options(nomem, nostack, preserves_flags),
    );
    ((hi as u64) << 32) | lo as u64
}

#[inline]
unsafe fn wrmsr(msr: u32, value: u64) {
    asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") value as u32,
        in("edx") (value >> 32) as u32,
        options(nomem, nostack, preserves_flags),
    );
}
