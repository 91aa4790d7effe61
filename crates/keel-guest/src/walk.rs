//! Software walk of the guest's own page tables.

use bitflags::bitflags;
use thiserror::Error;

use crate::{
    GuestMemory, PagingMode, PagingRegisters, CR0_WP, CR4_PSE, CR4_SMAP, CR4_SMEP, EFER_NXE,
    ENTRY_REF_MASK, PTE_P, PTE_PS, PTE_RW, PTE_US, RFLAGS_AC,
};

bitflags! {
    /// Architectural page-fault error-code bits.
    ///
    /// The code is an in/out parameter: the caller seeds [`WR`] and [`ID`]
    /// to describe the access, the walk clears [`P`] on entry and sets it on
    /// any fault, and [`US`] is added when the faulting access came from
    /// user mode. What remains is ready to inject.
    ///
    /// [`WR`]: PageFaultCode::WR
    /// [`ID`]: PageFaultCode::ID
    /// [`P`]: PageFaultCode::P
    /// [`US`]: PageFaultCode::US
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// Set when the fault arose from a walk, clear for a missing top
        /// directory entry.
        const P = 1 << 0;
        /// The access was a write.
        const WR = 1 << 1;
        /// The access came from user mode.
        const US = 1 << 2;
        /// A reserved bit was set in an entry.
        const RSVD = 1 << 3;
        /// The access was an instruction fetch.
        const ID = 1 << 4;
    }
}

/// A faulting guest translation.
///
/// The error-code bits travel in the caller-supplied [`PageFaultCode`];
/// `gpa` carries the completed translation when the walk itself succeeded
/// and only a post-walk permission check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest page fault")]
pub struct PageFault {
    pub gpa: Option<u64>,
}

/// Parameters of one walk, fixed for its duration.
#[derive(Debug)]
struct WalkContext {
    /// Table base (or carried entry) the next level starts from.
    top_entry: u64,
    /// Remaining levels; strictly decreases to zero.
    level: u32,
    /// Index bits consumed per level; 10 selects 32-bit entries.
    width: u32,
    user_access: bool,
    write_access: bool,
    inst_fetch: bool,
    pse: bool,
    wp: bool,
    /// Carried for mode parity; no-execute is not enforced by this walk.
    nxe: bool,
    smap: bool,
    smep: bool,
    ac: bool,
}

/// Translates one guest-virtual address through the guest's live tables.
///
/// On success the guest-physical address comes back with no fault bits
/// added. On a fault the error carries a best-effort translation where one
/// exists and `err_code` holds the architectural bits per the
/// [`PageFaultCode`] protocol; the caller decides whether to inject.
pub fn gva2gpa<M: GuestMemory>(
    mem: &mut M,
    regs: &PagingRegisters,
    gva: u64,
    err_code: &mut PageFaultCode,
) -> Result<u64, PageFault> {
    let user_access = regs.cpl == 3;
    let mut ctx = WalkContext {
        top_entry: regs.cr3,
        level: 0,
        width: 9,
        user_access,
        write_access: err_code.contains(PageFaultCode::WR),
        inst_fetch: err_code.contains(PageFaultCode::ID),
        pse: true,
        wp: regs.cr0 & CR0_WP != 0,
        nxe: regs.efer & EFER_NXE != 0,
        smap: regs.cr4 & CR4_SMAP != 0,
        smep: regs.cr4 & CR4_SMEP != 0,
        ac: regs.rflags & RFLAGS_AC != 0,
    };

    err_code.remove(PageFaultCode::P);

    let result = match PagingMode::from_registers(regs) {
        PagingMode::Disabled => Ok(gva),
        PagingMode::Long4 => {
            ctx.level = 4;
            walk_common(mem, &ctx, gva, err_code)
        }
        PagingMode::Pae => {
            ctx.level = 2;
            walk_pae(mem, &mut ctx, gva, err_code)
        }
        PagingMode::Legacy32 => {
            ctx.level = 2;
            ctx.width = 10;
            ctx.pse = regs.cr4 & CR4_PSE != 0;
            ctx.nxe = false;
            walk_common(mem, &ctx, gva, err_code)
        }
    };

    if result.is_err() && user_access {
        *err_code |= PageFaultCode::US;
    }
    result
}

/// The 4-entry top directory of PAE mode, checked for presence only, then
/// the common loop from the middle level down.
fn walk_pae<M: GuestMemory>(
    mem: &mut M,
    ctx: &mut WalkContext,
    gva: u64,
    err_code: &mut PageFaultCode,
) -> Result<u64, PageFault> {
    let base = ctx.top_entry & 0xFFFF_FFE0;
    let mapping = mem.gpa2hpa(base).ok_or(PageFault { gpa: None })?;
    let index = (gva >> 30) & 0x3;
    let entry = mem.read_u64(mapping.hpa + index * 8);
    if entry & PTE_P == 0 {
        // A missing top directory entry reports no P bit, unlike faults
        // inside the common loop.
        return Err(PageFault { gpa: None });
    }
    ctx.top_entry = entry;
    walk_common(mem, ctx, gva, err_code)
}

fn walk_common<M: GuestMemory>(
    mem: &mut M,
    ctx: &WalkContext,
    gva: u64,
    err_code: &mut PageFaultCode,
) -> Result<u64, PageFault> {
    let mut addr = ctx.top_entry;
    let mut entry = 0u64;
    let mut shift = 0u32;
    let mut level = ctx.level;
    let mut fault = false;
    // Both post-walk checks judge the finished path: whether it stayed
    // entirely inside user-accessible entries, and whether any entry on it
    // denied write.
    let mut user_mode_addr = true;
    let mut path_allows_write = true;

    while level != 0 && !fault {
        level -= 1;

        addr &= ENTRY_REF_MASK;
        shift = level * ctx.width + 12;
        let index = (gva >> shift) & ((1u64 << ctx.width) - 1);

        match mem.gpa2hpa(addr) {
            None => fault = true,
            Some(mapping) => {
                entry = if ctx.width == 10 {
                    u64::from(mem.read_u32(mapping.hpa + index * 4))
                } else {
                    mem.read_u64(mapping.hpa + index * 8)
                };

                if entry & PTE_P == 0 {
                    fault = true;
                }
                if !fault && entry & PTE_RW == 0 {
                    if ctx.write_access && (ctx.user_access || ctx.wp) {
                        fault = true;
                    }
                    path_allows_write = false;
                }
                if !fault && entry & PTE_US == 0 {
                    user_mode_addr = false;
                    if ctx.user_access {
                        fault = true;
                    }
                }
                if !fault && ctx.pse && level > 0 && entry & PTE_PS != 0 {
                    // Large-page leaf; the remaining index bits become
                    // offset bits.
                    break;
                }
                addr = entry;
            }
        }
    }

    if fault {
        *err_code |= PageFaultCode::P;
        return Err(PageFault { gpa: None });
    }

    let page_size = 1u64 << shift;
    let mut frame = entry >> shift;
    // One level further left and back to drop the no-execute and ignored
    // bits above the frame.
    frame <<= shift + 12;
    frame >>= 12;
    let gpa = frame | (gva & (page_size - 1));

    // Supervisor-mode restrictions on user-reachable addresses apply to the
    // whole path, so they run after the loop; a fault here still reports
    // the completed translation.
    let mut denied = false;
    if ctx.smap && !ctx.user_access && user_mode_addr && !ctx.inst_fetch {
        if !ctx.write_access && !ctx.ac {
            denied = true;
        } else if ctx.write_access {
            if !ctx.wp && !ctx.ac {
                denied = true;
            }
            if ctx.wp && ctx.ac && !path_allows_write {
                denied = true;
            }
        }
    }
    if !denied && ctx.smep && !ctx.user_access && user_mode_addr && ctx.inst_fetch {
        denied = true;
    }

    if denied {
        *err_code |= PageFaultCode::P;
        return Err(PageFault { gpa: Some(gpa) });
    }

    Ok(gpa)
}
