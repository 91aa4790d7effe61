//! Chunked bulk copies between hypervisor buffers and guest memory.
//!
//! Guest-physical ranges are not host-contiguous, so every copy proceeds one
//! resolved run at a time. The guest-virtual variants translate each chunk
//! through [`gva2gpa`] first and chunk at the guest's 4 KiB granularity
//! regardless of the host leaf size behind it.

use thiserror::Error;

use crate::walk::{gva2gpa, PageFaultCode};
use crate::{GuestMemory, PagingRegisters, PAGE_SIZE_4K};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    /// Zero-length request, or a guest-physical chunk with no mapping.
    #[error("invalid guest memory range")]
    InvalidArgument,
    /// A guest-virtual chunk failed to translate; `gva` is the first byte
    /// of the failing chunk and the details are in the caller's fault code.
    #[error("guest page fault at {gva:#x}")]
    PageFault { gva: u64 },
}

/// Host address for `gpa` and how many of `remaining` bytes fit before the
/// backing page ends.
fn resolve_chunk<M: GuestMemory>(
    mem: &mut M,
    gpa: u64,
    remaining: usize,
    fixed_page_size: Option<u64>,
) -> Result<(u64, usize), AccessError> {
    let mapping = match mem.gpa2hpa(gpa) {
        Some(mapping) => mapping,
        None => {
            log::error!("guest copy: gpa {:#x} is unmapped", gpa);
            return Err(AccessError::InvalidArgument);
        }
    };
    let page_size = fixed_page_size.unwrap_or(mapping.page_size);
    let offset = gpa & (page_size - 1);
    let len = ((page_size - offset) as usize).min(remaining);
    Ok((mapping.hpa, len))
}

/// Copies guest-physical memory into `dst`, resolving one run at a time.
pub fn copy_from_gpa<M: GuestMemory>(
    mem: &mut M,
    dst: &mut [u8],
    gpa: u64,
) -> Result<(), AccessError> {
    if dst.is_empty() {
        log::error!("guest copy: zero length");
        return Err(AccessError::InvalidArgument);
    }
    let mut gpa = gpa;
    let mut done = 0;
    while done < dst.len() {
        let (hpa, len) = resolve_chunk(mem, gpa, dst.len() - done, None)?;
        mem.read_bytes(hpa, &mut dst[done..done + len]);
        gpa += len as u64;
        done += len;
    }
    Ok(())
}

/// Copies `src` into guest-physical memory, resolving one run at a time.
pub fn copy_to_gpa<M: GuestMemory>(mem: &mut M, gpa: u64, src: &[u8]) -> Result<(), AccessError> {
    if src.is_empty() {
        log::error!("guest copy: zero length");
        return Err(AccessError::InvalidArgument);
    }
    let mut gpa = gpa;
    let mut done = 0;
    while done < src.len() {
        let (hpa, len) = resolve_chunk(mem, gpa, src.len() - done, None)?;
        mem.write_bytes(hpa, &src[done..done + len]);
        gpa += len as u64;
        done += len;
    }
    Ok(())
}

/// Copies guest-virtual memory into `dst`, translating chunk by chunk.
///
/// The caller seeds `err_code` as for [`gva2gpa`]. A failing chunk aborts
/// the copy with everything before it already transferred; the destination
/// is left partially written.
pub fn copy_from_gva<M: GuestMemory>(
    mem: &mut M,
    regs: &PagingRegisters,
    dst: &mut [u8],
    gva: u64,
    err_code: &mut PageFaultCode,
) -> Result<(), AccessError> {
    if dst.is_empty() {
        log::error!("guest copy: zero length");
        return Err(AccessError::InvalidArgument);
    }
    let mut gva = gva;
    let mut done = 0;
    while done < dst.len() {
        let gpa = translate_chunk(mem, regs, gva, err_code)?;
        let (hpa, len) = resolve_chunk(mem, gpa, dst.len() - done, Some(PAGE_SIZE_4K))?;
        mem.read_bytes(hpa, &mut dst[done..done + len]);
        gva += len as u64;
        done += len;
    }
    Ok(())
}

/// Copies `src` into guest-virtual memory, translating chunk by chunk.
///
/// Same contract as [`copy_from_gva`], including the accepted partial write
/// on a mid-copy fault.
pub fn copy_to_gva<M: GuestMemory>(
    mem: &mut M,
    regs: &PagingRegisters,
    gva: u64,
    src: &[u8],
    err_code: &mut PageFaultCode,
) -> Result<(), AccessError> {
    if src.is_empty() {
        log::error!("guest copy: zero length");
        return Err(AccessError::InvalidArgument);
    }
    let mut gva = gva;
    let mut done = 0;
    while done < src.len() {
        let gpa = translate_chunk(mem, regs, gva, err_code)?;
        let (hpa, len) = resolve_chunk(mem, gpa, src.len() - done, Some(PAGE_SIZE_4K))?;
        mem.write_bytes(hpa, &src[done..done + len]);
        gva += len as u64;
        done += len;
    }
    Ok(())
}

fn translate_chunk<M: GuestMemory>(
    mem: &mut M,
    regs: &PagingRegisters,
    gva: u64,
    err_code: &mut PageFaultCode,
) -> Result<u64, AccessError> {
    match gva2gpa(mem, regs, gva, err_code) {
        Ok(gpa) => Ok(gpa),
        Err(_) => {
            log::error!(
                "guest copy: translation fault at {:#x}, code {:#x}",
                gva,
                err_code.bits()
            );
            Err(AccessError::PageFault { gva })
        }
    }
}
