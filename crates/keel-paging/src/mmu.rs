//! Translation-cache invalidation and the boot-time paging bring-up.

use core::ops::Range;

use keel_hal::{
    EptScope, ImageLayout, MemoryRegion, MemoryRegionKind, Platform, VmxCaps, VpidScope,
    CACHE_LINE_SIZE, CR0_WP, EFER_NXE,
};

use crate::pool::{PagePool, TablePage};
use crate::table::{HostKind, MapError, MapOp, PageTables, PagingRoot};
use crate::{align_down, align_up, PteFlags, PAGE_SIZE_2M};

const MEM_4G: u64 = 1 << 32;

/// EPTP format: 4-level walk, write-back paging-structure memory type.
const EPTP_4LEVEL_WB: u64 = (3 << 3) | 6;

/// Fills the shared sanitized page: every entry holds the page's own
/// physical address with no attribute bits, so a walk that lands here reads
/// as non-present at every level.
pub fn init_sanitized_page(page: &mut TablePage, hpa: u64) {
    for entry in page.0.iter_mut() {
        *entry = hpa;
    }
}

/// Drops cached translations tagged with `vpid`. Id 0 is reserved for the
/// host and never invalidated this way.
pub fn flush_vpid_single<P: Platform>(platform: &P, vpid: u16) {
    if vpid == 0 {
        return;
    }
    if let Err(err) = platform.invvpid(VpidScope::SingleContext, vpid, 0) {
        log::debug!("invvpid single-context: error {}, vpid {}", err.code(), vpid);
    }
}

/// Drops cached translations for every vpid.
pub fn flush_vpid_global<P: Platform>(platform: &P) {
    if let Err(err) = platform.invvpid(VpidScope::AllContext, 0, 0) {
        log::debug!("invvpid all-context: error {}", err.code());
    }
}

/// Drops combined translations derived from the extended tables under
/// `root`: single-context where supported, otherwise all-context, otherwise
/// nothing (hardware without either does not need it).
pub fn invept<P: Platform>(platform: &P, root: PagingRoot) {
    let caps = platform.vmx_caps();
    if caps.contains(VmxCaps::INVEPT_SINGLE_CONTEXT) {
        let eptp = root.hpa() | EPTP_4LEVEL_WB;
        if let Err(err) = platform.invept(EptScope::SingleContext, eptp) {
            log::debug!("invept single-context: error {}, eptp {:#x}", err.code(), eptp);
        }
    } else if caps.contains(VmxCaps::INVEPT_ALL_CONTEXT) {
        if let Err(err) = platform.invept(EptScope::AllContext, 0) {
            log::debug!("invept all-context: error {}", err.code());
        }
    }
}

/// Writes every cache line of `[hva, hva + size)` back to memory.
pub fn flush_address_space<P: Platform>(platform: &P, hva: usize, size: usize) {
    let mut offset = 0;
    while offset < size {
        platform.clflush(hva + offset);
        offset += CACHE_LINE_SIZE;
    }
}

/// Switches the processor onto `root`. No-execute and write-protect
/// enforcement must be live before the root lands, so those control bits go
/// first.
pub fn enable_paging<P: Platform>(platform: &P, root: PagingRoot) {
    platform.write_efer(platform.read_efer() | EFER_NXE);
    platform.write_cr0(platform.read_cr0() | CR0_WP);
    platform.write_cr3(root.hpa());
}

/// The hypervisor's own identity map, built once by [`init_paging`] and
/// mutated in place afterwards.
pub struct HostPaging {
    tables: PageTables<HostKind>,
    root: PagingRoot,
}

impl HostPaging {
    #[inline]
    pub fn root(&self) -> PagingRoot {
        self.root
    }

    #[inline]
    pub fn tables(&self) -> &PageTables<HostKind> {
        &self.tables
    }

    #[inline]
    pub fn tables_mut(&mut self) -> &mut PageTables<HostKind> {
        &mut self.tables
    }
}

/// Builds the hypervisor's identity map and switches onto it.
///
/// RAM from `regions` is mapped write-back, the remainder of the low 4 GiB
/// and any `high_mmio` window uncacheable. The hypervisor image is then
/// narrowed to supervisor-only and its code section re-widened to
/// executable, all against the new tables before they are activated.
///
/// The sanitized page must stay resident for the lifetime of the tables;
/// `sanitized_hpa` is its physical address.
pub fn init_paging<P: Platform>(
    platform: &P,
    pool: PagePool,
    sanitized_page: &'static mut TablePage,
    sanitized_hpa: u64,
    regions: &[MemoryRegion],
    image: ImageLayout,
    high_mmio: Option<Range<u64>>,
) -> Result<HostPaging, MapError> {
    log::debug!("paging bring-up");

    init_sanitized_page(sanitized_page, sanitized_hpa);

    let mut tables = PageTables::new(pool, HostKind::new(platform.vmx_caps()), sanitized_hpa);
    let root = tables.create_root(platform)?;

    // Highest RAM byte below 4 GiB and above it; holes below the low bound
    // are swept into the write-back mapping wholesale.
    let mut low32_max_ram = 0u64;
    let mut high64_max_ram = MEM_4G;
    for region in regions {
        if region.kind == MemoryRegionKind::Ram {
            if region.end() < MEM_4G {
                low32_max_ram = low32_max_ram.max(region.end());
            } else {
                high64_max_ram = high64_max_ram.max(region.end());
            }
        }
    }
    let low32_max_ram = align_up(low32_max_ram, PAGE_SIZE_2M);
    let high64_max_ram = align_down(high64_max_ram, PAGE_SIZE_2M);

    let attr_ram = PteFlags::map_default() | PteFlags::cache_wb();
    let attr_uc = PteFlags::map_default() | PteFlags::cache_uc();

    tables.add_map(platform, root, 0, 0, low32_max_ram, attr_ram)?;
    if high64_max_ram > MEM_4G {
        tables.add_map(
            platform,
            root,
            MEM_4G,
            MEM_4G,
            high64_max_ram - MEM_4G,
            attr_ram,
        )?;
    }

    if low32_max_ram < MEM_4G {
        tables.add_map(
            platform,
            root,
            low32_max_ram,
            low32_max_ram,
            MEM_4G - low32_max_ram,
            attr_uc,
        )?;
    }
    if let Some(window) = high_mmio {
        tables.add_map(
            platform,
            root,
            window.start,
            window.start,
            window.end - window.start,
            attr_uc,
        )?;
    }

    // Narrow the image to supervisor-only, rounded outward to the 2 MiB
    // granule it sits in.
    let image_aligned = align_down(image.base, PAGE_SIZE_2M);
    let narrow_size = image.size()
        + if image.base % PAGE_SIZE_2M != 0 {
            PAGE_SIZE_2M
        } else {
            0
        };
    tables.modify_or_delete_map(
        platform,
        root,
        image_aligned,
        narrow_size,
        PteFlags::cache_wb(),
        PteFlags::cache_uc() | PteFlags::USER,
        MapOp::Modify,
    )?;

    // Leaves start with no-execute set; re-widen the code section only.
    tables.modify_or_delete_map(
        platform,
        root,
        image.base,
        image.text_end - image.base,
        PteFlags::empty(),
        PteFlags::NX,
        MapOp::Modify,
    )?;

    enable_paging(platform, root);

    Ok(HostPaging { tables, root })
}
