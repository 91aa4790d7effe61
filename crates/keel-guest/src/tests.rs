use super::*;

use std::ops::Range;

use proptest::prelude::*;

const TOP_FLAGS: u64 = PTE_P | PTE_RW | PTE_US;
const CR3: u64 = 0x1000;
const PDPT: u64 = 0x2000;
const PD: u64 = 0x3000;
const PT: u64 = 0x4000;

struct TestMemory {
    data: Vec<u8>,
    page_size: u64,
    holes: Vec<Range<u64>>,
    resolves: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            page_size: PAGE_SIZE_4K,
            holes: Vec::new(),
            resolves: 0,
        }
    }

    fn punch_hole(&mut self, range: Range<u64>) {
        self.holes.push(range);
    }

    fn write_u32_raw(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64_raw(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl GuestMemory for TestMemory {
    fn gpa2hpa(&mut self, gpa: u64) -> Option<HostMapping> {
        self.resolves += 1;
        if self.holes.iter().any(|hole| hole.contains(&gpa)) {
            return None;
        }
        if (gpa as usize) < self.data.len() {
            // Identity second stage keeps the table arithmetic readable.
            Some(HostMapping {
                hpa: gpa,
                page_size: self.page_size,
            })
        } else {
            None
        }
    }

    fn read_u8(&mut self, hpa: u64) -> u8 {
        self.data[hpa as usize]
    }

    fn write_u8(&mut self, hpa: u64, value: u8) {
        self.data[hpa as usize] = value;
    }
}

fn build_long_chain(mem: &mut TestMemory) {
    mem.write_u64_raw(CR3, PDPT | TOP_FLAGS);
    mem.write_u64_raw(PDPT, PD | TOP_FLAGS);
    mem.write_u64_raw(PD, PT | TOP_FLAGS);
}

fn long_regs() -> PagingRegisters {
    PagingRegisters {
        cr0: CR0_PG,
        cr3: CR3,
        efer: EFER_LMA,
        ..Default::default()
    }
}

#[test]
fn disabled_paging_is_identity() {
    let mut mem = TestMemory::new(0x1000);
    let regs = PagingRegisters::default();

    let mut code = PageFaultCode::WR | PageFaultCode::P;
    assert_eq!(
        gva2gpa(&mut mem, &regs, 0xdead_beef, &mut code),
        Ok(0xdead_beef)
    );
    // Only the stale P seed is dropped.
    assert_eq!(code, PageFaultCode::WR);
}

#[test]
fn paging_mode_follows_the_control_registers() {
    let mut regs = PagingRegisters::default();
    assert_eq!(PagingMode::from_registers(&regs), PagingMode::Disabled);

    regs.cr0 = CR0_PG;
    assert_eq!(PagingMode::from_registers(&regs), PagingMode::Legacy32);

    regs.cr4 = CR4_PAE;
    assert_eq!(PagingMode::from_registers(&regs), PagingMode::Pae);

    regs.efer = EFER_LMA;
    assert_eq!(PagingMode::from_registers(&regs), PagingMode::Long4);

    // Long-mode bits without paging still mean identity.
    regs.cr0 = 0;
    assert_eq!(PagingMode::from_registers(&regs), PagingMode::Disabled);
}

#[test]
fn four_level_walk_reaches_the_leaf() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | TOP_FLAGS);
    let mut regs = long_regs();

    let mut code = PageFaultCode::empty();
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
    assert!(code.is_empty());

    // The path is user-accessible throughout, so a user read works too.
    regs.cpl = 3;
    let mut code = PageFaultCode::empty();
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
    assert!(code.is_empty());
}

#[test]
fn long_mode_2m_leaf_stops_early() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PD + 8, 0x80_0000 | TOP_FLAGS | PTE_PS);
    let regs = long_regs();

    let mut code = PageFaultCode::empty();
    assert_eq!(
        gva2gpa(&mut mem, &regs, 0x20_1345, &mut code),
        Ok(0x80_1345)
    );
    assert!(code.is_empty());
}

#[test]
fn legacy32_walk_uses_ten_bit_indices() {
    let mut mem = TestMemory::new(0x10000);
    mem.write_u32_raw(CR3 + 4, (PT as u32) | (TOP_FLAGS as u32));
    mem.write_u32_raw(PT, 0x7000 | (TOP_FLAGS as u32));
    let regs = PagingRegisters {
        cr0: CR0_PG,
        cr3: CR3,
        ..Default::default()
    };

    let mut code = PageFaultCode::empty();
    let gva = (1 << 22) | 0x123;
    assert_eq!(gva2gpa(&mut mem, &regs, gva, &mut code), Ok(0x7123));
    assert!(code.is_empty());
}

#[test]
fn legacy32_4m_page_translates() {
    let mut mem = TestMemory::new(0x10000);
    // Single present, writable, user entry at directory index 3 mapping a
    // 4 MiB page at 16 MiB.
    mem.write_u32_raw(
        CR3 + 3 * 4,
        0x0100_0000 | ((PTE_P | PTE_RW | PTE_US | PTE_PS) as u32),
    );
    let regs = PagingRegisters {
        cr0: CR0_PG,
        cr3: CR3,
        cr4: CR4_PSE,
        ..Default::default()
    };

    let mut code = PageFaultCode::empty();
    assert_eq!(
        gva2gpa(&mut mem, &regs, 0x00C0_0123, &mut code),
        Ok(0x0100_0123)
    );
    assert!(code.is_empty());

    // Without CR4.PSE the same entry is treated as a table pointer.
    let regs = PagingRegisters {
        cr0: CR0_PG,
        cr3: CR3,
        ..Default::default()
    };
    let mut code = PageFaultCode::empty();
    assert!(gva2gpa(&mut mem, &regs, 0x00C0_0123, &mut code).is_err());
}

#[test]
fn missing_entry_faults_with_the_present_protocol() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    // No leaf at index 0.
    let mut regs = long_regs();

    let mut code = PageFaultCode::empty();
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(err.gpa, None);
    assert_eq!(code, PageFaultCode::P);

    // The same fault from user mode also carries US.
    regs.cpl = 3;
    let mut code = PageFaultCode::empty();
    gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(code, PageFaultCode::P | PageFaultCode::US);
}

#[test]
fn unmapped_table_base_faults() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | TOP_FLAGS);
    mem.punch_hole(PD..PD + 0x1000);
    let regs = long_regs();

    let mut code = PageFaultCode::empty();
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(err.gpa, None);
    assert_eq!(code, PageFaultCode::P);
}

#[test]
fn write_denied_by_read_only_entry() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | PTE_P | PTE_US);
    let mut regs = long_regs();

    // Supervisor write with WP set faults inside the walk.
    regs.cr0 |= CR0_WP;
    let mut code = PageFaultCode::WR;
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(err.gpa, None);
    assert_eq!(code, PageFaultCode::WR | PageFaultCode::P);

    // With WP clear the supervisor write goes through.
    regs.cr0 = CR0_PG;
    let mut code = PageFaultCode::WR;
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));

    // A user write is denied regardless of WP.
    regs.cpl = 3;
    let mut code = PageFaultCode::WR;
    gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(
        code,
        PageFaultCode::WR | PageFaultCode::P | PageFaultCode::US
    );
}

#[test]
fn user_access_to_supervisor_entry_faults() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | PTE_P | PTE_RW);
    let mut regs = long_regs();
    regs.cpl = 3;

    let mut code = PageFaultCode::empty();
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(err.gpa, None);
    assert_eq!(code, PageFaultCode::P | PageFaultCode::US);
}

#[test]
fn no_execute_entries_do_not_block_fetches() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | TOP_FLAGS | (1 << 63));
    let mut regs = long_regs();
    regs.efer |= EFER_NXE;

    // Execute disable is left to hardware at resume time; the software
    // walk resolves the fetch and drops the bit from the frame.
    let mut code = PageFaultCode::ID;
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
    assert_eq!(code, PageFaultCode::ID);
}

#[test]
fn smep_blocks_supervisor_fetch_through_user_path() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | TOP_FLAGS);
    let mut regs = long_regs();
    regs.cr4 = CR4_SMEP;

    let mut code = PageFaultCode::ID;
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    // The walk finished, so the fault still reports the translation.
    assert_eq!(err.gpa, Some(0x5123));
    assert_eq!(code, PageFaultCode::ID | PageFaultCode::P);

    // Without SMEP the same fetch goes through.
    regs.cr4 = 0;
    let mut code = PageFaultCode::ID;
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
}

#[test]
fn smap_blocks_supervisor_reads_unless_overridden() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | TOP_FLAGS);
    let mut regs = long_regs();
    regs.cr4 = CR4_SMAP;

    let mut code = PageFaultCode::empty();
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(err.gpa, Some(0x5123));
    assert_eq!(code, PageFaultCode::P);

    // The override flag admits the access.
    regs.rflags = RFLAGS_AC;
    let mut code = PageFaultCode::empty();
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
}

#[test]
fn smap_write_to_read_only_user_path_needs_override() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | PTE_P | PTE_US);
    let mut regs = long_regs();
    regs.cr4 = CR4_SMAP;

    // WP is clear, so the walk itself admits the supervisor write; the
    // post-walk check still wants the override flag.
    let mut code = PageFaultCode::WR;
    let err = gva2gpa(&mut mem, &regs, 0x123, &mut code).unwrap_err();
    assert_eq!(err.gpa, Some(0x5123));
    assert_eq!(code, PageFaultCode::WR | PageFaultCode::P);

    regs.rflags = RFLAGS_AC;
    let mut code = PageFaultCode::WR;
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
}

#[test]
fn pae_walk_consumes_the_top_directory() {
    let mut mem = TestMemory::new(0x10000);
    // Directory entry 1 covers gva bit 30; low cr3 bits are ignored by the
    // 32-byte-aligned lookup.
    mem.write_u64_raw(CR3 + 8, PD | PTE_P);
    mem.write_u64_raw(PD, PT | TOP_FLAGS);
    mem.write_u64_raw(PT, 0x8000 | TOP_FLAGS);
    let regs = PagingRegisters {
        cr0: CR0_PG,
        cr3: CR3 | 0x18,
        cr4: CR4_PAE,
        ..Default::default()
    };

    let mut code = PageFaultCode::empty();
    assert_eq!(gva2gpa(&mut mem, &regs, 0x4000_0123, &mut code), Ok(0x8123));
    assert!(code.is_empty());

    // A missing directory entry faults without the P bit.
    let mut code = PageFaultCode::WR;
    let err = gva2gpa(&mut mem, &regs, 0x8000_0000, &mut code).unwrap_err();
    assert_eq!(err.gpa, None);
    assert_eq!(code, PageFaultCode::WR);
}

#[test]
fn caller_seeds_survive_a_successful_walk() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT, 0x5000 | TOP_FLAGS);
    let regs = long_regs();

    let mut code = PageFaultCode::WR | PageFaultCode::P;
    assert_eq!(gva2gpa(&mut mem, &regs, 0x123, &mut code), Ok(0x5123));
    assert_eq!(code, PageFaultCode::WR);
}

#[test]
fn copy_gpa_crosses_page_boundaries() {
    let mut mem = TestMemory::new(0x10000);
    let pattern: Vec<u8> = (0..0x200).map(|i| (i * 7) as u8).collect();

    copy_to_gpa(&mut mem, 0x1F00, &pattern).unwrap();
    assert_eq!(&mem.data[0x1F00..0x2100], &pattern[..]);

    let mut back = vec![0u8; 0x200];
    copy_from_gpa(&mut mem, &mut back, 0x1F00).unwrap();
    assert_eq!(back, pattern);
}

#[test]
fn copy_gpa_chunking_follows_the_reported_page_size() {
    let mut mem = TestMemory::new(0x10000);
    let mut buf = vec![0u8; 0x2000];
    copy_from_gpa(&mut mem, &mut buf, 0x1F00).unwrap();
    assert_eq!(mem.resolves, 3);

    // A large host leaf behind the range collapses it into one run.
    let mut mem = TestMemory::new(0x10000);
    mem.page_size = 0x20_0000;
    let mut buf = vec![0u8; 0x2000];
    copy_from_gpa(&mut mem, &mut buf, 0x1F00).unwrap();
    assert_eq!(mem.resolves, 1);
}

#[test]
fn copy_gpa_unmapped_chunk_is_invalid_argument() {
    let mut mem = TestMemory::new(0x10000);
    mem.punch_hole(0x2000..0x3000);
    mem.data[0x1F00..0x2000].fill(0x5A);

    let mut buf = vec![0xAA; 0x200];
    let err = copy_from_gpa(&mut mem, &mut buf, 0x1F00).unwrap_err();
    assert_eq!(err, AccessError::InvalidArgument);
    // The chunk before the hole was already copied.
    assert!(buf[..0x100].iter().all(|&b| b == 0x5A));
    assert!(buf[0x100..].iter().all(|&b| b == 0xAA));

    // Past the end of backed memory fails the same way.
    let mut buf = [0u8; 4];
    assert_eq!(
        copy_from_gpa(&mut mem, &mut buf, 0x2_0000),
        Err(AccessError::InvalidArgument)
    );
}

#[test]
fn zero_length_copies_are_rejected() {
    let mut mem = TestMemory::new(0x1000);
    let regs = long_regs();
    let mut code = PageFaultCode::empty();

    assert_eq!(
        copy_from_gpa(&mut mem, &mut [0u8; 0], 0),
        Err(AccessError::InvalidArgument)
    );
    assert_eq!(
        copy_to_gpa(&mut mem, 0, &[]),
        Err(AccessError::InvalidArgument)
    );
    assert_eq!(
        copy_from_gva(&mut mem, &regs, &mut [0u8; 0], 0, &mut code),
        Err(AccessError::InvalidArgument)
    );
    assert_eq!(
        copy_to_gva(&mut mem, &regs, 0, &[], &mut code),
        Err(AccessError::InvalidArgument)
    );
}

#[test]
fn copy_gva_spans_noncontiguous_guest_pages() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    // Virtually adjacent, physically scattered.
    mem.write_u64_raw(PT + 16 * 8, 0x5000 | TOP_FLAGS);
    mem.write_u64_raw(PT + 17 * 8, 0x8000 | TOP_FLAGS);
    let regs = long_regs();

    let pattern: Vec<u8> = (0..0x800).map(|i| (i % 251) as u8).collect();
    let gva = 16 * 0x1000 + 0xC00;
    let mut code = PageFaultCode::WR;
    copy_to_gva(&mut mem, &regs, gva, &pattern, &mut code).unwrap();

    assert_eq!(&mem.data[0x5C00..0x6000], &pattern[..0x400]);
    assert_eq!(&mem.data[0x8000..0x8400], &pattern[0x400..]);

    let mut back = vec![0u8; 0x800];
    let mut code = PageFaultCode::empty();
    copy_from_gva(&mut mem, &regs, &mut back, gva, &mut code).unwrap();
    assert_eq!(back, pattern);
}

#[test]
fn copy_gva_reports_the_first_byte_of_the_failing_chunk() {
    let mut mem = TestMemory::new(0x10000);
    build_long_chain(&mut mem);
    mem.write_u64_raw(PT + 16 * 8, 0x5000 | TOP_FLAGS);
    // Index 17 is unmapped.
    mem.data[0x5C00..0x6000].fill(0x77);
    let regs = long_regs();

    let mut dst = vec![0u8; 0x800];
    let mut code = PageFaultCode::empty();
    let err = copy_from_gva(&mut mem, &regs, &mut dst, 0x10C00, &mut code).unwrap_err();
    assert_eq!(err, AccessError::PageFault { gva: 0x11000 });
    assert_eq!(code, PageFaultCode::P);

    // Everything before the fault was already read; partial copies stand.
    assert!(dst[..0x400].iter().all(|&b| b == 0x77));
    assert!(dst[0x400..].iter().all(|&b| b == 0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn long_mode_walk_preserves_offsets(
        frame in (8u64..0xF0).prop_map(|f| f << 12),
        index in 0u64..512,
        offset in 0u64..0x1000,
    ) {
        let mut mem = TestMemory::new(0x10_0000);
        build_long_chain(&mut mem);
        mem.write_u64_raw(PT + index * 8, frame | TOP_FLAGS);
        let regs = long_regs();

        let gva = (index << 12) | offset;
        let mut code = PageFaultCode::empty();
        let gpa: Result<u64, PageFault> = gva2gpa(&mut mem, &regs, gva, &mut code);
        prop_assert_eq!(gpa, Ok(frame | offset));
        prop_assert!(code.is_empty());
    }
}
