//! Fixed-capacity allocator for page-table node pages.
//!
//! Nodes come from caller-supplied storage handed over at construction and
//! are never returned to the system; a bitmap tracks allocation and a
//! word-granular hint cursor spreads allocations round-robin instead of
//! first-fit-from-zero. Physical addresses are derived from the node index
//! and the configured base, so the pool never inspects pointer values.

use crate::{PAGE_SIZE_4K, TABLE_ENTRIES};

/// One 4 KiB page-table node, always naturally aligned.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct TablePage(pub [u64; TABLE_ENTRIES]);

impl TablePage {
    pub const fn zeroed() -> Self {
        Self([0; TABLE_ENTRIES])
    }
}

/// Bitmap-backed arena of [`TablePage`] nodes.
///
/// On bare metal `base_hpa` must be the physical address of `pages[0]` (the
/// hypervisor's own tables are identity-mapped); hosted tests pick an
/// arbitrary aligned base. Capacity must be a multiple of 64 so bitmap words
/// divide evenly.
pub struct PagePool {
    pages: &'static mut [TablePage],
    bitmap: &'static mut [u64],
    base_hpa: u64,
    /// Bitmap word the last allocation came from; the next scan starts here.
    last_hint: usize,
    used: usize,
    dummy_hpa: Option<u64>,
}

impl PagePool {
    pub fn new(
        pages: &'static mut [TablePage],
        bitmap: &'static mut [u64],
        base_hpa: u64,
    ) -> Self {
        debug_assert!(!pages.is_empty());
        debug_assert_eq!(pages.len() % 64, 0);
        debug_assert_eq!(bitmap.len() * 64, pages.len());
        debug_assert_eq!(base_hpa % PAGE_SIZE_4K, 0);
        Self {
            pages,
            bitmap,
            base_hpa,
            last_hint: 0,
            used: 0,
            dummy_hpa: None,
        }
    }

    /// Permanently claims one node as the pre-zeroed fallback handed out when
    /// the bitmap is exhausted.
    ///
    /// The fallback may be handed out more than once and is never freed;
    /// pools backing permanent mappings leave it unset and report exhaustion
    /// instead.
    pub fn reserve_dummy_page(&mut self) -> Option<u64> {
        let hpa = self.allocate_page()?;
        self.dummy_hpa = Some(hpa);
        Some(hpa)
    }

    /// Claims and zeroes one node, returning its physical address.
    pub fn allocate_page(&mut self) -> Option<u64> {
        let words = self.bitmap.len();
        for step in 0..words {
            let word_idx = (self.last_hint + step) % words;
            let word = self.bitmap[word_idx];
            if word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                self.bitmap[word_idx] |= 1 << bit;
                self.last_hint = word_idx;
                self.used += 1;
                let idx = word_idx * 64 + bit;
                self.pages[idx].0.fill(0);
                return Some(self.base_hpa + (idx as u64) * PAGE_SIZE_4K);
            }
        }
        if let Some(dummy) = self.dummy_hpa {
            log::warn!("page pool exhausted, handing out the fallback page");
            let idx = self.index_of(dummy);
            self.pages[idx].0.fill(0);
            return Some(dummy);
        }
        None
    }

    /// Returns a node to the pool. The contents are left as-is; allocation
    /// zeroes.
    pub fn free_page(&mut self, hpa: u64) {
        if self.dummy_hpa == Some(hpa) {
            return;
        }
        let idx = self.index_of(hpa);
        let mask = 1u64 << (idx % 64);
        debug_assert_ne!(self.bitmap[idx / 64] & mask, 0, "double free of {hpa:#x}");
        self.bitmap[idx / 64] &= !mask;
        self.used -= 1;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.pages.len() - self.used
    }

    #[inline]
    pub fn contains(&self, hpa: u64) -> bool {
        hpa >= self.base_hpa && hpa < self.base_hpa + (self.pages.len() as u64) * PAGE_SIZE_4K
    }

    /// Borrows the node at `hpa`. Panics if `hpa` was not produced by this
    /// pool; an entry pointing elsewhere means the tables are corrupt.
    #[inline]
    pub fn page(&self, hpa: u64) -> &TablePage {
        &self.pages[self.index_of(hpa)]
    }

    #[inline]
    pub fn page_mut(&mut self, hpa: u64) -> &mut TablePage {
        let idx = self.index_of(hpa);
        &mut self.pages[idx]
    }

    #[inline]
    fn index_of(&self, hpa: u64) -> usize {
        debug_assert!(self.contains(hpa), "{hpa:#x} is not a pool page");
        debug_assert_eq!(hpa % PAGE_SIZE_4K, 0);
        ((hpa - self.base_hpa) / PAGE_SIZE_4K) as usize
    }
}
