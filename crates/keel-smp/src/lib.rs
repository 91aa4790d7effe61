//! Cross-core function calls over software interrupts.
//!
//! One core installs a function and argument for a set of target cores and
//! kicks them with an IPI; each target runs the call from its interrupt
//! handler and retires its own pending bit. Dispatch is fire-and-forget: the
//! initiator does not wait for its broadcast to finish, the next broadcast
//! does.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use keel_hal::{Platform, MAX_CPUS};
use keel_sync::SpinLock;

/// Function run on each target core, with the dispatcher's opaque argument.
pub type SmpCallFn = fn(usize);

/// Per-core call state, valid only while the core's pending bit is set.
struct CallSlot {
    func: UnsafeCell<Option<SmpCallFn>>,
    data: UnsafeCell<usize>,
}

// Safety: a slot is written only by an initiator that has drained the
// previous broadcast under the dispatch lock, before the owning core's
// pending bit is published (release); the owning core reads it only after
// observing its bit (acquire). At most one side touches a slot at a time.
unsafe impl Sync for CallSlot {}

/// Broadcast state shared by every core.
///
/// Const-constructible so the one instance can live in a `static` next to
/// the interrupt handler that services it.
pub struct SmpCallDispatcher {
    /// Serializes initiating cores; targets never take it.
    lock: SpinLock<()>,
    /// One bit per core that still owes a run of its slot.
    pending: AtomicU64,
    slots: [CallSlot; MAX_CPUS],
    /// Interrupt vector the targets receive the kick on.
    vector: u8,
}

impl SmpCallDispatcher {
    pub const fn new(vector: u8) -> Self {
        const SLOT: CallSlot = CallSlot {
            func: UnsafeCell::new(None),
            data: UnsafeCell::new(0),
        };
        Self {
            lock: SpinLock::new(()),
            pending: AtomicU64::new(0),
            slots: [SLOT; MAX_CPUS],
            vector,
        }
    }

    /// Runs `func(data)` on every online core whose bit is set in `mask`.
    ///
    /// Offline targets are logged and skipped. Returns once the interrupts
    /// are sent; completion on the targets is not awaited. A target that
    /// never services its interrupt stalls every later dispatch in the
    /// drain loop below.
    pub fn dispatch<P: Platform>(&self, platform: &P, mask: u64, func: SmpCallFn, data: usize) {
        let _guard = self.lock.lock();

        // The previous broadcast must fully retire before its slots are
        // overwritten; a stale bit would let that target observe a
        // half-installed call.
        while self.pending.load(Ordering::Acquire) != 0 {
            platform.cpu_relax();
        }

        let mut final_mask = 0u64;
        let mut remaining = mask;
        while remaining != 0 {
            let cpu = remaining.trailing_zeros() as u16;
            remaining &= remaining - 1;
            if !platform.cpu_online(cpu) {
                log::error!("smp call: target cpu {} is offline, skipped", cpu);
                continue;
            }
            let slot = &self.slots[cpu as usize];
            // Safety: the drain above retired every previous owner and the
            // held lock keeps other initiators out, so the slot is free; the
            // release fetch_or publishes it to the target core.
            unsafe {
                *slot.func.get() = Some(func);
                *slot.data.get() = data;
            }
            self.pending.fetch_or(1u64 << cpu, Ordering::Release);
            final_mask |= 1u64 << cpu;
        }

        if final_mask != 0 {
            platform.send_swi_mask(final_mask, self.vector);
        }
    }

    /// Services the dispatch interrupt on the current core.
    ///
    /// Called from the handler of the vector passed to [`new`]; a spurious
    /// call with no pending bit is harmless. An installed empty slot is
    /// retired without running anything.
    ///
    /// [`new`]: SmpCallDispatcher::new
    pub fn handle_notification<P: Platform>(&self, platform: &P) {
        let cpu = platform.cpu_id();
        let bit = 1u64 << cpu;
        if self.pending.load(Ordering::Acquire) & bit == 0 {
            return;
        }

        let slot = &self.slots[cpu as usize];
        // Safety: this core's bit is set and only this core clears it, so
        // the slot is fully published and nobody rewrites it before the
        // fetch_and below.
        let (func, data) = unsafe { (*slot.func.get(), *slot.data.get()) };
        if let Some(func) = func {
            func(data);
        }

        // The only place a target's bit is cleared; release orders the slot
        // read before the next initiator's overwrite.
        self.pending.fetch_and(!bit, Ordering::Release);
    }
}
