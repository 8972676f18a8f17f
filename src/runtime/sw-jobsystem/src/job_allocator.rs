use crate::job::Job;
use crate::QUEUE_CAPACITY;
use std::alloc::{self, Layout};
use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Jobs hosted per block: enough for a fair share of a full queue, with a
/// floor for tiny configurations.
pub(crate) const JOBS_PER_BLOCK: usize = (if QUEUE_CAPACITY > 4096 {
    QUEUE_CAPACITY >> 6
} else {
    64
}) - 1;

#[cfg(test)]
pub(crate) static LIVE_BLOCKS: std::sync::atomic::AtomicIsize =
    std::sync::atomic::AtomicIsize::new(0);

/// A slab the owning worker bump-allocates job records from. Slots are
/// handed out from the top of the array downward, each cache-line aligned
/// through [`Job`]'s alignment. `ref_count` starts at one share per slot
/// plus one for the worker that currently allocates from the block; the
/// block frees itself when the count runs out.
pub(crate) struct JobBlock {
    slots: [UnsafeCell<MaybeUninit<Job>>; JOBS_PER_BLOCK],
    avail_count: Cell<u32>,
    ref_count: AtomicU32,
}

impl JobBlock {
    /// Heap-allocates a fresh block. The slab is far too large to exist as
    /// a stack temporary, so construction goes through the raw allocator
    /// and writes the two counters in place; the slots stay uninitialized
    /// until jobs are placed into them.
    pub(crate) fn alloc() -> *mut JobBlock {
        let layout = Layout::new::<JobBlock>();
        unsafe {
            let block = alloc::alloc(layout).cast::<JobBlock>();
            if block.is_null() {
                alloc::handle_alloc_error(layout);
            }
            ptr::addr_of_mut!((*block).avail_count).write(Cell::new(JOBS_PER_BLOCK as u32));
            ptr::addr_of_mut!((*block).ref_count)
                .write(AtomicU32::new(JOBS_PER_BLOCK as u32 + 1));
            #[cfg(test)]
            LIVE_BLOCKS.fetch_add(1, Ordering::Relaxed);
            block
        }
    }

    /// Next unused slot, or null when the block is exhausted. Owner only.
    pub(crate) fn new_job(&self) -> *mut Job {
        let avail = self.avail_count.get();
        if avail == 0 {
            return ptr::null_mut();
        }
        self.avail_count.set(avail - 1);
        self.slots[(avail - 1) as usize].get().cast::<Job>()
    }

    /// Returns the shares of slots that were never issued, in one step.
    /// Called on worker teardown so a block abandoned half-filled can
    /// still reach zero once its outstanding jobs finish.
    pub(crate) fn release_unissued(&self) {
        let unissued = self.avail_count.get();
        if unissued > 0 {
            self.avail_count.set(0);
            self.ref_count.fetch_sub(unissued, Ordering::Relaxed);
        }
    }

    /// Drops one share; the last one frees the block.
    pub(crate) unsafe fn deref(block: *mut JobBlock) {
        if (*block).ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            #[cfg(test)]
            LIVE_BLOCKS.fetch_sub(1, Ordering::Relaxed);
            alloc::dealloc(block.cast(), Layout::new::<JobBlock>());
        }
    }
}
