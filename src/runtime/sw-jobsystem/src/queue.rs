//! The work-stealing deque backing each worker.
//!
//! The owner pushes and pops at `bottom`; thieves take from `top`. All four
//! state fields live in one 64-bit word so every transition is a single
//! compare-and-swap, which sidesteps the double-width CAS a classic
//! Chase-Lev deque would need here.
//!
//! Reserving an index and publishing the job pointer are separate steps, so
//! both the owner and thieves must tolerate a reserved slot that is still
//! transiently null (or still holds an entry a lagging thief has not
//! vacated). The index word itself is Relaxed with the CAS as the
//! linearization point; slot exchanges use acquire/release so a stolen job
//! record is fully visible to the thief that runs it.

use crate::job::{Job, JobHandle};
use crate::{MAX_WORKERS, QUEUE_CAPACITY};
use crossbeam::utils::{Backoff, CachePadded};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

// the index fields are 16 bits wide
const _: () = assert!(QUEUE_CAPACITY.is_power_of_two() && QUEUE_CAPACITY <= 1 << 16);

/// Mask to avoid the mod operator on ring positions.
pub(crate) const MASK_JOBS: u16 = (QUEUE_CAPACITY - 1) as u16;
/// Head room left for contention: with this cap every worker can still
/// push one job simultaneously.
pub(crate) const FULL_QUEUE_JOBS: u16 = (QUEUE_CAPACITY - MAX_WORKERS) as u16;

/// The queue state packed into one CAS-able word: `top` is the oldest
/// entry (where thieves consume), `bottom` the push end, `count` the number
/// of occupied slots. `tag` carries no invariant; each updater writes a
/// debug token into it, which also perturbs ABA patterns.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PackedIndex {
    pub top: u16,
    pub bottom: u16,
    pub count: u16,
    pub tag: u16,
}

impl PackedIndex {
    pub(crate) fn new(top: u16, bottom: u16, count: u16, tag: u16) -> Self {
        Self {
            top,
            bottom,
            count,
            tag,
        }
    }

    pub(crate) fn unpack(v: u64) -> Self {
        Self {
            top: (v >> 48) as u16,
            bottom: (v >> 32) as u16,
            count: (v >> 16) as u16,
            tag: v as u16,
        }
    }

    pub(crate) fn pack(self) -> u64 {
        ((self.top as u64) << 48)
            | ((self.bottom as u64) << 32)
            | ((self.count as u64) << 16)
            | self.tag as u64
    }
}

pub(crate) struct Wsq {
    idx: CachePadded<AtomicU64>,
    entries: Box<[AtomicPtr<Job>]>,
}

impl Wsq {
    pub(crate) fn new() -> Self {
        let entries = (0..QUEUE_CAPACITY)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            idx: CachePadded::new(AtomicU64::new(PackedIndex::new(0, 0, 0, 0).pack())),
            entries,
        }
    }

    fn slot(&self, pos: u16) -> &AtomicPtr<Job> {
        &self.entries[(pos & MASK_JOBS) as usize]
    }

    /// Owner only. Reserves the next bottom slot with one CAS and publishes
    /// the job into it. Returns false when the queue is at capacity or the
    /// CAS lost against a thief; the caller retries at its own pace.
    pub(crate) fn try_push(&self, job: JobHandle) -> bool {
        let v = self.idx.load(Ordering::Relaxed);
        let i = PackedIndex::unpack(v);
        if i.count == FULL_QUEUE_JOBS {
            return false;
        }
        let j = PackedIndex::new(
            i.top,
            i.bottom.wrapping_add(1) & MASK_JOBS,
            i.count + 1,
            job.job_id as u16,
        );
        if self
            .idx
            .compare_exchange(v, j.pack(), Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // slot i.bottom is ours now, but a thief that reserved it in a
        // previous lap may not have taken its entry out yet
        let slot = self.slot(i.bottom);
        let backoff = Backoff::new();
        loop {
            let old = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if old.is_null() {
                let prev = slot.swap(job.as_ptr(), Ordering::AcqRel);
                debug_assert!(prev.is_null());
                return true;
            }
            // put it back for the lagging thief and wait
            slot.swap(old, Ordering::AcqRel);
            backoff.snooze();
        }
    }

    /// Owner only. Takes back the most recently pushed job, competing with
    /// thieves only on the index word.
    pub(crate) fn pop(&self) -> Option<JobHandle> {
        loop {
            let v = self.idx.load(Ordering::Relaxed);
            let i = PackedIndex::unpack(v);
            if i.count == 0 {
                return None;
            }
            let j = PackedIndex::new(i.top, i.bottom.wrapping_sub(1) & MASK_JOBS, i.count - 1, 1);
            if self
                .idx
                .compare_exchange(v, j.pack(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let job = self.slot(j.bottom).swap(ptr::null_mut(), Ordering::AcqRel);
                // the owner published this entry itself
                assert!(!job.is_null(), "owner queue empty at reserved slot {}", j.bottom);
                return Some(JobHandle(job));
            }
        }
    }

    /// Thieves only. Takes up to `max_n` entries from the top, clamped to
    /// half of the queue plus one so the owner is never drained dry while
    /// it still pushes. Returns how many entries were written to `out`.
    pub(crate) fn steal(&self, max_n: u16, out: &mut [JobHandle]) -> u16 {
        debug_assert!(max_n as usize <= out.len());
        loop {
            let v = self.idx.load(Ordering::Relaxed);
            let i = PackedIndex::unpack(v);
            if i.count == 0 {
                return 0;
            }
            let n = max_n.min(i.count / 2 + 1);
            let j = PackedIndex::new(i.top.wrapping_add(n) & MASK_JOBS, i.bottom, i.count - n, 0);
            if self
                .idx
                .compare_exchange(v, j.pack(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let backoff = Backoff::new();
                let mut k = 0u16;
                while k < n {
                    let job = self
                        .slot(i.top.wrapping_add(k))
                        .swap(ptr::null_mut(), Ordering::AcqRel);
                    if job.is_null() {
                        // the owner reserved this slot but has not
                        // published into it yet
                        backoff.snooze();
                    } else {
                        out[k as usize] = JobHandle(job);
                        k += 1;
                    }
                }
                return n;
            }
        }
    }

    /// Owner only. Reserves `jobs.len()` bottom slots with one CAS and
    /// stores the pointers. The caller guarantees vacancy through
    /// [`Wsq::multi_push_avail`].
    pub(crate) fn multi_push(&self, jobs: &[JobHandle]) {
        let n = jobs.len() as u16;
        loop {
            let v = self.idx.load(Ordering::Relaxed);
            let i = PackedIndex::unpack(v);
            let j = PackedIndex::new(i.top, i.bottom.wrapping_add(n) & MASK_JOBS, i.count + n, 2);
            if self
                .idx
                .compare_exchange(v, j.pack(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                for (k, job) in jobs.iter().enumerate() {
                    self.slot(i.bottom.wrapping_add(k as u16))
                        .store(job.as_ptr(), Ordering::Release);
                }
                return;
            }
        }
    }

    /// Length of the run of vacated slots a bulk push may write, bounded by
    /// the remaining head room. Slots a thief reserved but has not emptied
    /// yet stop the run.
    pub(crate) fn multi_push_avail(&self, max_n: u16) -> u16 {
        let i = PackedIndex::unpack(self.idx.load(Ordering::Relaxed));
        let max_n = max_n.min(FULL_QUEUE_JOBS - i.count);
        let mut k = 0;
        while k < max_n {
            if !self
                .slot(i.top.wrapping_add(k))
                .load(Ordering::Acquire)
                .is_null()
            {
                break;
            }
            k += 1;
        }
        k
    }
}
