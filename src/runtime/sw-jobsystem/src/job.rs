use crate::job_allocator::JobBlock;
use crate::worker_thread::Worker;
use crossbeam::utils::Backoff;
use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Signature of a job body. The first argument is the worker executing the
/// job (not necessarily the one that created it), the second the job
/// itself, mainly to reach its closure data and to parent further jobs.
pub type JobFunction = fn(&Worker, JobHandle);

/// A copyable reference to a job record living inside its worker's current
/// allocation block.
///
/// A handle stays valid until the job's block share is released: for an
/// ordinary job that is when it finishes, for a waited job when
/// [`Worker::kick_and_wait_for`] returns.
#[repr(transparent)]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct JobHandle(pub(crate) *const Job);

unsafe impl Send for JobHandle {}

impl JobHandle {
    pub(crate) fn as_ptr(self) -> *mut Job {
        self.0 as *mut Job
    }
}

impl Deref for JobHandle {
    type Target = Job;

    fn deref(&self) -> &Job {
        unsafe { &*self.0 }
    }
}

/// A schedulable unit: a function, its closure data and an optional parent
/// that stays unfinished until every descendant completed.
///
/// Non-atomic interior state follows a strict discipline: `is_waiting` is
/// written only by the waiting thread before the job is published, and
/// `execute_worker_id` only by the executing worker before the body runs.
#[repr(align(64))]
pub struct Job {
    pub(crate) owner: *const Worker,
    pub(crate) function: JobFunction,
    pub(crate) parent: *const Job,
    pub(crate) data: *mut (),
    pub(crate) alloc_block: *mut JobBlock,
    pub(crate) job_id: u64,
    pub(crate) unfinished_jobs: AtomicU32,
    pub(crate) execute_worker_id: Cell<u16>,
    pub(crate) is_done: AtomicBool,
    pub(crate) is_waiting: Cell<bool>,
}

unsafe impl Sync for Job {}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("unfinished_jobs", &self.unfinished_jobs)
            .field("is_done", &self.is_done)
            .finish()
    }
}

impl Job {
    /// Unique id assigned at creation, contiguous from zero per context.
    pub fn id(&self) -> u64 {
        self.job_id
    }

    /// Closure data supplied at creation.
    pub fn data(&self) -> *mut () {
        self.data
    }

    /// Id of the worker that executed the job.
    pub fn execute_worker_id(&self) -> u16 {
        self.execute_worker_id.get()
    }

    /// Own execution plus the children still outstanding.
    pub fn unfinished(&self) -> u32 {
        self.unfinished_jobs.load(Ordering::Relaxed)
    }

    /// True once the job and all of its descendants completed.
    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::Acquire)
    }

    /// Publish into the owning worker's queue, spinning until space frees
    /// up. Space always does: as long as the system is active some worker
    /// keeps draining queues.
    pub fn kick(&self) {
        let backoff = Backoff::new();
        while !self.try_kick() {
            backoff.snooze();
        }
    }

    /// Publish into the owning worker's queue when it has room. Must be
    /// called from the thread driving the worker that created the job.
    pub fn try_kick(&self) -> bool {
        let queue = unsafe { &(*self.owner).queue };
        queue.try_push(JobHandle(self as *const Job))
    }
}

/// Completion bookkeeping, run after a job body and recursively for a
/// parent when its last child completes. All terminal work is gated on the
/// 1 -> 0 transition of the unfinished count: publish `is_done`, and give
/// back the block share unless a waiter took over that release.
pub(crate) fn finish(job: JobHandle) {
    let res = job.unfinished_jobs.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(res != 0, "job {} finished more often than started", job.job_id);
    if res == 1 {
        let parent = job.parent;
        let block = job.alloc_block;
        let waiting = job.is_waiting.get();
        if !parent.is_null() {
            finish(JobHandle(parent));
        }
        // a waiter may release the block right after this store; the job
        // record must not be touched again
        job.is_done.store(true, Ordering::Release);
        if !waiting {
            unsafe { JobBlock::deref(block) };
        }
    }
}
