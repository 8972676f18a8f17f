use crate::ctx::SystemContext;
use crate::job::{self, Job, JobFunction, JobHandle};
use crate::job_allocator::JobBlock;
use crate::queue::Wsq;
use crossbeam::utils::Backoff;
use std::cell::Cell;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Steal transfer size: one job to run right away plus at most this many
/// minus one requeued locally.
const STEAL_JAR: usize = 64;

/// xoroshiro128+, tolerant of weak seeding. Each worker carries one to pick
/// steal victims; `Cell` state keeps it usable through `&self`.
pub(crate) struct XoroRand {
    state: Cell<[u64; 2]>,
}

impl XoroRand {
    pub(crate) fn new(s0: u64, s1: u64) -> Self {
        Self {
            state: Cell::new([s0, s1]),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        let [s0, mut s1] = self.state.get();
        let result = s0.wrapping_add(s1);
        s1 ^= s0;
        self.state
            .set([s0.rotate_left(55) ^ s1 ^ (s1 << 14), s1.rotate_left(36)]);
        result
    }
}

/// Per-thread scheduling context: the owned deque, the victim-selection
/// random state, the current allocation block and the scheduling loops.
///
/// Every method takes `&self`; the queue is designed to be reached by
/// thieves while the owner works, and the owner-only state sits in `Cell`s.
/// Owner-only operations (creating, kicking and popping jobs) must stay on
/// the one thread the worker was handed to.
#[repr(align(64))]
pub struct Worker {
    pub(crate) queue: Wsq,
    pub(crate) rand: XoroRand,
    ctx: *const SystemContext,
    cur_block: Cell<*mut JobBlock>,
    data: *mut (),
    worker_id: u16,
}

/// A copyable reference to a registered worker, used to hand the worker to
/// the OS thread that drives it. The context owns the worker; the handle
/// must not outlive it.
#[derive(Clone, Copy, Debug)]
pub struct WorkerHandle(pub(crate) *const Worker);

unsafe impl Send for WorkerHandle {}

impl Deref for WorkerHandle {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        unsafe { &*self.0 }
    }
}

impl Worker {
    pub(crate) fn new(ctx: *const SystemContext, worker_id: u16, seed: u64, data: *mut ()) -> Self {
        Self {
            queue: Wsq::new(),
            rand: XoroRand::new(worker_id as u64, seed),
            ctx,
            cur_block: Cell::new(ptr::null_mut()),
            data,
            worker_id,
        }
    }

    /// Index of this worker in its context.
    pub fn id(&self) -> u16 {
        self.worker_id
    }

    /// The per-thread datum supplied at registration.
    pub fn data(&self) -> *mut () {
        self.data
    }

    pub fn context(&self) -> &SystemContext {
        unsafe { &*self.ctx }
    }

    /// Slot for the next job record, replacing the current block when it is
    /// exhausted (the worker's retention share moves to the new block).
    fn alloc_job(&self) -> *mut Job {
        let block = self.cur_block.get();
        if !block.is_null() {
            let slot = unsafe { (*block).new_job() };
            if !slot.is_null() {
                return slot;
            }
            // every slot share is issued now, drop our retention
            unsafe { JobBlock::deref(block) };
        }
        let block = JobBlock::alloc();
        self.cur_block.set(block);
        unsafe { (*block).new_job() }
    }

    /// Create a root job. It does not run until kicked.
    pub fn create_job(&self, function: JobFunction, data: *mut ()) -> JobHandle {
        self.create_job_inner(function, data, ptr::null())
    }

    /// Create a job tied to `parent`: the parent stays unfinished until
    /// every such child completed, which is what a fork-join wait observes.
    pub fn create_job_as_child(
        &self,
        parent: JobHandle,
        function: JobFunction,
        data: *mut (),
    ) -> JobHandle {
        self.create_job_inner(function, data, parent.0)
    }

    fn create_job_inner(
        &self,
        function: JobFunction,
        data: *mut (),
        parent: *const Job,
    ) -> JobHandle {
        let slot = self.alloc_job();
        let job = Job {
            owner: self as *const Worker,
            function,
            parent,
            data,
            alloc_block: self.cur_block.get(),
            job_id: self.context().next_job_id(),
            unfinished_jobs: AtomicU32::new(1),
            execute_worker_id: Cell::new(0),
            is_done: AtomicBool::new(false),
            is_waiting: Cell::new(false),
        };
        unsafe { slot.write(job) };
        if !parent.is_null() {
            unsafe { (*parent).unfinished_jobs.fetch_add(1, Ordering::Relaxed) };
        }
        JobHandle(slot)
    }

    /// Run a job to completion on this worker.
    pub fn execute(&self, job: JobHandle) {
        assert!(
            !job.is_done(),
            "job {} is done: owned by worker {}, executed by worker {}, handed to worker {}",
            job.id(),
            unsafe { (*job.owner).worker_id },
            job.execute_worker_id.get(),
            self.worker_id,
        );
        job.execute_worker_id.set(self.worker_id);
        (job.function)(self, job);
        job::finish(job);
    }

    /// The scheduling decision: the local queue first, otherwise steal a
    /// batch from a randomly chosen peer, run the first stolen job and
    /// requeue the surplus locally. A successful steal is expensive enough
    /// that taking several amortizes it and keeps follow-up work warm.
    pub fn get_valid_job(&self) -> Option<JobHandle> {
        if let Some(job) = self.queue.pop() {
            return Some(job);
        }
        let mut jar = [JobHandle(ptr::null()); STEAL_JAR];
        let n = self.queue.multi_push_avail((STEAL_JAR - 1) as u16);
        let ctx = self.context();
        let count = ctx.worker_count() as usize;
        let mut next = (self.rand.next() % count as u64) as usize;
        for _ in 0..count {
            let victim = ctx.worker_ptr(next);
            if victim != self as *const Worker {
                let stolen = unsafe { (*victim).queue.steal(n + 1, &mut jar) };
                if stolen > 0 {
                    if stolen > 1 {
                        self.queue.multi_push(&jar[1..stolen as usize]);
                    }
                    return Some(jar[0]);
                }
            }
            next += 1;
            if next == count {
                next = 0;
            }
        }
        None
    }

    /// Thread main loop for pool workers: run jobs until the context is
    /// deactivated. In-flight jobs are never preempted; the flag is only
    /// observed between jobs.
    pub fn wait_for_termination(&self) {
        let backoff = Backoff::new();
        while self.context().is_active() {
            match self.get_valid_job() {
                Some(job) => {
                    self.execute(job);
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }
    }

    /// Kick `job` and work until it and all of its descendants completed.
    /// The waiting thread takes part in execution instead of blocking on an
    /// OS primitive. Releases the job's block share on return; the handle
    /// must not be used afterwards.
    pub fn kick_and_wait_for(&self, job: JobHandle) {
        job.is_waiting.set(true);
        job.kick();
        let backoff = Backoff::new();
        while job.unfinished() != 0 {
            match self.get_valid_job() {
                Some(other) => {
                    self.execute(other);
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }
        // the finisher publishes is_done last; only then is the record
        // quiescent and the block share ours to drop
        while !job.is_done() {
            backoff.snooze();
        }
        unsafe { JobBlock::deref(job.alloc_block) };
    }

    /// Publish a batch, preferring bulk queue writes. When no contiguous
    /// run of slots is free, blocking-kick a single job and try again.
    pub fn kick_jobs(&self, jobs: &[JobHandle]) {
        let mut i = 0;
        while i < jobs.len() {
            let want = (jobs.len() - i).min(u16::MAX as usize) as u16;
            let n = self.queue.multi_push_avail(want) as usize;
            if n == 0 {
                jobs[i].kick();
                i += 1;
            } else {
                self.queue.multi_push(&jobs[i..i + n]);
                i += n;
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let block = self.cur_block.get();
        if !block.is_null() {
            unsafe {
                (*block).release_unissued();
                JobBlock::deref(block);
            }
        }
    }
}
