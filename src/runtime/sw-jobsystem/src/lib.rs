//! A work-stealing job scheduler for fork-join parallelism.
//!
//! Every worker owns a bounded lock-free deque: the owner pushes and pops
//! at the bottom, idle peers steal from the top. Jobs may spawn child jobs
//! and a parent counts as unfinished until its whole subtree completed, so
//! a thread can kick a root job and wait for the result while taking part
//! in execution itself. Job records live in per-worker slabs reclaimed by
//! reference count; nothing in the scheduler takes a lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use sw_core::sw_info;

/// No more than this many workers may register with one context.
pub const MAX_WORKERS: usize = 64;
/// Slots in each worker's queue. Must stay a power of two no larger than
/// 2^16; the packed queue index carries 16-bit fields.
pub const QUEUE_CAPACITY: usize = 64 * 1024;

mod ctx;
mod job;
mod job_allocator;
mod queue;
mod worker_thread;

pub use ctx::{global, initialize_global, try_initialize_global, SystemContext};
pub use job::{Job, JobFunction, JobHandle};
pub use worker_thread::{Worker, WorkerHandle};

#[cfg(test)]
mod tests;

/// A ready-made thread pool over [`SystemContext`]: worker 0 belongs to
/// the creating thread, every other worker gets an OS thread running
/// [`Worker::wait_for_termination`]. Dropping the system deactivates the
/// context and joins the pool; queued jobs are not preempted.
pub struct JobSystem {
    ctx: Arc<SystemContext>,
    main: WorkerHandle,
    threads: Vec<JoinHandle<()>>,
}

impl JobSystem {
    pub fn new(worker_count: usize) -> Self {
        assert!(
            (1..=MAX_WORKERS).contains(&worker_count),
            "a job system needs between 1 and {} workers",
            MAX_WORKERS
        );
        sw_info!("creating job system with {} workers", worker_count);

        let ctx = SystemContext::new();
        ctx.activate();

        let main = ctx.register_worker(hashed_seed(), ptr::null_mut());
        let mut workers = Vec::with_capacity(worker_count - 1);
        for _ in 1..worker_count {
            workers.push(ctx.register_worker(main.rand.next(), ptr::null_mut()));
        }

        // every worker is registered before the first thread may steal
        let threads = workers
            .into_iter()
            .map(|worker| {
                thread::Builder::new()
                    .name(format!("sw-worker-{}", worker.id()))
                    .spawn(move || {
                        sw_core::thread::adopt_current_thread_name();
                        worker.wait_for_termination();
                    })
                    .unwrap()
            })
            .collect();

        Self { ctx, main, threads }
    }

    /// The worker owned by the thread that built the system.
    pub fn main_worker(&self) -> WorkerHandle {
        self.main
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.ctx
    }

    /// Logical CPUs, the usual upper bound for a pool size.
    pub fn cpu_thread_count() -> usize {
        num_cpus::get()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.ctx.deactivate();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Any non-zero seed will do; hash a global counter.
fn hashed_seed() -> u64 {
    let mut seed = 0;
    while seed == 0 {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let mut hasher = DefaultHasher::new();
        hasher.write_usize(COUNTER.fetch_add(1, Ordering::Relaxed));
        seed = hasher.finish();
    }
    seed
}
