use crate::worker_thread::{Worker, WorkerHandle};
use crate::MAX_WORKERS;
use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use std::array;
use std::fmt::{Debug, Formatter};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The global state of one scheduling domain: the registered workers, the
/// monotonic job id counter and the active flag every worker loop polls.
pub struct SystemContext {
    workers: [AtomicPtr<Worker>; MAX_WORKERS],
    worker_count: AtomicU32,
    job_counter: CachePadded<AtomicU64>,
    active: AtomicBool,
}

impl SystemContext {
    /// Workers keep a pointer back to their context, so a context lives
    /// behind an `Arc` from the start and never moves.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            worker_count: AtomicU32::new(0),
            job_counter: CachePadded::new(AtomicU64::new(0)),
            active: AtomicBool::new(false),
        })
    }

    /// Append a worker and hand back the reference its thread will drive.
    /// Registration itself is not synchronized: register every worker from
    /// one thread, before any of them starts running.
    pub fn register_worker(&self, seed: u64, data: *mut ()) -> WorkerHandle {
        let id = self.worker_count.load(Ordering::Relaxed);
        debug_assert!((id as usize) < MAX_WORKERS, "worker limit exceeded");
        let worker = Box::into_raw(Box::new(Worker::new(self, id as u16, seed, data)));
        // pointer first, count second: a thief scanning up to the count
        // can never observe an unpublished slot
        self.workers[id as usize].store(worker, Ordering::Release);
        self.worker_count.store(id + 1, Ordering::Release);
        WorkerHandle(worker)
    }

    /// Workers run until this is cleared again.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count.load(Ordering::Acquire)
    }

    pub(crate) fn worker_ptr(&self, index: usize) -> *const Worker {
        self.workers[index].load(Ordering::Acquire)
    }

    pub(crate) fn next_job_id(&self) -> u64 {
        self.job_counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Debug for SystemContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("worker_count", &self.worker_count)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for SystemContext {
    fn drop(&mut self) {
        for slot in &self.workers {
            let worker = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !worker.is_null() {
                unsafe { drop(Box::from_raw(worker)) };
            }
        }
    }
}

static GLOBAL_CONTEXT: OnceCell<Arc<SystemContext>> = OnceCell::new();

/// The process-wide context. Panics when it was never initialized.
pub fn global() -> &'static Arc<SystemContext> {
    GLOBAL_CONTEXT
        .get()
        .expect("global job system context was not initialized")
}

pub fn initialize_global(ctx: Arc<SystemContext>) {
    GLOBAL_CONTEXT
        .set(ctx)
        .expect("global job system context was already initialized");
}

pub fn try_initialize_global(ctx: Arc<SystemContext>) -> Result<(), Arc<SystemContext>> {
    GLOBAL_CONTEXT.set(ctx)
}
