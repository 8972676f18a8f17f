use crate::job::Job;
use crate::job_allocator::LIVE_BLOCKS;
use crate::queue::{PackedIndex, Wsq, FULL_QUEUE_JOBS};
use crate::{
    global, try_initialize_global, JobHandle, JobSystem, SystemContext, Worker, WorkerHandle,
    MAX_WORKERS, QUEUE_CAPACITY,
};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

// Several tests assert on the process-wide live block counter, so systems
// from different tests must not overlap.
static SERIAL: Mutex<()> = Mutex::new(());

fn nop_job(_worker: &Worker, _job: JobHandle) {}

/// `job.data` points at an `AtomicU64` to bump.
fn bump_job(_worker: &Worker, job: JobHandle) {
    let counter = unsafe { &*(job.data() as *const AtomicU64) };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// `worker.data` points at a per-worker execution tally.
fn tally_one_job(worker: &Worker, _job: JobHandle) {
    let tally = unsafe { &*(worker.data() as *const CachePadded<AtomicU64>) };
    tally.fetch_add(1, Ordering::Relaxed);
}

/// Adds the job's integer payload to the executing worker's accumulator.
fn payload_job(worker: &Worker, job: JobHandle) {
    let acc = unsafe { &*(worker.data() as *const CachePadded<AtomicU64>) };
    acc.fetch_add(job.data() as usize as u64, Ordering::Relaxed);
}

struct FanOut {
    counter: AtomicU64,
    jobs: usize,
}

fn fan_out_root(worker: &Worker, job: JobHandle) {
    let fan = unsafe { &*(job.data() as *const FanOut) };
    let mut jar = Vec::with_capacity(256);
    let mut remaining = fan.jobs;
    while remaining > 0 {
        let batch = remaining.min(256);
        jar.clear();
        for _ in 0..batch {
            jar.push(worker.create_job_as_child(
                job,
                bump_job,
                &fan.counter as *const AtomicU64 as *mut (),
            ));
        }
        worker.kick_jobs(&jar);
        remaining -= batch;
    }
}

struct PayloadFan {
    jobs: usize,
}

fn payload_root(worker: &Worker, job: JobHandle) {
    let fan = unsafe { &*(job.data() as *const PayloadFan) };
    let mut jar = Vec::with_capacity(256);
    let mut next = 0usize;
    while next < fan.jobs {
        let batch = (fan.jobs - next).min(256);
        jar.clear();
        for _ in 0..batch {
            jar.push(worker.create_job_as_child(job, payload_job, next as *mut ()));
            next += 1;
        }
        worker.kick_jobs(&jar);
    }
}

struct DeepFan {
    counter: AtomicU64,
    children: usize,
    grandchildren: usize,
}

fn deep_root(worker: &Worker, job: JobHandle) {
    let fan = unsafe { &*(job.data() as *const DeepFan) };
    fan.counter.fetch_add(1, Ordering::Relaxed);
    let mut jar = Vec::with_capacity(256);
    let mut remaining = fan.children;
    while remaining > 0 {
        let batch = remaining.min(256);
        jar.clear();
        for _ in 0..batch {
            jar.push(worker.create_job_as_child(job, deep_mid, job.data()));
        }
        worker.kick_jobs(&jar);
        remaining -= batch;
    }
}

fn deep_mid(worker: &Worker, job: JobHandle) {
    let fan = unsafe { &*(job.data() as *const DeepFan) };
    fan.counter.fetch_add(1, Ordering::Relaxed);
    let mut jar = Vec::with_capacity(fan.grandchildren);
    for _ in 0..fan.grandchildren {
        jar.push(worker.create_job_as_child(
            job,
            bump_job,
            &fan.counter as *const AtomicU64 as *mut (),
        ));
    }
    worker.kick_jobs(&jar);
}

/// Detached job records for exercising the queue on its own.
fn dummy_jobs(n: usize) -> Vec<Job> {
    (0..n)
        .map(|id| Job {
            owner: ptr::null(),
            function: nop_job,
            parent: ptr::null(),
            data: ptr::null_mut(),
            alloc_block: ptr::null_mut(),
            job_id: id as u64,
            unfinished_jobs: AtomicU32::new(1),
            execute_worker_id: Cell::new(0),
            is_done: AtomicBool::new(false),
            is_waiting: Cell::new(false),
        })
        .collect()
}

#[test]
fn packed_index_round_trips() {
    let i = PackedIndex::new(0x1234, 0x5678, 0x9abc, 0xdef0);
    assert_eq!(PackedIndex::unpack(i.pack()), i);
    assert_eq!(i.pack(), 0x1234_5678_9abc_def0);
    assert_eq!(PackedIndex::unpack(0), PackedIndex::new(0, 0, 0, 0));
}

#[test]
fn owner_pop_is_lifo() {
    let _guard = SERIAL.lock();
    let jobs = dummy_jobs(4);
    let queue = Wsq::new();
    for job in &jobs {
        assert!(queue.try_push(JobHandle(job)));
    }
    for job in jobs.iter().rev() {
        let popped = queue.pop().expect("queue should not be empty");
        assert!(ptr::eq(popped.0, job));
    }
    assert!(queue.pop().is_none());
}

#[test]
fn steal_takes_half_plus_one_from_the_top() {
    let _guard = SERIAL.lock();
    let jobs = dummy_jobs(10);
    let queue = Wsq::new();
    for job in &jobs {
        assert!(queue.try_push(JobHandle(job)));
    }

    let mut jar = [JobHandle(ptr::null()); 64];
    let stolen = queue.steal(63, &mut jar);
    assert_eq!(stolen, 6); // 10 / 2 + 1
    for (k, job) in jobs[..6].iter().enumerate() {
        assert!(ptr::eq(jar[k].0, job));
    }

    // the rest stays with the owner
    let mut left = 0;
    while queue.pop().is_some() {
        left += 1;
    }
    assert_eq!(left, 4);
}

#[test]
fn multi_push_publishes_in_order() {
    let _guard = SERIAL.lock();
    let jobs = dummy_jobs(5);
    let queue = Wsq::new();
    let handles: Vec<JobHandle> = jobs.iter().map(|job| JobHandle(job)).collect();
    queue.multi_push(&handles);

    let mut jar = [JobHandle(ptr::null()); 64];
    assert_eq!(queue.steal(63, &mut jar), 3);
    for k in 0..3 {
        assert!(ptr::eq(jar[k].0, &jobs[k]));
    }
    assert!(ptr::eq(queue.pop().unwrap().0, &jobs[4]));
    assert!(ptr::eq(queue.pop().unwrap().0, &jobs[3]));
    assert!(queue.pop().is_none());
}

#[test]
fn multi_push_avail_respects_occupied_slots() {
    let _guard = SERIAL.lock();
    let jobs = dummy_jobs(3);
    let queue = Wsq::new();
    assert_eq!(queue.multi_push_avail(63), 63);

    for job in &jobs {
        assert!(queue.try_push(JobHandle(job)));
    }
    // the slots at the steal end are occupied now
    assert_eq!(queue.multi_push_avail(63), 0);

    while queue.pop().is_some() {}
    assert_eq!(queue.multi_push_avail(63), 63);
}

#[test]
fn push_refuses_past_head_room() {
    let _guard = SERIAL.lock();
    assert_eq!(FULL_QUEUE_JOBS as usize, QUEUE_CAPACITY - MAX_WORKERS);
    let jobs = dummy_jobs(1);
    let queue = Wsq::new();
    let handle = JobHandle(&jobs[0]);
    for _ in 0..FULL_QUEUE_JOBS {
        assert!(queue.try_push(handle));
    }
    assert!(!queue.try_push(handle));
}

#[test]
fn indices_wrap_around_the_ring() {
    let _guard = SERIAL.lock();
    let jobs = dummy_jobs(8);
    let queue = Wsq::new();
    // enough laps to take bottom and top past the 16-bit boundary
    for _ in 0..(QUEUE_CAPACITY / 8 + 3) {
        for job in &jobs {
            assert!(queue.try_push(JobHandle(job)));
        }
        for _ in 0..8 {
            assert!(queue.pop().is_some());
        }
    }
    assert!(queue.pop().is_none());
}

#[test]
fn stealing_moves_every_job_exactly_once() {
    let _guard = SERIAL.lock();
    const JOBS: usize = 10_000;
    const THIEVES: usize = 3;
    let jobs = dummy_jobs(JOBS);
    let queue = Wsq::new();
    let taken: Vec<AtomicBool> = (0..JOBS).map(|_| AtomicBool::new(false)).collect();
    let produced_all = AtomicBool::new(false);

    let mark = |handle: JobHandle| {
        let id = handle.id() as usize;
        assert!(
            !taken[id].swap(true, Ordering::Relaxed),
            "job {} taken twice",
            id
        );
    };

    thread::scope(|scope| {
        for _ in 0..THIEVES {
            scope.spawn(|| {
                let mut jar = [JobHandle(ptr::null()); 64];
                loop {
                    let n = queue.steal(8, &mut jar);
                    if n == 0 {
                        if produced_all.load(Ordering::Acquire) {
                            break;
                        }
                        std::hint::spin_loop();
                        continue;
                    }
                    for handle in &jar[..n as usize] {
                        mark(*handle);
                    }
                }
            });
        }

        let mut pushed = 0;
        while pushed < JOBS {
            if queue.try_push(JobHandle(&jobs[pushed])) {
                pushed += 1;
            } else if let Some(handle) = queue.pop() {
                mark(handle);
            }
        }
        produced_all.store(true, Ordering::Release);
        while let Some(handle) = queue.pop() {
            mark(handle);
        }
    });

    let moved = taken.iter().filter(|t| t.load(Ordering::Relaxed)).count();
    assert_eq!(moved, JOBS);
}

#[test]
fn single_job_runs_once() {
    let _guard = SERIAL.lock();
    let counter = AtomicU64::new(0);
    {
        let sys = JobSystem::new(1);
        let main = sys.main_worker();
        let job = main.create_job(bump_job, &counter as *const AtomicU64 as *mut ());
        main.kick_and_wait_for(job);
    }
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn job_ids_are_contiguous() {
    let _guard = SERIAL.lock();
    let counter = AtomicU64::new(0);
    let sys = JobSystem::new(1);
    let main = sys.main_worker();

    let jobs: Vec<JobHandle> = (0..64)
        .map(|_| main.create_job(bump_job, &counter as *const AtomicU64 as *mut ()))
        .collect();
    for (expected, job) in jobs.iter().enumerate() {
        assert_eq!(job.id(), expected as u64);
    }

    for job in &jobs {
        job.kick();
    }
    while counter.load(Ordering::Relaxed) < 64 {
        match main.get_valid_job() {
            Some(job) => main.execute(job),
            None => std::hint::spin_loop(),
        }
    }
}

#[test]
fn single_worker_matches_serial() {
    let _guard = SERIAL.lock();
    const JOBS: usize = 1000;
    let acc = CachePadded::new(AtomicU64::new(0));
    let ctx = SystemContext::new();
    ctx.activate();
    let main = ctx.register_worker(7, &acc as *const CachePadded<AtomicU64> as *mut ());

    let fan = PayloadFan { jobs: JOBS };
    let root = main.create_job(payload_root, &fan as *const PayloadFan as *mut ());
    main.kick_and_wait_for(root);
    ctx.deactivate();

    let serial: u64 = (0..JOBS as u64).sum();
    assert_eq!(acc.load(Ordering::Relaxed), serial);
}

#[test]
fn fan_out_completes() {
    let _guard = SERIAL.lock();
    let fan = FanOut {
        counter: AtomicU64::new(0),
        jobs: 10_000,
    };
    {
        let sys = JobSystem::new(8);
        let main = sys.main_worker();
        let root = main.create_job(fan_out_root, &fan as *const FanOut as *mut ());
        main.kick_and_wait_for(root);
        // the wait covers the whole subtree, not just the root body
        assert_eq!(fan.counter.load(Ordering::Relaxed), 10_000);
    }
}

#[test]
fn fan_out_matches_serial_sum() {
    let _guard = SERIAL.lock();
    const WORKERS: usize = 8;
    const JOBS: usize = 10_000;
    let accumulators: Vec<CachePadded<AtomicU64>> = (0..WORKERS)
        .map(|_| CachePadded::new(AtomicU64::new(0)))
        .collect();

    let ctx = SystemContext::new();
    ctx.activate();
    let handles: Vec<WorkerHandle> = accumulators
        .iter()
        .enumerate()
        .map(|(id, acc)| {
            ctx.register_worker(
                0x9e37_79b9 + id as u64,
                acc as *const CachePadded<AtomicU64> as *mut (),
            )
        })
        .collect();
    let threads: Vec<_> = handles[1..]
        .iter()
        .copied()
        .map(|worker| thread::spawn(move || worker.wait_for_termination()))
        .collect();

    let main = handles[0];
    let fan = PayloadFan { jobs: JOBS };
    let root = main.create_job(payload_root, &fan as *const PayloadFan as *mut ());
    main.kick_and_wait_for(root);
    ctx.deactivate();
    for t in threads {
        t.join().unwrap();
    }

    let parallel: u64 = accumulators
        .iter()
        .map(|acc| acc.load(Ordering::Relaxed))
        .sum();
    let serial: u64 = (0..JOBS as u64).sum();
    assert_eq!(parallel, serial);
}

#[test]
fn deep_fan_out_completes() {
    let _guard = SERIAL.lock();
    let fan = DeepFan {
        counter: AtomicU64::new(0),
        children: 1000,
        grandchildren: 10,
    };
    {
        let sys = JobSystem::new(4);
        let main = sys.main_worker();
        let root = main.create_job(deep_root, &fan as *const DeepFan as *mut ());
        main.kick_and_wait_for(root);
    }
    // root + children + grandchildren
    assert_eq!(fan.counter.load(Ordering::Relaxed), 1 + 1000 + 1000 * 10);
}

#[test]
fn steal_spreads_load() {
    let _guard = SERIAL.lock();
    const WORKERS: usize = 8;
    const JOBS: usize = 100_000;
    let tallies: Vec<CachePadded<AtomicU64>> = (0..WORKERS)
        .map(|_| CachePadded::new(AtomicU64::new(0)))
        .collect();

    let ctx = SystemContext::new();
    ctx.activate();
    let handles: Vec<WorkerHandle> = tallies
        .iter()
        .enumerate()
        .map(|(id, tally)| {
            ctx.register_worker(
                0xfeed_beef + id as u64,
                tally as *const CachePadded<AtomicU64> as *mut (),
            )
        })
        .collect();
    let threads: Vec<_> = handles[1..]
        .iter()
        .copied()
        .map(|worker| thread::spawn(move || worker.wait_for_termination()))
        .collect();

    // only worker 0 produces; everything else gets its work by stealing
    let main = handles[0];
    let mut jar = Vec::with_capacity(256);
    let mut produced = 0;
    while produced < JOBS {
        let batch = (JOBS - produced).min(256);
        jar.clear();
        for _ in 0..batch {
            jar.push(main.create_job(tally_one_job, ptr::null_mut()));
        }
        main.kick_jobs(&jar);
        produced += batch;
        // the producer is a worker too
        if let Some(job) = main.get_valid_job() {
            main.execute(job);
        }
    }

    let total = || {
        tallies
            .iter()
            .map(|tally| tally.load(Ordering::Relaxed))
            .sum::<u64>()
    };
    while total() < JOBS as u64 {
        match main.get_valid_job() {
            Some(job) => main.execute(job),
            None => std::hint::spin_loop(),
        }
    }
    ctx.deactivate();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(total(), JOBS as u64);
    for (id, tally) in tallies.iter().enumerate() {
        assert!(
            tally.load(Ordering::Relaxed) > 0,
            "worker {} never ran a job",
            id
        );
    }
}

#[test]
fn queue_pressure_blocks_and_drains() {
    let _guard = SERIAL.lock();
    const JOBS: usize = QUEUE_CAPACITY + 10;
    let counter = AtomicU64::new(0);

    let ctx = SystemContext::new();
    ctx.activate();
    let main = ctx.register_worker(1, ptr::null_mut());
    let consumer = ctx.register_worker(2, ptr::null_mut());
    let drain = thread::spawn(move || consumer.wait_for_termination());

    // more jobs than the queue holds; kick blocks whenever the head room
    // is gone, until the consumer frees space
    let mut jar = Vec::with_capacity(256);
    let mut produced = 0;
    while produced < JOBS {
        let batch = (JOBS - produced).min(256);
        jar.clear();
        for _ in 0..batch {
            jar.push(main.create_job(bump_job, &counter as *const AtomicU64 as *mut ()));
        }
        main.kick_jobs(&jar);
        produced += batch;
    }
    while counter.load(Ordering::Relaxed) < JOBS as u64 {
        match main.get_valid_job() {
            Some(job) => main.execute(job),
            None => std::hint::spin_loop(),
        }
    }
    ctx.deactivate();
    drain.join().unwrap();

    assert_eq!(counter.load(Ordering::Relaxed), JOBS as u64);
}

#[test]
fn shutdown_frees_every_block() {
    let _guard = SERIAL.lock();
    let baseline = LIVE_BLOCKS.load(Ordering::Relaxed);
    let fan = FanOut {
        counter: AtomicU64::new(0),
        jobs: 3000, // enough to go through several allocation blocks
    };
    {
        let sys = JobSystem::new(2);
        let main = sys.main_worker();
        let root = main.create_job(fan_out_root, &fan as *const FanOut as *mut ());
        main.kick_and_wait_for(root);
        assert_eq!(fan.counter.load(Ordering::Relaxed), 3000);
    }
    assert_eq!(LIVE_BLOCKS.load(Ordering::Relaxed), baseline);
}

#[test]
fn global_context_initializes_once() {
    let _guard = SERIAL.lock();
    let ctx = SystemContext::new();
    try_initialize_global(ctx.clone()).expect("first initialization should win");
    assert!(Arc::ptr_eq(global(), &ctx));
    assert!(try_initialize_global(SystemContext::new()).is_err());
}
