//! End-to-end scenarios for the thread pool: broadcast ordering across
//! workers, and synchronization-context exclusivity.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mprpc_threadpool::{PoolConfig, ThreadPool};

/// Per-worker scratch state for the broadcast scenario.
#[derive(Default)]
struct WorkerState {
    /// Broadcast ids, in the order this worker ran them.
    mcasts: Vec<u64>,
    /// Sum of unicast task values this worker ran.
    sum: u64,
}

#[test]
fn broadcasts_are_totally_ordered_across_workers() {
    const TASKS: u64 = 1000;
    const EVERY: u64 = 10;

    let reports: Arc<Mutex<Vec<WorkerState>>> = Arc::new(Mutex::new(Vec::new()));
    let reports_sink = Arc::clone(&reports);

    let mut pool: ThreadPool<u64, u64> = ThreadPool::start(
        &PoolConfig::new(4, 32),
        |_| WorkerState::default(),
        move |_, state: &mut WorkerState| {
            reports_sink.lock().unwrap().push(std::mem::take(state));
        },
        |task, state: &mut WorkerState| {
            state.sum += task;
        },
        |mcast, state: &mut WorkerState| {
            state.mcasts.push(*mcast);
        },
    )
    .unwrap();

    for i in 1..=TASKS {
        pool.push_one(i).unwrap();
        if i % EVERY == 0 {
            pool.push_all(i / EVERY).unwrap();
        }
    }
    pool.stop();

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 4);

    // Every worker ran every broadcast exactly once, in the same order.
    let expected: Vec<u64> = (1..=TASKS / EVERY).collect();
    for report in reports.iter() {
        assert_eq!(report.mcasts, expected);
    }

    // No unicast task was lost or duplicated.
    let total: u64 = reports.iter().map(|r| r.sum).sum();
    assert_eq!(total, TASKS * (TASKS + 1) / 2);
}

/// Shared bookkeeping for one synchronization context under test.
#[derive(Default)]
struct CtxState {
    /// Set while a task of this context is running.
    busy: AtomicBool,
    /// The sequence number the next task of this context must carry.
    expected: AtomicU64,
}

/// A task bound to one of the test contexts.
struct CtxTask {
    /// Which context the task belongs to.
    ctx: usize,
    /// Its submission sequence within that context.
    seq: u64,
}

#[test]
fn context_tasks_are_serial_and_ordered() {
    const PER_CONTEXT: u64 = 200;

    let states: Arc<[CtxState; 2]> = Arc::new([CtxState::default(), CtxState::default()]);
    let violations = Arc::new(AtomicUsize::new(0));

    let states_run = Arc::clone(&states);
    let violations_run = Arc::clone(&violations);
    let mut pool: ThreadPool<CtxTask, ()> = ThreadPool::start(
        &PoolConfig::new(4, 16),
        |_| (),
        |_, _: &mut ()| {},
        move |task: CtxTask, _| {
            let state = &states_run[task.ctx];
            if state.busy.swap(true, Ordering::SeqCst) {
                // Another task of the same context is mid-flight.
                violations_run.fetch_add(1, Ordering::SeqCst);
            }
            if state.expected.fetch_add(1, Ordering::SeqCst) != task.seq {
                // Out of submission order.
                violations_run.fetch_add(1, Ordering::SeqCst);
            }
            // Stretch the critical section to make overlap likely if the
            // exclusivity guarantee were broken.
            for _ in 0..50 {
                std::hint::spin_loop();
            }
            state.busy.store(false, Ordering::SeqCst);
        },
        |_, _| {},
    )
    .unwrap();

    let c1 = pool.create_synchronization_context();
    let c2 = pool.create_synchronization_context();
    for seq in 0..PER_CONTEXT {
        c1.push(CtxTask { ctx: 0, seq }).unwrap();
        c2.push(CtxTask { ctx: 1, seq }).unwrap();
    }
    pool.stop();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(states[0].expected.load(Ordering::SeqCst), PER_CONTEXT);
    assert_eq!(states[1].expected.load(Ordering::SeqCst), PER_CONTEXT);
}

#[test]
fn tasks_can_push_follow_up_work() {
    // Each task below a threshold pushes two children; the sum of all
    // executed values is known in advance.  Exercises producers that are
    // themselves workers.
    #[derive(Clone)]
    struct Chain {
        /// Depth left to fan out.
        depth: u32,
    }

    let executed = Arc::new(AtomicU64::new(0));
    let executed_run = Arc::clone(&executed);
    let pool_slot: Arc<Mutex<Option<Arc<ThreadPool<Chain, ()>>>>> =
        Arc::new(Mutex::new(None));
    let pool_run = Arc::clone(&pool_slot);

    let pool = Arc::new(
        ThreadPool::start(
            &PoolConfig::new(4, 256),
            |_| (),
            |_, _: &mut ()| {},
            move |task: Chain, _| {
                executed_run.fetch_add(1, Ordering::Relaxed);
                if task.depth > 0 {
                    let pool = pool_run.lock().unwrap().clone().unwrap();
                    for _ in 0..2 {
                        pool.push_one(Chain {
                            depth: task.depth - 1,
                        })
                        .unwrap();
                    }
                }
            },
            |_, _| {},
        )
        .unwrap(),
    );
    *pool_slot.lock().unwrap() = Some(Arc::clone(&pool));

    pool.push_one(Chain { depth: 6 }).unwrap();

    // A full binary fan-out of depth 6 executes 2^7 - 1 tasks.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while executed.load(Ordering::Relaxed) < 127 {
        assert!(std::time::Instant::now() < deadline, "chain stalled");
        std::thread::yield_now();
    }
    assert_eq!(executed.load(Ordering::Relaxed), 127);

    // No task clones the handle again once the fan-out is done; wait for
    // the in-flight clones to drop so the teardown happens on this thread.
    drop(pool_slot.lock().unwrap().take());
    while Arc::strong_count(&pool) > 1 {
        assert!(std::time::Instant::now() < deadline, "worker kept the pool");
        std::thread::yield_now();
    }
    match Arc::try_unwrap(pool) {
        Ok(mut pool) => pool.stop(),
        Err(_) => panic!("pool still referenced"),
    }
}
