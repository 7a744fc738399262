//! The thread pool proper: configuration, the worker loop, and the public
//! submission surface.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::context::ContextStub;
use crate::error::TryPushError;
use crate::mcast::McastLog;
use crate::slot::Slot;
use crate::{Error, Result};

/// Sizing of a [`ThreadPool`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// Number of worker threads.
    thread_count: usize,
    /// Number of ring slots; raised to `thread_count` if smaller.
    capacity: usize,
}

impl PoolConfig {
    /// Return a configuration with the given worker and slot counts.
    pub const fn new(thread_count: usize, capacity: usize) -> Self {
        PoolConfig {
            thread_count,
            capacity,
        }
    }

    /// Return the number of worker threads.
    pub const fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Return the effective ring capacity.
    pub const fn capacity(&self) -> usize {
        if self.capacity > self.thread_count {
            self.capacity
        } else {
            self.thread_count
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            thread_count: 2,
            capacity: 1024,
        }
    }
}

/// What travels through a ring slot.
enum Payload<T> {
    /// A unicast task.
    Task(T),
    /// A task bound to a synchronization context.
    ContextTask {
        /// The task itself.
        task: T,
        /// Its submission sequence number within the context.
        seq: u64,
        /// The context it belongs to.
        ctx: Arc<ContextStub<T>>,
    },
    /// No work of its own; exists to make an idle worker visit the
    /// broadcast log.
    McastWake,
}

/// State shared between the pool handle and its workers.
struct Shared<T, M> {
    /// Cleared by [`ThreadPool::stop`]; gates every submission.
    running: AtomicBool,
    /// Producer ticket counter.
    push_index: AtomicUsize,
    /// Consumer ticket counter.
    pop_index: AtomicUsize,
    /// Number of payloads pushed and not yet taken; only consulted by
    /// `try_push_one`'s capacity check.
    queued: AtomicUsize,
    /// The ring.
    slots: Box<[Slot<Payload<T>>]>,
    /// The ordered broadcast log.
    mcast: McastLog<M>,
    /// Number of workers; broadcast wake-ups push one marker each.
    thread_count: usize,
}

impl<T, M> Shared<T, M> {
    /// Claim the next producer ticket and fill its slot, blocking while the
    /// slot is occupied.
    fn fill_next(&self, payload: Payload<T>) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let ticket = self.push_index.fetch_add(1, Ordering::Relaxed);
        self.slots[ticket % self.slots.len()].fill(payload);
    }

    /// Gate on `running`, then push.
    fn push_payload(&self, payload: Payload<T>) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.fill_next(payload);
        Ok(())
    }
}

/// A fixed pool of worker threads fed by a bounded ring of task slots.
///
/// `T` is the unicast/synchronized task type, `M` the broadcast type.  The
/// worker-context type `W` is chosen at [`start`](ThreadPool::start) time:
/// each worker builds one with `on_start` and every task and broadcast it
/// runs borrows it mutably, so per-worker scratch state needs no locking.
pub struct ThreadPool<T, M>
where
    T: Send + 'static,
    M: Send + Sync + 'static,
{
    /// State shared with the workers.
    shared: Arc<Shared<T, M>>,
    /// Join handles, drained by [`stop`](ThreadPool::stop).
    threads: Vec<thread::JoinHandle<()>>,
}

impl<T, M> ThreadPool<T, M>
where
    T: Send + 'static,
    M: Send + Sync + 'static,
{
    /// Start a pool.
    ///
    /// `on_start(worker_index)` runs first on each worker thread and builds
    /// its context value; `on_stop(worker_index, &mut ctx)` runs last.
    /// `task_fn` runs every unicast and synchronized task; `mcast_fn` runs
    /// every broadcast, once per worker.
    pub fn start<W, SF, PF, TF, MF>(
        config: &PoolConfig,
        on_start: SF,
        on_stop: PF,
        task_fn: TF,
        mcast_fn: MF,
    ) -> Result<Self>
    where
        W: 'static,
        SF: Fn(usize) -> W + Send + Sync + 'static,
        PF: Fn(usize, &mut W) + Send + Sync + 'static,
        TF: Fn(T, &mut W) + Send + Sync + 'static,
        MF: Fn(&M, &mut W) + Send + Sync + 'static,
    {
        if config.thread_count == 0 {
            return Err(Error::Configuration("thread_count must be nonzero"));
        }
        let capacity = config.capacity();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            push_index: AtomicUsize::new(0),
            pop_index: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            mcast: McastLog::new(config.thread_count),
            thread_count: config.thread_count,
        });
        let on_start = Arc::new(on_start);
        let on_stop = Arc::new(on_stop);
        let task_fn = Arc::new(task_fn);
        let mcast_fn = Arc::new(mcast_fn);

        let mut pool = ThreadPool {
            shared: Arc::clone(&shared),
            threads: Vec::with_capacity(config.thread_count),
        };
        for worker_index in 0..config.thread_count {
            let shared = Arc::clone(&shared);
            let on_start = Arc::clone(&on_start);
            let on_stop = Arc::clone(&on_stop);
            let task_fn = Arc::clone(&task_fn);
            let mcast_fn = Arc::clone(&mcast_fn);
            let spawned = thread::Builder::new()
                .name(format!("mprpc-pool-{worker_index}"))
                .spawn(move || {
                    let mut wctx = on_start(worker_index);
                    worker_loop(&shared, worker_index, &mut wctx, &*task_fn, &*mcast_fn);
                    on_stop(worker_index, &mut wctx);
                });
            match spawned {
                Ok(handle) => pool.threads.push(handle),
                Err(e) => {
                    // Unwind the workers we already have.
                    pool.stop();
                    return Err(Error::Spawn(Arc::new(e)));
                }
            }
        }
        Ok(pool)
    }

    /// Enqueue a unicast task, blocking while the ring is at capacity.
    pub fn push_one(&self, task: T) -> Result<()> {
        self.shared.push_payload(Payload::Task(task))
    }

    /// Enqueue a unicast task without blocking on capacity.
    ///
    /// May still wait briefly for a racing producer or consumer touching
    /// the same slot; it never waits for capacity to open up.
    pub fn try_push_one(&self, task: T) -> std::result::Result<(), TryPushError<T>> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TryPushError::ShuttingDown(task));
        }
        if self.shared.queued.load(Ordering::Acquire) >= self.shared.slots.len() {
            return Err(TryPushError::Full(task));
        }
        self.shared.fill_next(Payload::Task(task));
        Ok(())
    }

    /// Enqueue a broadcast.
    ///
    /// Every worker runs it exactly once, and any two broadcasts are
    /// observed in the same order by every worker.
    pub fn push_all(&self, mcast: M) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.shared.mcast.push(mcast);
        // One wake-up per worker; busy workers catch up on their own.
        for _ in 0..self.shared.thread_count {
            self.shared.fill_next(Payload::McastWake);
        }
        Ok(())
    }

    /// Return a new synchronization context on this pool.
    pub fn create_synchronization_context(&self) -> SynchronizationContext<T, M> {
        SynchronizationContext {
            shared: Arc::clone(&self.shared),
            stub: Arc::new(ContextStub::new()),
        }
    }

    /// Stop accepting work, run everything already queued, and join the
    /// workers.  Idempotent.
    pub fn stop(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            trace!(workers = self.threads.len(), "stopping pool");
            for _ in 0..self.threads.len() {
                let ticket = self.shared.push_index.fetch_add(1, Ordering::Relaxed);
                self.shared.slots[ticket % self.shared.slots.len()].fill_stop();
            }
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T, M> Drop for ThreadPool<T, M>
where
    T: Send + 'static,
    M: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// An owning handle conferring serialized, in-order execution of its tasks.
///
/// Tasks pushed through one context never overlap and run in push order, on
/// whatever worker is free.  Dropping the handle releases the context once
/// in-flight tasks have drained; the pool keeps it alive until then.
pub struct SynchronizationContext<T, M> {
    /// The pool the context schedules on.
    shared: Arc<Shared<T, M>>,
    /// The context's shared stub.
    stub: Arc<ContextStub<T>>,
}

impl<T, M> SynchronizationContext<T, M>
where
    T: Send + 'static,
    M: Send + Sync + 'static,
{
    /// Enqueue a task to run exclusively with respect to every other task
    /// of this context, blocking while the ring is at capacity.
    pub fn push(&self, task: T) -> Result<()> {
        let seq = self.stub.next_sequence();
        self.shared.push_payload(Payload::ContextTask {
            task,
            seq,
            ctx: Arc::clone(&self.stub),
        })
    }
}

/// The body of one worker thread.
fn worker_loop<T, M, W, TF, MF>(
    shared: &Shared<T, M>,
    worker_index: usize,
    wctx: &mut W,
    task_fn: &TF,
    mcast_fn: &MF,
) where
    TF: Fn(T, &mut W),
    MF: Fn(&M, &mut W),
{
    loop {
        let ticket = shared.pop_index.fetch_add(1, Ordering::Relaxed);
        let payload = shared.slots[ticket % shared.slots.len()].take();
        // Run any broadcasts this worker has not seen, in log order,
        // before whatever the slot held.
        for mcast in shared.mcast.catch_up(worker_index) {
            mcast_fn(&mcast, wctx);
        }
        let Some(payload) = payload else {
            break;
        };
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        match payload {
            Payload::Task(task) => task_fn(task, wctx),
            Payload::ContextTask { task, seq, ctx } => {
                ctx.deliver(seq, task, |t| task_fn(t, wctx));
            }
            Payload::McastWake => {}
        }
    }
    // A final catch-up so shutdown strands no broadcast on this worker.
    for mcast in shared.mcast.catch_up(worker_index) {
        mcast_fn(&mcast, wctx);
    }
    trace!(worker_index, "worker exiting");
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::{Condvar, Mutex};

    /// A latch a task can block on until the test releases it.
    struct Gate {
        /// Whether the gate is open.
        open: Mutex<bool>,
        /// Signalled on open.
        cond: Condvar,
    }

    impl Gate {
        fn new() -> Self {
            Gate {
                open: Mutex::new(false),
                cond: Condvar::new(),
            }
        }
        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }

    /// Tasks used by the tests below.
    enum TestTask {
        /// Add the value to the shared sum.
        Add(u64),
        /// Block until the gate opens, then add one.
        Block(Arc<Gate>),
    }

    fn start_pool(
        config: &PoolConfig,
        sum: Arc<AtomicU64>,
    ) -> ThreadPool<TestTask, u64> {
        ThreadPool::start(
            config,
            |_| (),
            |_, _: &mut ()| {},
            move |task, _| match task {
                TestTask::Add(v) => {
                    sum.fetch_add(v, Ordering::Relaxed);
                }
                TestTask::Block(gate) => {
                    gate.wait();
                    sum.fetch_add(1, Ordering::Relaxed);
                }
            },
            |_, _| {},
        )
        .unwrap()
    }

    #[test]
    fn unicast_runs_everything() {
        let sum = Arc::new(AtomicU64::new(0));
        let mut pool = start_pool(&PoolConfig::new(4, 16), Arc::clone(&sum));
        for i in 1..=1000 {
            pool.push_one(TestTask::Add(i)).unwrap();
        }
        pool.stop();
        assert_eq!(sum.load(Ordering::Relaxed), 500_500);
    }

    #[test]
    fn zero_threads_rejected() {
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = Arc::clone(&sum);
        let r: Result<ThreadPool<TestTask, u64>> = ThreadPool::start(
            &PoolConfig::new(0, 4),
            |_| (),
            |_, _: &mut ()| {},
            move |_, _| {
                sum2.fetch_add(1, Ordering::Relaxed);
            },
            |_, _| {},
        );
        assert!(matches!(r, Err(Error::Configuration(_))));
    }

    #[test]
    fn submission_after_stop_fails() {
        let sum = Arc::new(AtomicU64::new(0));
        let mut pool = start_pool(&PoolConfig::new(2, 8), Arc::clone(&sum));
        pool.stop();
        assert!(matches!(
            pool.push_one(TestTask::Add(1)),
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            pool.try_push_one(TestTask::Add(1)),
            Err(TryPushError::ShuttingDown(_))
        ));
        assert!(matches!(pool.push_all(9), Err(Error::ShuttingDown)));
        assert_eq!(sum.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn try_push_reports_full() {
        let sum = Arc::new(AtomicU64::new(0));
        let gate = Arc::new(Gate::new());
        let mut pool = start_pool(&PoolConfig::new(1, 2), Arc::clone(&sum));

        // Occupy the single worker…
        pool.push_one(TestTask::Block(Arc::clone(&gate))).unwrap();
        // …and fill the ring behind it.
        pool.push_one(TestTask::Add(10)).unwrap();
        pool.push_one(TestTask::Add(20)).unwrap();

        let rejected = pool.try_push_one(TestTask::Add(40));
        let rejected_task = match rejected {
            Err(TryPushError::Full(task)) => task,
            other => panic!("expected Full, got {:?}", other.err()),
        };
        // The task comes back intact.
        assert!(matches!(rejected_task, TestTask::Add(40)));

        gate.release();
        pool.stop();
        assert_eq!(sum.load(Ordering::Relaxed), 31);
    }

    #[test]
    fn stop_is_idempotent() {
        let sum = Arc::new(AtomicU64::new(0));
        let mut pool = start_pool(&PoolConfig::new(2, 8), Arc::clone(&sum));
        pool.push_one(TestTask::Add(5)).unwrap();
        pool.stop();
        pool.stop();
        assert_eq!(sum.load(Ordering::Relaxed), 5);
    }
}
