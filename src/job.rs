//! Bounded worker pool with completion chaining.
//!
//! Jobs are re-entrant units of work consumed by a fixed set of worker
//! threads. The ready queue is a stack: workers dequeue in LIFO order so
//! that recursive decompositions (such as the parallel sort) run depth
//! first. A job may enqueue children of itself through its [`JobContext`];
//! the child's completion is chained into the parent so that a parent's
//! `on_done` fires only after its own body has returned and every
//! descendant has completed.
//!
//! There is no intrinsic cancellation; a job that wants to stop early must
//! observe a cooperatively set flag of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use log;

/// Default hard cap on the ready queue; submission blocks above it.
pub const DEFAULT_QUEUE_CAP: usize = 1024;

type JobBody = Box<dyn FnOnce(&JobContext<'_>) + Send>;
type DoneFn = Box<dyn FnOnce() + Send>;

/// A unit of work plus its optional completion callback.
pub struct JobItem {
    body: JobBody,
    on_done: Option<DoneFn>,
}

impl JobItem {
    /// Creates a job from its body. The body receives a [`JobContext`]
    /// through which it may enqueue children of itself.
    pub fn new(body: impl FnOnce(&JobContext<'_>) + Send + 'static) -> Self {
        JobItem { body: Box::new(body), on_done: None }
    }

    /// Attaches a completion callback, fired exactly once when the body has
    /// returned and all descendants have completed.
    pub fn with_on_done(mut self, on_done: impl FnOnce() + Send + 'static) -> Self {
        self.on_done = Some(Box::new(on_done));
        return self;
    }
}

struct JobState {
    body: Mutex<Option<JobBody>>,
    on_done: Mutex<Option<DoneFn>>,
    /// Outstanding completions: one for the body plus one per live child.
    pending: AtomicUsize,
    parent: Option<Arc<JobState>>,
    finished: Mutex<bool>,
    finished_cond: Condvar,
}

impl JobState {
    fn new(item: JobItem, parent: Option<Arc<JobState>>) -> Arc<Self> {
        Arc::new(JobState {
            body: Mutex::new(Some(item.body)),
            on_done: Mutex::new(item.on_done),
            pending: AtomicUsize::new(1),
            parent,
            finished: Mutex::new(false),
            finished_cond: Condvar::new(),
        })
    }
}

/// Handle to an enqueued job; join blocks until the job and all of its
/// descendants have completed.
pub struct JobHandle {
    state: Arc<JobState>,
}

impl JobHandle {
    /// Blocks the calling thread until `on_done` has fired.
    pub fn join(&self) {
        let mut finished = self.state.finished.lock().unwrap();
        while !*finished {
            finished = self.state.finished_cond.wait(finished).unwrap();
        }
    }

    pub fn is_done(&self) -> bool {
        *self.state.finished.lock().unwrap()
    }
}

struct PoolState {
    /// LIFO ready stack; ties between jobs pushed at the same depth are
    /// broken by submission time.
    ready: Vec<Arc<JobState>>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    work_available: Condvar,
    space_available: Condvar,
    queue_cap: usize,
}

/// Fixed-size worker pool executing [`JobItem`]s.
pub struct JobPool {
    inner: Arc<PoolInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl JobPool {
    /// Creates a pool. If `workers` is [`None`] the worker count is taken
    /// from the hardware concurrency.
    pub fn new(workers: Option<usize>) -> Self {
        Self::with_queue_cap(workers, DEFAULT_QUEUE_CAP)
    }

    /// Creates a pool with an explicit hard cap on the ready queue.
    pub fn with_queue_cap(workers: Option<usize>, queue_cap: usize) -> Self {
        let count = workers.unwrap_or_else(|| {
            thread::available_parallelism().map(usize::from).unwrap_or(1)
        });
        log::info!("initializing worker pool (threads: {})", count);

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState { ready: Vec::new(), shutdown: false }),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
            queue_cap: queue_cap.max(1),
        });

        let workers = (0..count)
            .map(|i| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("em-worker-{}", i))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        JobPool { inner, workers }
    }

    /// The process-wide default pool, sized to the hardware concurrency.
    pub fn global() -> &'static JobPool {
        static GLOBAL: OnceLock<JobPool> = OnceLock::new();
        GLOBAL.get_or_init(|| JobPool::new(None))
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Submits a root job. Blocks only when the ready queue is at its hard
    /// cap, until a worker drains it.
    pub fn enqueue(&self, item: JobItem) -> JobHandle {
        let state = JobState::new(item, None);
        submit(&self.inner, state.clone());
        JobHandle { state }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
        }
        self.inner.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Execution context handed to a running job body.
pub struct JobContext<'a> {
    inner: &'a Arc<PoolInner>,
    current: &'a Arc<JobState>,
}

impl JobContext<'_> {
    /// Enqueues a child of the running job. The parent's completion is
    /// deferred until the child (and its descendants) complete.
    ///
    /// Children are not guaranteed to start before the parent's body
    /// returns; only completion order is guaranteed.
    pub fn enqueue_child(&self, item: JobItem) -> JobHandle {
        let state = JobState::new(item, Some(self.current.clone()));
        self.current.pending.fetch_add(1, Ordering::Relaxed);
        submit(self.inner, state.clone());
        JobHandle { state }
    }
}

fn submit(inner: &Arc<PoolInner>, job: Arc<JobState>) {
    let mut state = inner.state.lock().unwrap();
    while state.ready.len() >= inner.queue_cap {
        state = inner.space_available.wait(state).unwrap();
    }
    state.ready.push(job);
    inner.work_available.notify_one();
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(job) = state.ready.pop() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = inner.work_available.wait(state).unwrap();
            }
        };
        inner.space_available.notify_one();

        let body = job.body.lock().unwrap().take();
        if let Some(body) = body {
            let ctx = JobContext { inner: &inner, current: &job };
            body(&ctx);
        }
        complete(job);
    }
}

/// Decrements a job's pending counter, finalizing it (and transitively its
/// ancestors) when the counter reaches zero.
fn complete(job: Arc<JobState>) {
    let mut job = job;
    loop {
        if job.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let on_done = job.on_done.lock().unwrap().take();
        if let Some(on_done) = on_done {
            on_done();
        }

        {
            let mut finished = job.finished.lock().unwrap();
            *finished = true;
            job.finished_cond.notify_all();
        }

        match &job.parent {
            Some(parent) => {
                let parent = parent.clone();
                job = parent;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};

    use super::{JobItem, JobPool};

    #[test]
    fn test_single_job_runs_and_joins() {
        let pool = JobPool::new(Some(2));
        let ran = Arc::new(AtomicUsize::new(0));

        let handle = {
            let ran = ran.clone();
            pool.enqueue(JobItem::new(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
        };
        handle.join();

        assert!(handle.is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lifo_dequeue_order() {
        let pool = JobPool::new(Some(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // occupy the single worker until all follow-up jobs are queued
        let blocker = {
            let gate = gate.clone();
            pool.enqueue(JobItem::new(move |_| {
                let (lock, cond) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cond.wait(open).unwrap();
                }
            }))
        };

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                pool.enqueue(JobItem::new(move |_| {
                    order.lock().unwrap().push(i);
                }))
            })
            .collect();

        {
            let (lock, cond) = &*gate;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        blocker.join();
        for handle in &handles {
            handle.join();
        }

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    fn record(order: &Arc<Mutex<Vec<String>>>, label: String) -> impl FnOnce() {
        let order = order.clone();
        move || order.lock().unwrap().push(label)
    }

    #[test]
    fn test_completion_tree_ordering() {
        let pool = JobPool::new(Some(4));
        let done_order = Arc::new(Mutex::new(Vec::new()));

        let root = {
            let order = done_order.clone();
            pool.enqueue(
                JobItem::new(move |ctx| {
                    for c in 0..3 {
                        let body_order = order.clone();
                        let child_done = record(&order, format!("c{}", c));
                        ctx.enqueue_child(
                            JobItem::new(move |ctx| {
                                for g in 0..2 {
                                    ctx.enqueue_child(
                                        JobItem::new(|_| {})
                                            .with_on_done(record(&body_order, format!("g{}{}", c, g))),
                                    );
                                }
                            })
                            .with_on_done(child_done),
                        );
                    }
                })
                .with_on_done(record(&done_order, String::from("root"))),
            )
        };
        root.join();

        let order = done_order.lock().unwrap().clone();
        // one on_done per enqueued job
        assert_eq!(order.len(), 10);
        assert_eq!(order.last().map(String::as_str), Some("root"));

        // every child completes before its parent
        let position = |label: &str| order.iter().position(|o| o == label).unwrap();
        for c in 0..3 {
            let child = position(&format!("c{}", c));
            assert!(child < position("root"));
            for g in 0..2 {
                assert!(position(&format!("g{}{}", c, g)) < child);
            }
        }
    }

    #[test]
    fn test_on_done_counts_match_enqueues() {
        let pool = JobPool::new(Some(3));
        let done = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let done = done.clone();
                pool.enqueue(
                    JobItem::new(|_| {}).with_on_done(move || {
                        done.fetch_add(1, Ordering::SeqCst);
                    }),
                )
            })
            .collect();
        for handle in handles {
            handle.join();
        }

        assert_eq!(done.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_pool_drains_on_drop() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = JobPool::new(Some(2));
            for _ in 0..20 {
                let done = done.clone();
                pool.enqueue(JobItem::new(move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }
}
