use std::{
    mem::size_of,
    num::NonZeroUsize,
    sync::{ atomic::{ AtomicBool, AtomicUsize, Ordering }, Arc, Barrier, Condvar, Mutex, OnceLock },
    thread::JoinHandle,
};

use bheap::{ BinaryMaxHeap, Uid };
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{ sync::WaitGroup, CachePadded };
use rand::Rng;

pub mod affinity;
pub mod cpu_set;
pub mod errors;
mod pinned;
mod sys;

pub use affinity::{ AffinityController, ThreadHandle, UnsupportedAffinity };
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use affinity::LinuxAffinity;
pub use cpu_set::{ CpuSet, HostCpus };
pub use errors::{ AffinityError, CpuSetError, PinnedPoolError };

/// A trait representing task.

pub trait Task: Send + 'static {
    /// Run the task.
    ///
    /// Accepts `pool` as an argument which allows
    /// to spawn new tasks using [`Pool::schedule`](Pool::schedule)
    fn run(&self, pool: &Arc<Pool>);
}

/// Hook run by a freshly spawned worker on itself, before it looks at any work.
///
/// Receives the handle of the worker thread it runs on.
pub type ThreadInitializer = Box<dyn FnOnce(ThreadHandle) + Send + 'static>;

/// The maximum number of jobs we can store in a local queue before overflowing
/// to the global queue.
///
/// The exact value here doesn't really matter as other threads may steal from
/// our local queue, as long as the value is great enough to avoid excessive
/// overflowing in most common cases.
const LOCAL_QUEUE_CAPACITY: usize = 2048 / size_of::<Box<dyn Task>>();
/// The maximum number of jobs to steal at a time.
///
/// This puts an upper bound on the time spent stealing from a single queue.
const STEAL_LIMIT: usize = 32;

/// The shared half of a thread.
struct Shared {
    id: usize,
    /// The queue threads can steal work from.
    queue: Arc<ArrayQueue<Box<dyn Task>>>,
}

struct Worker {
    id: usize,
    /// The thread-local queue new work is scheduled onto, unless we consider it
    /// to be too full.
    work: Arc<ArrayQueue<Box<dyn Task>>>,

    /// The pool this thread belongs to.
    pool: Arc<Pool>,
}

impl PartialEq for Shared {
    fn eq(&self, other: &Self) -> bool {
        // workers are equal if they have the same amount of tasks
        self.queue.len() == other.queue.len()
    }
}

impl Eq for Shared {}

impl Ord for Shared {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // fewer queued tasks means higher priority, so the top of the heap is
        // always the least loaded worker
        other.queue.len().cmp(&self.queue.len())
    }
}

impl PartialOrd for Shared {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Uid for Shared {
    fn uid(&self) -> u64 {
        self.id as _
    }
}

/// A thread-pool type.
///
/// Owns a fixed set of worker threads created up front. Every worker runs its
/// [`ThreadInitializer`] on itself before it can pick up work, which is how
/// pinned pools (see [`Pool::pinned`]) bind each worker to its cpu.
pub struct Pool {
    workers: Mutex<BinaryMaxHeap<Shared>>,
    global: Mutex<Vec<Box<dyn Task>>>,
    global_cv: Condvar,
    alive: AtomicBool,
    sleeping: CachePadded<AtomicUsize>,
    sleeping_cvar: Condvar,
    threads: usize,
    /// Worker thread handles, indexed by creation order.
    handles: Box<[OnceLock<ThreadHandle>]>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Create new thread-pool.
    ///
    /// `parallelism` controls how many worker threads are spawned. If it is `None`
    /// then [`std::thread::available_parallelism`] is used.
    pub fn new(parallelism: Option<NonZeroUsize>) -> Arc<Self> {
        let threads = parallelism
            .or_else(|| std::thread::available_parallelism().ok())
            .map(|x| x.get())
            .unwrap_or(4);

        let initializers = (0..threads)
            .map(|_| Box::new(|_: ThreadHandle| {}) as ThreadInitializer)
            .collect();
        Self::with_thread_initializers(initializers)
    }

    /// Create a pool with one worker per initializer.
    ///
    /// Worker `k` runs `initializers[k]` on its own thread as its very first
    /// action. This function returns once every worker has finished its
    /// initializer, so no task can ever run on a worker that hasn't been
    /// initialized.
    ///
    /// This function will also spawn the task-manager background thread which is
    /// responsible for simple load-balancing of newly scheduled tasks.
    ///
    /// # Panics
    ///
    /// If `initializers` is empty.
    pub fn with_thread_initializers(initializers: Vec<ThreadInitializer>) -> Arc<Self> {
        assert!(!initializers.is_empty(), "a pool needs at least one worker thread");
        let threads = initializers.len();

        let this = Arc::new(Self {
            workers: Mutex::new(BinaryMaxHeap::new()),
            global: Mutex::new(Vec::new()),
            global_cv: Condvar::new(),
            alive: AtomicBool::new(true),
            sleeping: CachePadded::new(AtomicUsize::new(0)),
            sleeping_cvar: Condvar::new(),
            threads,
            handles: (0..threads).map(|_| OnceLock::new()).collect(),
            joins: Mutex::new(Vec::with_capacity(threads + 1)),
        });

        let queues = {
            let mut workers = this.workers.lock().unwrap();
            (0..threads)
                .map(|id| {
                    let shared = Shared {
                        id,
                        queue: Arc::new(ArrayQueue::new(LOCAL_QUEUE_CAPACITY)),
                    };
                    let queue = shared.queue.clone();
                    workers.push(shared);
                    queue
                })
                .collect::<Vec<_>>()
        };

        let started = WaitGroup::new();
        let mut joins = Vec::with_capacity(threads + 1);
        for ((id, init), queue) in initializers.into_iter().enumerate().zip(queues) {
            log::trace!("Spawning worker #{}", id);
            joins.push(this.spawn_worker(id, queue, init, started.clone()));
        }
        started.wait();

        joins.push(this.run());
        *this.joins.lock().unwrap() = joins;
        this
    }

    fn spawn_worker(
        self: &Arc<Pool>,
        id: usize,
        queue: Arc<ArrayQueue<Box<dyn Task>>>,
        init: ThreadInitializer,
        started: WaitGroup
    ) -> JoinHandle<()> {
        let pool = self.clone();
        std::thread::Builder::new()
            .name(format!("tpool-worker-{}", id))
            .spawn(move || {
                let thread = ThreadHandle::current();
                init(thread);
                let _ = pool.handles[id].set(thread);
                drop(started);
                Worker::new(id, pool, queue).run();
            })
            .expect("failed to spawn worker thread")
    }

    fn run(self: &Arc<Pool>) -> JoinHandle<()> {
        let pool = self.clone();
        let b1 = Arc::new(Barrier::new(2));
        let b2 = b1.clone();
        let join = std::thread::Builder::new()
            .name("tpool-manager".to_string())
            .spawn(move || {
                b2.wait();
                Pool::run_task_manager(&pool);
            })
            .expect("failed to spawn task manager thread");
        b1.wait();

        self.global_cv.notify_one();
        log::trace!("Pool is running with {} workers", self.threads);
        join
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::Relaxed)
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Handles of the worker threads in creation order.
    ///
    /// A worker whose initializer panicked never registers a handle and is
    /// missing from the list.
    pub fn worker_threads(&self) -> Vec<ThreadHandle> {
        self.handles.iter().filter_map(|handle| handle.get().copied()).collect()
    }

    /// Schedule a job onto the thread-pool.
    ///
    /// Task starts execution only when it arrives to the worker and worker processes it.
    ///
    /// If all workers are busy the task waits on the global queue until one of
    /// them becomes free.
    pub fn schedule(&self, task: Box<dyn Task>) {
        self.global.lock().unwrap().push(task);
        /* wake up sleeping workers if there's any. They would take a new job to execute
            and also wake up task manager *after* stealing from other, low-priority workers
            and from global-queue.
        */
        if self.sleeping() > 0 {
            self.sleeping_cvar.notify_all();
        } else {
            /*
                no sleeping workers means all workers are busy:
                wake up task manager thread so it hands the job to the least loaded one
             */
            self.global_cv.notify_one();
        }
    }

    /// Schedule multiple jobs onto the thread-pool.
    pub fn schedule_multiple(&self, mut tasks: Vec<Box<dyn Task>>) {
        if tasks.is_empty() {
            return;
        }

        let mut queue = self.global.lock().unwrap();

        queue.append(&mut tasks);

        if self.sleeping() > 0 {
            self.sleeping_cvar.notify_all();
        } else {
            self.global_cv.notify_one();
        }
    }

    /// Stop the pool and wait for its threads to exit.
    ///
    /// Tasks still queued are dropped without running. Calling this from one of
    /// the pool's own tasks is fine, that worker is simply not joined.
    pub fn shutdown(&self) {
        if !self.stop() {
            return;
        }

        let me = std::thread::current().id();
        let joins = std::mem::take(&mut *self.joins.lock().unwrap());
        for join in joins {
            if join.thread().id() == me {
                continue;
            }
            if join.join().is_err() {
                log::error!("A pool thread panicked");
            }
        }
        log::trace!("Pool is shut down");
    }

    /// Flip `alive` and wake everybody. Returns `false` if already stopped.
    fn stop(&self) -> bool {
        {
            // sleepers check `alive` under this lock, so nobody can miss the wakeup
            let _global = self.global.lock().unwrap();
            if !self.alive.swap(false, Ordering::AcqRel) {
                return false;
            }
        }
        self.sleeping_cvar.notify_all();
        self.global_cv.notify_all();
        true
    }

    fn run_task_manager(pool: &Arc<Pool>) {
        log::trace!("Task manager instantiated");
        loop {
            let tasks = pool.global.lock().unwrap();

            let mut tasks = pool.global_cv
                .wait_while(tasks, |tasks: &mut Vec<_>| pool.is_alive() && tasks.is_empty())
                .unwrap();

            if !pool.is_alive() {
                break;
            }

            let mut workers = pool.workers.lock().unwrap();
            // rebuild the heap as some workers might've processed some tasks and could've became high-priority (empty/almost empty)
            workers.build_heap();
            let mut overflowed = false;
            if let Some(target) = workers.get(0) {
                while let Some(task) = tasks.pop() {
                    if let Err(task) = target.queue.push(task) {
                        tasks.push(task);
                        overflowed = true;
                        break;
                    }
                }
            }
            drop(workers);

            if pool.sleeping() > 0 {
                pool.sleeping_cvar.notify_all();
            }

            if overflowed {
                // even the least loaded worker is full: leave the rest on the global
                // queue and wait until somebody steals from it
                drop(pool.global_cv.wait(tasks).unwrap());
            }
        }
        log::trace!("Task manager stopped");
    }
}

impl Worker {
    fn new(id: usize, pool: Arc<Pool>, queue: Arc<ArrayQueue<Box<dyn Task>>>) -> Self {
        Self {
            id,
            pool,
            work: queue,
        }
    }

    fn sleep(&self) {
        let global = self.pool.global.lock().unwrap();

        // the task manager fills local queues while holding the global lock, so
        // checking our own queue here can't race with it
        if !global.is_empty() || !self.work.is_empty() || !self.pool.is_alive() {
            return;
        }

        self.pool.sleeping.fetch_add(1, Ordering::AcqRel);

        // We don't handle spurious wakeups here because:
        //
        // 1. We may be woken up when new work is produced on a local queue,
        //    while the global queue is still empty
        // 2. If we're woken up too early we'll just perform another work
        //    iteration, then go back to sleep.
        let _result = self.pool.sleeping_cvar.wait(global).unwrap();

        self.pool.sleeping.fetch_sub(1, Ordering::AcqRel);
    }

    fn run(&mut self) {
        log::trace!("Worker #{} instantiated", self.id);
        while self.pool.is_alive() {
            if let Some(task) = self.work.pop() {
                task.run(&self.pool);
                continue;
            } else if let Some(task) = self.steal_from_thread() {
                task.run(&self.pool);
                continue;
            } else if let Some(task) = self.steal_from_global() {
                task.run(&self.pool);
                continue;
            }

            self.sleep();
        }
        log::trace!("Worker #{} stopped", self.id);
    }

    fn steal_from_thread(&mut self) -> Option<Box<dyn Task>> {
        let mut workers = self.pool.workers.lock().unwrap();
        let len = workers.len();
        if len < 2 {
            return None;
        }

        // start at a random victim so idle workers don't all hammer the same queue
        let start = rand::thread_rng().gen_range(0..len);

        for offset in 0..len {
            let index = (start + offset) % len;

            let steal_from = match workers.get(index) {
                Some(shared) if shared.id != self.id => shared,
                _ => continue,
            };

            if let Some(initial) = steal_from.queue.pop() {
                let len = steal_from.queue.len();
                let steal = std::cmp::min(len / 2, STEAL_LIMIT);

                for _ in 0..steal {
                    if let Some(task) = steal_from.queue.pop() {
                        if let Err(task) = self.work.push(task) {
                            workers.restore_heap_property(index);
                            drop(workers);
                            self.pool.schedule(task);
                            return Some(initial);
                        }
                    } else {
                        break;
                    }
                }

                workers.restore_heap_property(index);
                return Some(initial);
            }
        }
        None
    }

    fn steal_from_global(&mut self) -> Option<Box<dyn Task>> {
        let mut global = self.pool.global.lock().unwrap();

        if let Some(initial) = global.pop() {
            let len = global.len();
            let steal = std::cmp::min(len / 2, STEAL_LIMIT);

            if steal > 0 {
                // take the `steal` most recently pushed jobs
                let mut to_steal = global.split_off(len - steal);

                drop(global);

                while let Some(task) = to_steal.pop() {
                    if let Err(task) = self.work.push(task) {
                        to_steal.push(task);
                        self.pool.schedule_multiple(to_steal);
                        break;
                    }
                }
            } else {
                drop(global);
            }
            // notify task manager that we might have a chance to schedule up more tasks
            self.pool.global_cv.notify_one();
            Some(initial)
        } else {
            None
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.sleeping_cvar.notify_all();
        self.global_cv.notify_one();
    }
}
