use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::mem;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::awaiter::{Awaitable, Awaiter};
use crate::cancellation::{CancellationRegistration, CancellationToken};
use crate::handle::Handle;

thread_local! {
    /// The pool state this thread is currently driving, if it is inside
    /// [`ThreadPool::run`]. Lets [`ThreadPool::dispatch`] stay on thread and
    /// catches nested `run` calls.
    static CURRENT_POOL: Cell<*const PoolState> = const { Cell::new(ptr::null()) };
}

/// A fixed pool of worker threads draining two work sources: a FIFO queue
/// of ready handles and a min-heap of deadline-scheduled ones. Queue
/// entries run in submission order; heap entries fire no earlier than their
/// deadline, ties in insertion order. Nothing is promised between the two
/// sources.
///
/// Workers stay alive while the pool has outstanding [`Work`], queued
/// handles or delayed entries, and exit once all three are gone. Clones are
/// cheap and share the pool; [`ThreadPool::join`] is explicit.
#[derive(Clone)]
pub struct ThreadPool {
    state: Arc<PoolState>,
}

struct PoolState {
    shared: Mutex<Shared>,
    cond: Condvar,
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<Handle>,
    delay_heap: BinaryHeap<DelayOp>,
    next_delay_id: usize,
    work: usize,
    threads: Vec<thread::JoinHandle<()>>,
}

struct DelayOp {
    deadline: Instant,
    id: usize,
    handle: Handle,
}

impl PartialEq for DelayOp {
    fn eq(&self, other: &DelayOp) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for DelayOp {}

impl PartialOrd for DelayOp {
    fn partial_cmp(&self, other: &DelayOp) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayOp {
    // Reversed so the std max-heap pops the earliest deadline; ties go to
    // the earlier insertion.
    fn cmp(&self, other: &DelayOp) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PoolState {
    fn post(&self, handle: Handle) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.queue.push_back(handle);
        }
        self.cond.notify_one();
    }

    /// True when the calling thread is one of this pool's workers.
    fn on_worker(&self) -> bool {
        CURRENT_POOL.with(|current| ptr::eq(current.get(), self))
    }

    fn post_after(
        state: &Arc<PoolState>,
        handle: Handle,
        deadline: Instant,
        token: &CancellationToken,
        registration: &mut Option<CancellationRegistration>,
    ) {
        let id = {
            let mut shared = state.shared.lock().unwrap();
            let id = shared.next_delay_id;
            shared.next_delay_id += 1;
            shared.delay_heap.push(DelayOp {
                deadline,
                id,
                handle,
            });
            id
        };
        if token.can_be_cancelled() {
            // Registered outside the lock: an already cancelled token runs
            // the callback synchronously, and the callback takes the lock.
            let cloned = Arc::clone(state);
            *registration = Some(token.register(move || cloned.cancel_delay_op(id)));
        }
        state.cond.notify_one();
    }

    /// Rewrite one delayed entry's deadline to "now" so a worker wakes up
    /// and fires it. Linear in the heap size.
    fn cancel_delay_op(&self, id: usize) {
        let mut notify = false;
        {
            let mut shared = self.shared.lock().unwrap();
            let mut ops = mem::take(&mut shared.delay_heap).into_vec();
            if let Some(op) = ops.iter_mut().find(|op| op.id == id) {
                op.deadline = Instant::now();
                notify = true;
            }
            shared.delay_heap = BinaryHeap::from(ops);
        }
        if notify {
            trace!("delay op {id} cancelled, waking a worker");
            self.cond.notify_one();
        }
    }

    fn run(&self) {
        CURRENT_POOL.with(|current| {
            assert!(
                current.get().is_null(),
                "run() called on a thread that already drives a pool"
            );
            current.set(self);
        });
        trace!("worker {:?} entering", thread::current().id());

        let mut shared = self.shared.lock().unwrap();
        while shared.work > 0 || !shared.queue.is_empty() || !shared.delay_heap.is_empty() {
            let now = Instant::now();
            let next_deadline = shared.delay_heap.peek().map(|op| op.deadline);
            if next_deadline.map_or(true, |deadline| deadline > now) && shared.queue.is_empty() {
                shared = match next_deadline {
                    Some(deadline) => {
                        let timeout = deadline.saturating_duration_since(now);
                        self.cond.wait_timeout(shared, timeout).unwrap().0
                    }
                    None => self
                        .cond
                        .wait_while(shared, |shared| {
                            shared.queue.is_empty()
                                && shared.delay_heap.is_empty()
                                && shared.work > 0
                        })
                        .unwrap(),
                };
            }

            let now = Instant::now();
            let next = if shared
                .delay_heap
                .peek()
                .map_or(false, |op| op.deadline <= now)
            {
                shared.delay_heap.pop().map(|op| op.handle)
            } else {
                shared.queue.pop_front()
            };

            if let Some(handle) = next {
                drop(shared);
                // SAFETY: the queue hands each handle to exactly one worker,
                // and posting promised the frame stays alive until resumed.
                unsafe { handle.resume_chain() };
                shared = self.shared.lock().unwrap();
            }
        }
        drop(shared);

        trace!("worker {:?} exiting", thread::current().id());
        CURRENT_POOL.with(|current| current.set(ptr::null()));
    }
}

impl ThreadPool {
    pub fn new() -> ThreadPool {
        ThreadPool {
            state: Arc::new(PoolState {
                shared: Mutex::new(Shared::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Append `handle` to the ready queue and wake one worker. The frame
    /// must stay alive until a worker resumes it.
    pub fn post(&self, handle: Handle) {
        self.state.post(handle);
    }

    /// Resume `handle` inline when called from one of this pool's workers,
    /// otherwise behave like [`ThreadPool::post`].
    pub fn resume_or_post(&self, handle: Handle) {
        if self.state.on_worker() {
            // SAFETY: same contract as `post`; the caller hands the frame
            // over either way.
            unsafe { handle.resume_chain() };
        } else {
            self.state.post(handle);
        }
    }

    /// Awaitable that parks the coroutine on the ready queue, moving it onto
    /// one of this pool's workers.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            state: Arc::clone(&self.state),
        }
    }

    /// Like [`ThreadPool::schedule`], but a coroutine that is already on one
    /// of this pool's workers keeps running without touching the queue.
    pub fn dispatch(&self) -> Dispatch {
        Dispatch {
            state: Arc::clone(&self.state),
        }
    }

    /// Awaitable that reschedules the coroutine once `delay` has elapsed, or
    /// as soon as `token` is cancelled. A coroutine woken by cancellation is
    /// expected to look at its token.
    pub fn schedule_after(&self, delay: Duration, token: CancellationToken) -> ScheduleAfter {
        ScheduleAfter {
            state: Arc::clone(&self.state),
            deadline: Instant::now() + delay,
            token,
            registration: None,
        }
    }

    /// Keep workers alive until the returned guard is dropped.
    pub fn make_work(&self) -> Work {
        {
            let mut shared = self.state.shared.lock().unwrap();
            shared.work += 1;
        }
        Work {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Spawn `n` worker threads. Threads are only created while the pool has
    /// outstanding work, queued handles or delayed entries; take a
    /// [`ThreadPool::make_work`] guard first.
    pub fn create_threads(&self, n: usize) {
        let mut shared = self.state.shared.lock().unwrap();
        if shared.work == 0 && shared.queue.is_empty() && shared.delay_heap.is_empty() {
            warn!("create_threads called on an idle pool, no threads started");
            return;
        }
        shared.threads.reserve(n);
        for _ in 0..n {
            let state = Arc::clone(&self.state);
            shared.threads.push(thread::spawn(move || state.run()));
        }
    }

    pub fn create_thread(&self) {
        self.create_threads(1);
    }

    /// Drive this pool from the calling thread until it runs dry. Panics if
    /// the thread already drives a pool.
    pub fn run(&self) {
        self.state.run();
    }

    /// Wait for every worker spawned so far to exit.
    pub fn join(&self) {
        let threads = {
            let mut shared = self.state.shared.lock().unwrap();
            mem::take(&mut shared.threads)
        };
        for thread in threads {
            let _ = thread.join();
        }
    }
}

impl Default for ThreadPool {
    fn default() -> ThreadPool {
        ThreadPool::new()
    }
}

/// RAII guard counting as outstanding pool work. Workers only shut down
/// once the count is zero and both work sources are empty.
#[must_use = "the pool shuts down once all work guards are gone"]
pub struct Work {
    state: Option<Arc<PoolState>>,
}

impl Work {
    /// Give the count back early instead of at drop time.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            let remaining = {
                let mut shared = state.shared.lock().unwrap();
                shared.work -= 1;
                shared.work
            };
            if remaining == 0 {
                state.cond.notify_all();
            }
        }
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        self.release();
    }
}

/// Awaiter of [`ThreadPool::schedule`].
pub struct Schedule {
    state: Arc<PoolState>,
}

impl Awaiter for Schedule {
    type Output = ();
    type Suspend = ();

    fn await_ready(&mut self) -> bool {
        false
    }

    fn await_suspend(&mut self, caller: Handle) {
        self.state.post(caller);
    }

    fn await_resume(self) {}
}

impl Awaitable for Schedule {
    type Awaiter = Schedule;

    fn into_awaiter(self) -> Schedule {
        self
    }
}

/// Awaiter of [`ThreadPool::dispatch`].
pub struct Dispatch {
    state: Arc<PoolState>,
}

impl Awaiter for Dispatch {
    type Output = ();
    type Suspend = Handle;

    fn await_ready(&mut self) -> bool {
        false
    }

    fn await_suspend(&mut self, caller: Handle) -> Handle {
        if self.state.on_worker() {
            // transferring back to the caller keeps it running right here
            caller
        } else {
            self.state.post(caller);
            Handle::noop()
        }
    }

    fn await_resume(self) {}
}

impl Awaitable for Dispatch {
    type Awaiter = Dispatch;

    fn into_awaiter(self) -> Dispatch {
        self
    }
}

/// Awaiter of [`ThreadPool::schedule_after`]. Holds the cancellation
/// registration, so it is deregistered when the awaiter entry unwinds after
/// resumption.
pub struct ScheduleAfter {
    state: Arc<PoolState>,
    deadline: Instant,
    token: CancellationToken,
    registration: Option<CancellationRegistration>,
}

impl Awaiter for ScheduleAfter {
    type Output = ();
    type Suspend = ();

    fn await_ready(&mut self) -> bool {
        false
    }

    fn await_suspend(&mut self, caller: Handle) {
        PoolState::post_after(
            &self.state,
            caller,
            self.deadline,
            &self.token,
            &mut self.registration,
        );
    }

    fn await_resume(self) {}
}

impl Awaitable for ScheduleAfter {
    type Awaiter = ScheduleAfter;

    fn into_awaiter(self) -> ScheduleAfter {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::task::task;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn every_posted_handle_is_resumed_exactly_once() {
        init_logging();
        let pool = ThreadPool::new();
        let work = pool.make_work();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..10_000 {
            let counter = Arc::clone(&counter);
            let t = task(move |_| async move {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            pool.post(t.raw_handle());
            tasks.push(t);
        }
        pool.create_threads(8);
        drop(work);
        pool.join();
        assert_eq!(counter.load(Ordering::Relaxed), 10_000);
        for t in &tasks {
            assert!(t.is_done());
        }
    }

    #[test]
    fn ready_queue_runs_in_submission_order() {
        init_logging();
        let pool = ThreadPool::new();
        let work = pool.make_work();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..100 {
            let order = Arc::clone(&order);
            let t = task(move |_| async move {
                order.lock().unwrap().push(i);
            });
            pool.post(t.raw_handle());
            tasks.push(t);
        }
        pool.create_thread();
        drop(work);
        pool.join();
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn dispatch_on_a_worker_stays_inline() {
        init_logging();
        let pool = ThreadPool::new();
        let work = pool.make_work();
        let (tx, rx) = oneshot::channel();
        let inner = pool.clone();
        let t = task(move |sc| async move {
            sc.on(inner.schedule()).await;
            let before = thread::current().id();
            sc.on(inner.dispatch()).await;
            tx.send((before, thread::current().id())).unwrap();
        });
        pool.post(t.raw_handle());
        pool.create_threads(2);
        let (before, after) = rx.recv().unwrap();
        assert_eq!(before, after);
        drop(work);
        pool.join();
        assert!(t.is_done());
    }

    #[test]
    fn dispatch_from_a_foreign_thread_posts() {
        init_logging();
        let pool = ThreadPool::new();
        let (tx, rx) = oneshot::channel();
        let inner = pool.clone();
        let t = task(move |sc| async move {
            sc.on(inner.dispatch()).await;
            tx.send(thread::current().id()).unwrap();
        });
        let mut awaiter = t.into_awaiter();
        let next = awaiter.await_suspend(Handle::noop());
        // SAFETY: the frame is owned by `awaiter`; it parks itself on the
        // pool and only a worker touches it afterwards.
        unsafe { next.resume_chain() };
        pool.create_thread();
        let worker = rx.recv().unwrap();
        assert_ne!(worker, thread::current().id());
        pool.join();
        awaiter.await_resume();
    }

    #[test]
    fn schedule_after_fires_no_earlier_than_the_deadline() {
        init_logging();
        let pool = ThreadPool::new();
        let work = pool.make_work();
        let (tx, rx) = oneshot::channel();
        let inner = pool.clone();
        let start = Instant::now();
        let t = task(move |sc| async move {
            sc.on(inner.schedule_after(Duration::from_millis(50), CancellationToken::none()))
                .await;
            tx.send(start.elapsed()).unwrap();
        });
        pool.post(t.raw_handle());
        pool.create_thread();
        let elapsed = rx.recv().unwrap();
        assert!(elapsed >= Duration::from_millis(50), "fired at {elapsed:?}");
        drop(work);
        pool.join();
        drop(t);
    }

    #[test]
    fn cancelled_delay_fires_early_and_observes_the_token() {
        init_logging();
        let pool = ThreadPool::new();
        let work = pool.make_work();
        let source = CancellationSource::new();
        let token = source.token();
        let (tx, rx) = oneshot::channel();
        let inner = pool.clone();
        let start = Instant::now();
        let t = task(move |sc| async move {
            sc.on(inner.schedule_after(Duration::from_secs(1), token.clone()))
                .await;
            let outcome = token.check_cancelled();
            tx.send((start.elapsed(), outcome)).unwrap();
        });
        pool.post(t.raw_handle());
        pool.create_thread();
        thread::sleep(Duration::from_millis(100));
        source.cancel();
        let (elapsed, outcome) = rx.recv().unwrap();
        assert_eq!(outcome, Err(crate::cancellation::Cancelled));
        assert!(elapsed < Duration::from_millis(900), "woke at {elapsed:?}");
        drop(work);
        pool.join();
        drop(t);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        init_logging();
        let pool = ThreadPool::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let deadline = Instant::now() + Duration::from_millis(20);
        let mut tasks = Vec::new();
        for i in 0..10 {
            let order = Arc::clone(&order);
            let t = task(move |_| async move {
                order.lock().unwrap().push(i);
            });
            PoolState::post_after(
                &pool.state,
                t.raw_handle(),
                deadline,
                &CancellationToken::none(),
                &mut None,
            );
            tasks.push(t);
        }
        pool.create_thread();
        pool.join();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn create_threads_on_an_idle_pool_is_a_no_op() {
        init_logging();
        let pool = ThreadPool::new();
        pool.create_threads(4);
        // nothing was spawned, so this returns immediately
        pool.join();

        let mut work = pool.make_work();
        pool.create_thread();
        work.release();
        pool.join();
    }

    #[test]
    fn nested_run_panics() {
        init_logging();
        let pool = ThreadPool::new();
        let work = pool.make_work();
        let inner = pool.clone();
        let t = task(move |sc| async move {
            sc.on(inner.schedule()).await;
            inner.run();
        });
        let mut awaiter = t.into_awaiter();
        let next = awaiter.await_suspend(Handle::noop());
        // SAFETY: the frame parks itself on the pool; only a worker touches
        // it afterwards.
        unsafe { next.resume_chain() };
        pool.create_thread();
        drop(work);
        pool.join();
        let payload =
            panic::catch_unwind(AssertUnwindSafe(move || awaiter.await_resume())).unwrap_err();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .map(str::to_owned)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap();
        assert!(message.contains("already drives a pool"), "{message}");
    }
}
