//! The work-stealing fork-join scheduler (§4.4).
//!
//! A [`Scheduler`] owns one [`deque::Deque`] per worker. Client code never touches a `Deque`
//! directly: it calls [`spawn_task`]/[`sync_task`]/[`call_task`] (normally through the
//! [`spawn!`]/[`sync!`]/[`call!`] macros) from inside a running worker, identified through a
//! thread-local pointer set up when that worker's thread starts (§9.1 decision (c) — chosen over
//! threading a `&Worker` handle through every call site, the same ergonomic trade-off Rayon's
//! `ThreadPool` makes with its own thread-local current-pool pointer).

mod deque;
mod task;
mod worker_thread;

pub use deque::{Deque, StealOutcome, TailSplit};
pub use task::{decode_payload, encode_payload, MAX_TASK_PAYLOAD};

use crate::config::SchedulerConfig;
use crate::error::contract_violation;
use crate::util::{FromIndex, IntoIndex, Xorshift64};
use static_assertions::const_assert;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Identifies one worker slot within a [`Scheduler`]. Stable for the scheduler's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    pub fn index(self) -> usize {
        self.into_index()
    }
}

impl IntoIndex for WorkerId {
    #[inline]
    fn into_index(self) -> usize {
        self.0
    }
}

impl FromIndex for WorkerId {
    #[inline]
    fn from_index(index: usize) -> Self {
        WorkerId(index)
    }
}

struct Worker {
    id: WorkerId,
    deque: Deque,
}

struct SchedulerInner {
    workers: Vec<Worker>,
    config: SchedulerConfig,
    running: AtomicBool,
    stealing_hint: Option<fn()>,
}

/// A fixed pool of workers cooperating through split-deque stealing. See the module docs and
/// §4.4 for the protocol; [`Self::startup`] is the usual entry point for running a body of
/// `spawn!`/`sync!`/`call!`-using code across the whole pool.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    threads: Vec<JoinHandle<()>>,
}

thread_local! {
    static CURRENT_WORKER: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

struct WorkerContext {
    scheduler: Arc<SchedulerInner>,
    id: WorkerId,
    rng: Cell<Xorshift64>,
}

fn with_current_worker<R>(f: impl FnOnce(&WorkerContext) -> R) -> R {
    CURRENT_WORKER.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            contract_violation(
                "spawn!/sync!/call! used from a thread with no bound scheduler worker",
            );
        }
        // SAFETY: only `run_on_worker` ever stores a non-null pointer here, and it outlives the
        // call (the pointee is a stack-local `WorkerContext` kept alive for the worker's run).
        let ctx = unsafe { &*(ptr as *const WorkerContext) };
        f(ctx)
    })
}

impl Scheduler {
    /// Creates worker state for `config.workers()` workers; does not spawn any OS threads (§6
    /// "init does not create threads").
    pub fn init(config: SchedulerConfig) -> Self {
        let workers = (0..config.workers())
            .map(|i| Worker {
                id: WorkerId(i),
                deque: Deque::new(config.deque_size()),
            })
            .collect();
        Scheduler {
            inner: Arc::new(SchedulerInner {
                workers,
                config,
                running: AtomicBool::new(true),
                stealing_hint: None,
            }),
            threads: Vec::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Registers a callback invoked with no arguments whenever a steal attempt fails, for
    /// external instrumentation (§4.4, §6). Must be set before [`Self::startup`].
    pub fn set_stealing_callback(&mut self, callback: fn()) {
        Arc::get_mut(&mut self.inner)
            .expect("set_stealing_callback must run before startup spawns worker threads")
            .stealing_hint = Some(callback);
    }

    /// Spawns `workers() - 1` OS threads (worker ids `1..workers()`), then runs `callback(arg)`
    /// on the calling thread, which is promoted into worker 0 for the duration of the call.
    /// Joins the spawned threads once `callback` returns and [`Self::exit`] has been observed.
    pub fn startup<A, R>(&mut self, stack_size: usize, callback: impl FnOnce(&mut A) -> R, arg: &mut A) -> R
    where
        A: Send,
    {
        for i in 1..self.workers() {
            self.spawn_worker(i, stack_size);
        }
        log::info!(target: "bdd_core::scheduler", "scheduler startup: {} workers", self.workers());
        let result = run_on_worker(self.inner.clone(), WorkerId(0), || callback(arg));
        result
    }

    /// Low-level manual thread creation for worker `index` (§6 "spawn_worker"). `startup` calls
    /// this for every worker but the caller's own; exposed directly for embedders that want to
    /// manage worker thread lifecycles themselves.
    pub fn spawn_worker(&mut self, index: usize, stack_size: usize) {
        let inner = self.inner.clone();
        let builder = std::thread::Builder::new()
            .name(format!("bdd-core-worker-{index}"))
            .stack_size(stack_size.max(64 * 1024));
        let handle = builder
            .spawn(move || {
                if let Some(hook) = inner.config.bind_worker_to_node {
                    hook(index);
                }
                run_on_worker(inner, WorkerId(index), worker_idle_loop);
            })
            .expect("failed to spawn scheduler worker thread");
        self.threads.push(handle);
    }

    /// Signals shutdown and joins every spawned worker thread. Idempotent.
    pub fn exit(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::info!(target: "bdd_core::scheduler", "scheduler exit: all workers joined");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.exit();
    }
}

/// The run loop of a spawned worker thread: repeatedly hunt for stolen-able work until the
/// scheduler signals shutdown.
fn worker_idle_loop() {
    with_current_worker(|ctx| {
        while ctx.scheduler.running.load(Ordering::Acquire) {
            worker_thread::hunt_for_work(&ctx.scheduler, ctx.id, &ctx.rng);
        }
    });
}

fn run_on_worker<R>(scheduler: Arc<SchedulerInner>, id: WorkerId, body: impl FnOnce() -> R) -> R {
    let ctx = WorkerContext {
        scheduler,
        id,
        rng: Cell::new(Xorshift64::for_worker(id.0)),
    };
    let ptr = &ctx as *const WorkerContext as *const ();
    CURRENT_WORKER.with(|cell| cell.set(ptr));
    let result = body();
    CURRENT_WORKER.with(|cell| cell.set(std::ptr::null()));
    result
}

/// A unit of work that can be spawned onto a worker's deque. Implementors are typically small
/// `Copy` structs bundling a task's arguments; `run` is the task body. Generalizes the "task
/// macros by arity" contract (§6) across every argument count through one generic trait instead
/// of per-arity code generation.
pub trait TaskBody: Copy + Send + 'static {
    type Output: Copy + Send + 'static;
    fn run(self) -> Self::Output;
}

unsafe fn run_task_body<T: TaskBody>(payload: *mut [u8; MAX_TASK_PAYLOAD]) {
    let body: T = unsafe { decode_payload(&*payload) };
    let output = body.run();
    unsafe { *payload = encode_payload(output) };
}

/// A handle to a task spawned with [`spawn_task`]/[`spawn!`]. Must be passed to
/// [`sync_task`]/[`sync!`] on the *same* worker that spawned it, in LIFO order relative to any
/// other outstanding spawn on that worker (§6 "preserves stack order with matching SPAWN").
#[must_use = "a spawned task must be sync!-ed or its result and worker slot leak"]
pub struct SpawnedTask<T: TaskBody> {
    worker: WorkerId,
    slot_index: usize,
    _marker: PhantomData<T>,
}

/// Non-blocking: enters `body` onto the calling worker's deque (§6 "SPAWN: non-blocking").
/// Must be called from inside a running worker (see the module docs on the thread-local worker
/// context); panics via [`contract_violation`] otherwise.
///
/// `T`/`T::Output` overflowing `MAX_TASK_PAYLOAD` is a compile error, not a runtime check: each
/// monomorphization of this function re-evaluates its own `const_assert!`.
pub fn spawn_task<T: TaskBody>(body: T) -> SpawnedTask<T> {
    const_assert!(std::mem::size_of::<T>() <= MAX_TASK_PAYLOAD);
    const_assert!(std::mem::size_of::<T::Output>() <= MAX_TASK_PAYLOAD);
    with_current_worker(|ctx| {
        let deque = &ctx.scheduler.workers[ctx.id.0].deque;
        let slot_index = deque.head();
        let cell = deque.head_slot();
        unsafe {
            let task = &mut *cell.get();
            task.thief.reset();
            task.payload = encode_payload(body);
            task.f = Some(run_task_body::<T> as task::TaskFn);
        }
        deque.after_spawn();
        log::trace!(
            target: "bdd_core::scheduler",
            "worker {} spawned task {} at slot {slot_index}",
            ctx.id.0,
            task::next_task_id()
        );
        SpawnedTask {
            worker: ctx.id,
            slot_index,
            _marker: PhantomData,
        }
    })
}

/// Blocking: waits for `handle`'s task to complete (running it inline if it was never stolen,
/// or leapfrogging the thief otherwise) and returns its result (§6 "SYNC").
pub fn sync_task<T: TaskBody>(handle: SpawnedTask<T>) -> T::Output {
    with_current_worker(|ctx| {
        if ctx.id != handle.worker {
            contract_violation("sync! called on a different worker than the matching spawn!");
        }
        let deque = &ctx.scheduler.workers[ctx.id.0].deque;

        if deque.owns_top_privately() {
            deque.pop_private();
            let cell = deque.stolen_slot(handle.slot_index);
            let task = unsafe { &mut *cell.get() };
            if matches!(task.thief.load(), task::Thief::Unstolen) {
                unsafe { task.run() };
            } else {
                worker_thread_leapfrog_wait(ctx, task);
            }
            return unsafe { decode_payload::<T::Output>(&task.payload) };
        }

        // Potentially shared: try to shrink the public region back to exclude this task.
        if deque.shrink_shared() {
            let cell = deque.stolen_slot(handle.slot_index);
            let task = unsafe { &mut *cell.get() };
            if matches!(task.thief.load(), task::Thief::Unstolen) {
                unsafe { task.run() };
            } else {
                worker_thread_leapfrog_wait(ctx, task);
            }
            return unsafe { decode_payload::<T::Output>(&task.payload) };
        }

        // The task was actually stolen: leapfrog the thief until it (or we, via leapfrog-stealing
        // the thief's own work) completes it.
        let cell = deque.stolen_slot(handle.slot_index);
        let task = unsafe { &*cell.get() };
        worker_thread_leapfrog_wait(ctx, task);
        unsafe { decode_payload::<T::Output>(&task.payload) }
    })
}

fn worker_thread_leapfrog_wait(ctx: &WorkerContext, task: &task::Task) {
    if matches!(task.thief.load(), task::Thief::Completed) {
        return;
    }
    // The thief isn't named on the task itself in this design (only its claim state is); a
    // syncing owner therefore leapfrogs by probing the same victim pool a fresh idle worker
    // would, biased toward workers "close" to this one, rather than tracking the exact thief
    // identity. This trades a small amount of leapfrog precision for not needing a worker-id
    // field on every task record (keeping `Task` within `MAX_TASK_PAYLOAD` neighborhood small).
    let mut attempt = 0u32;
    loop {
        if matches!(task.thief.load(), task::Thief::Completed) {
            return;
        }
        let victim = worker_thread::pick_victim(&ctx.scheduler, ctx.id, &ctx.rng, attempt);
        worker_thread::leapfrog(&ctx.scheduler, ctx.id, &ctx.rng, victim, task);
        attempt = attempt.wrapping_add(1);
    }
}

/// Direct inline execution on the current worker, bypassing the deque entirely (§6 "CALL").
pub fn call_task<T: TaskBody>(body: T) -> T::Output {
    with_current_worker(|_ctx| body.run())
}

/// Enters `$body` (a [`TaskBody`] value) onto the current worker's deque without blocking.
#[macro_export]
macro_rules! spawn {
    ($body:expr) => {
        $crate::scheduler::spawn_task($body)
    };
}

/// Waits for a task handle previously produced by [`spawn!`] and returns its result.
#[macro_export]
macro_rules! sync {
    ($handle:expr) => {
        $crate::scheduler::sync_task($handle)
    };
}

/// Runs `$body` inline on the current worker, without ever entering the deque.
#[macro_export]
macro_rules! call {
    ($body:expr) => {
        $crate::scheduler::call_task($body)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Copy, Clone)]
    struct Fib(u32);

    impl TaskBody for Fib {
        type Output = u64;
        fn run(self) -> u64 {
            if self.0 < 2 {
                return self.0 as u64;
            }
            let left = spawn_task(Fib(self.0 - 1));
            let right = call_task(Fib(self.0 - 2));
            sync_task(left) + right
        }
    }

    #[test]
    fn single_worker_fib_matches_scalar() {
        let mut scheduler = Scheduler::init(SchedulerConfig::default().with_workers(1));
        let result = scheduler.startup(1 << 20, |_: &mut ()| call_task(Fib(15)), &mut ());
        assert_eq!(result, scalar_fib(15));
        scheduler.exit();
    }

    #[test]
    fn multi_worker_fib_matches_scalar() {
        let mut scheduler = Scheduler::init(SchedulerConfig::default().with_workers(4));
        let result = scheduler.startup(1 << 20, |_: &mut ()| call_task(Fib(20)), &mut ());
        assert_eq!(result, scalar_fib(20));
        scheduler.exit();
    }

    #[test]
    fn exit_without_any_work_joins_cleanly() {
        let total = Arc::new(AtomicU64::new(0));
        let total2 = total.clone();
        let mut scheduler = Scheduler::init(SchedulerConfig::default().with_workers(3));
        scheduler.startup(
            1 << 16,
            move |_: &mut ()| {
                total2.fetch_add(1, Ordering::SeqCst);
            },
            &mut (),
        );
        scheduler.exit();
        assert_eq!(total.load(Ordering::SeqCst), 1);
    }

    fn scalar_fib(n: u32) -> u64 {
        if n < 2 {
            n as u64
        } else {
            scalar_fib(n - 1) + scalar_fib(n - 2)
        }
    }
}
