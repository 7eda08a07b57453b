use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use rayon::prelude::*;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::{
    error::{Result, ScriptError},
    value::Value,
};

/// Stack size for worker, timer and fork threads. Deeply nested lazy
/// evaluation recurses on the native stack.
const STACK_SIZE: usize = 16 * 1024 * 1024;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Worker pool for parallel collection evaluation and forks.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    next_fork: AtomicU64,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("ripple-worker-{i}"))
            .stack_size(STACK_SIZE)
            .build()
            .map_err(|e| ScriptError::runtime(format!("failed to create worker pool: {e}")))?;
        Ok(WorkerPool {
            pool,
            next_fork: AtomicU64::new(1),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Apply `f` to every item on the pool. Results keep the input order and
    /// the first failure wins.
    pub fn map_ordered<T, R, F>(&self, items: &[T], f: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(&f).collect())
    }

    /// Run `job` in the background and return a handle to await it.
    pub fn fork<F>(&self, job: F) -> Arc<ForkHandle>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let handle = Arc::new(ForkHandle::new(self.next_fork.fetch_add(1, Ordering::Relaxed)));
        let completion = Arc::clone(&handle);
        self.pool.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                Err(ScriptError::runtime(format!(
                    "fork {} panicked",
                    completion.id()
                )))
            });
            if let Err(err) = &result {
                debug!(fork = completion.id(), "forked evaluation failed: {err}");
            }
            completion.complete(result);
        });
        handle
    }
}

/// The eventual result of a `fork`.
pub struct ForkHandle {
    id: u64,
    slot: Mutex<Option<Result<Value>>>,
    done: Condvar,
}

impl ForkHandle {
    fn new(id: u64) -> Self {
        ForkHandle {
            id,
            slot: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_done(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Block until the forked work finishes.
    pub fn wait(&self) -> Result<Value> {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = wait(&self.done, slot);
        }
    }

    fn complete(&self, result: Result<Value>) {
        *lock(&self.slot) = Some(result);
        self.done.notify_all();
    }
}

pub type ScheduleId = u64;

struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

/// Timer service behind `every`. Each schedule sleeps for its period, runs its
/// task on a blocking thread and re-arms until cancelled. A task that fails
/// cancels its own schedule.
pub struct Scheduler {
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    tasks: Arc<DashMap<ScheduleId, ScheduledTask>>,
    next: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            runtime: Mutex::new(None),
            tasks: Arc::new(DashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn handle(&self) -> Result<tokio::runtime::Handle> {
        let mut runtime = lock(&self.runtime);
        if let Some(runtime) = runtime.as_ref() {
            return Ok(runtime.handle().clone());
        }
        let built = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ripple-scheduler")
            .thread_stack_size(STACK_SIZE)
            .enable_time()
            .build()
            .map_err(|e| ScriptError::runtime(format!("failed to start the scheduler: {e}")))?;
        let handle = built.handle().clone();
        *runtime = Some(built);
        Ok(handle)
    }

    pub fn schedule<F>(&self, period: Duration, task: F) -> Result<ScheduleId>
    where
        F: Fn(ScheduleId) -> Result<()> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(ScriptError::runtime("a schedule period must be positive"));
        }
        let handle = self.handle()?;
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks.insert(
            id,
            ScheduledTask {
                cancelled: Arc::clone(&cancelled),
                abort: None,
            },
        );

        let task = Arc::new(task);
        let tasks = Arc::clone(&self.tasks);
        let join = handle.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                let task = Arc::clone(&task);
                match tokio::task::spawn_blocking(move || task(id)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => error!(schedule = id, "scheduled evaluation failed, cancelling: {err}"),
                    Err(err) => error!(schedule = id, "scheduled evaluation panicked: {err}"),
                }
                cancelled.store(true, Ordering::Release);
                tasks.remove(&id);
                break;
            }
        });
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            entry.abort = Some(join.abort_handle());
        }
        debug!(schedule = id, ?period, "scheduled");
        Ok(id)
    }

    /// Stop a schedule. Returns false if it was not active.
    pub fn cancel(&self, id: ScheduleId) -> bool {
        let Some((_, task)) = self.tasks.remove(&id) else {
            return false;
        };
        task.cancelled.store(true, Ordering::Release);
        if let Some(abort) = task.abort {
            abort.abort();
        }
        debug!(schedule = id, "cancelled");
        true
    }

    pub fn is_active(&self, id: ScheduleId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    pub fn shutdown(&self) {
        let ids: Vec<ScheduleId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.cancel(id);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

/// Convert a duration in seconds, as produced by the unit suffixes.
pub fn seconds(value: &Value) -> Result<Duration> {
    let secs = value.as_f64().ok_or_else(|| {
        ScriptError::runtime(format!(
            "expected a duration in seconds, found {}",
            value.type_name()
        ))
    })?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ScriptError::runtime(format!("invalid duration {secs}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn map_ordered_keeps_order() {
        let pool = WorkerPool::new(4).unwrap();
        let items: Vec<i64> = (0..100).collect();
        let doubled = pool.map_ordered(&items, |n| Ok(n * 2)).unwrap();
        assert_eq!(doubled, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn map_ordered_reports_failure() {
        let pool = WorkerPool::new(2).unwrap();
        let result = pool.map_ordered(&[1, 2, 3], |n| {
            if *n == 2 {
                Err(ScriptError::runtime("two"))
            } else {
                Ok(*n)
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn fork_can_be_awaited() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.fork(|| Ok(Value::Int(7)));
        assert_eq!(handle.wait().unwrap(), Value::Int(7));
        assert!(handle.is_done());
    }

    #[test]
    fn fork_panic_becomes_error() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.fork(|| panic!("boom"));
        assert!(handle.wait().is_err());
    }

    #[test]
    fn cancelled_schedule_stops_firing() {
        let scheduler = Arc::new(Scheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let canceller = Arc::clone(&scheduler);
        let id = scheduler
            .schedule(Duration::from_millis(1), move |id| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    canceller.cancel(id);
                }
                Ok(())
            })
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while scheduler.is_active(id) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_active(id));
    }

    #[test]
    fn failing_schedule_cancels_itself() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let id = scheduler
            .schedule(Duration::from_millis(1), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ScriptError::runtime("tick failed"))
            })
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while scheduler.is_active(id) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(!scheduler.is_active(id));
        assert_eq!(scheduler.active(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn seconds_rejects_negative() {
        assert_eq!(seconds(&Value::Decimal(0.5)).unwrap(), Duration::from_millis(500));
        assert!(seconds(&Value::Int(-1)).is_err());
        assert!(seconds(&Value::from("x")).is_err());
    }
}
