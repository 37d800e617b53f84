//! Cancellable delayed tasks on a tokio runtime.

use crate::driver::DeviceError;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

type Registry = Mutex<HashMap<u64, AbortHandle>>;

/// Locks `mutex`, recovering the data of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scheduled task. Dropping the handle leaves the task scheduled.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    abort: AbortHandle,
    registry: Weak<Registry>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.abort.abort();
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct Scheduler {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    tasks: Arc<Registry>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Runs timers on a runtime owned by the scheduler.
    pub fn new(worker_threads: usize) -> Result<Self, DeviceError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("mesh-transport")
            .enable_time()
            .build()
            .map_err(|_| DeviceError::Runtime)?;
        let handle = runtime.handle().clone();
        Ok(Self::build(handle, Some(runtime)))
    }

    /// Runs timers on the caller's runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self::build(handle, None)
    }

    fn build(handle: Handle, runtime: Option<Runtime>) -> Self {
        Self {
            handle,
            runtime: Mutex::new(runtime),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Runs `task` once `delay` has elapsed, unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<TimerHandle, DeviceError>
    where
        F: FnOnce() + Send + 'static,
    {
        // held across spawn so the task cannot deregister before it is registered
        let mut tasks = lock(&self.tasks);
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DeviceError::ShutDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(&self.tasks);
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                lock(&registry).remove(&id);
            }
            task();
        });
        let abort = join.abort_handle();
        tasks.insert(id, abort.clone());
        trace!("timer {} armed for {} ms", id, delay.as_millis() as u64);

        Ok(TimerHandle {
            id,
            abort,
            registry: Arc::downgrade(&self.tasks),
        })
    }

    /// Number of tasks scheduled and not yet run or cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Aborts every outstanding task and refuses new ones.
    pub fn shutdown(&self) {
        let aborted = {
            let mut tasks = lock(&self.tasks);
            self.shut_down.store(true, Ordering::Release);
            let aborted = tasks.len();
            for (_, abort) in tasks.drain() {
                abort.abort();
            }
            aborted
        };
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
        debug!("scheduler shut down, {} timers aborted", aborted);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let scheduler = Scheduler::with_handle(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler
            .schedule(Duration::from_millis(150), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(1, scheduler.pending());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(0, fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(1, fired.load(Ordering::SeqCst));
        assert_eq!(0, scheduler.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let scheduler = Scheduler::with_handle(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = scheduler
            .schedule(Duration::from_secs(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.cancel();
        assert_eq!(0, scheduler.pending());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(0, fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_tasks() {
        let scheduler = Scheduler::with_handle(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler
            .schedule(Duration::from_secs(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.shutdown();

        assert_eq!(
            DeviceError::ShutDown,
            scheduler.schedule(Duration::from_secs(1), || {}).unwrap_err()
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(0, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_owned_runtime() {
        let scheduler = Scheduler::new(1).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        scheduler
            .schedule(Duration::from_millis(10), move || {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        scheduler.shutdown();
    }
}
