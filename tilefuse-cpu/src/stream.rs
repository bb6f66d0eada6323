//! In-order streams and events.
//!
//! A stream is a worker thread draining a FIFO of tasks. Work tasks may
//! fail; the first failure is kept and returned by the next
//! [`synchronize`](StreamOps::synchronize). Once a stream has failed it
//! skips remaining work but still fires event records, so other streams
//! waiting on it do not hang.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tilefuse::backend::StreamOps;
use tilefuse::{Error, Result};
use tracing::{trace, warn};

use crate::config::CpuConfig;

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

enum Task {
    Work(&'static str, Work),
    Record(CpuEvent, u64),
    Wait(CpuEvent, u64),
}

static NEXT_STREAM_ID: AtomicUsize = AtomicUsize::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---- Events ----

#[derive(Default)]
struct EventState {
    /// Generation of the latest enqueued record.
    recorded: u64,
    /// Highest generation whose record has executed.
    completed: u64,
}

/// Marker recorded on one stream and waited on by others.
#[derive(Clone, Default)]
pub struct CpuEvent {
    inner: Arc<(Mutex<EventState>, Condvar)>,
}

impl std::fmt::Debug for CpuEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.0);
        f.debug_struct("CpuEvent")
            .field("recorded", &state.recorded)
            .field("completed", &state.completed)
            .finish()
    }
}

impl CpuEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every record enqueued so far has executed.
    pub fn query(&self) -> bool {
        let state = lock(&self.inner.0);
        state.completed >= state.recorded
    }

    fn next_generation(&self) -> u64 {
        let mut state = lock(&self.inner.0);
        state.recorded += 1;
        state.recorded
    }

    fn target(&self) -> u64 {
        lock(&self.inner.0).recorded
    }

    fn complete(&self, generation: u64) {
        let (mutex, cv) = &*self.inner;
        let mut state = lock(mutex);
        state.completed = state.completed.max(generation);
        cv.notify_all();
    }

    fn wait_for(&self, generation: u64, timeout: Option<Duration>) -> Result<()> {
        let (mutex, cv) = &*self.inner;
        let start = Instant::now();
        let mut state = lock(mutex);
        while state.completed < generation {
            match timeout {
                Some(limit) => {
                    let waited = start.elapsed();
                    if waited >= limit {
                        return Err(Error::DeviceFailure(format!(
                            "event generation {generation} not reached after {} ms",
                            waited.as_millis()
                        )));
                    }
                    state = cv
                        .wait_timeout(state, limit - waited)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = cv.wait(state).unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            }
        }
        Ok(())
    }
}

// ---- Streams ----

#[derive(Default)]
struct Progress {
    enqueued: u64,
    completed: u64,
    error: Option<Error>,
}

struct StreamInner {
    id: usize,
    device: usize,
    config: Arc<CpuConfig>,
    sender: Mutex<Sender<Task>>,
    progress: Arc<(Mutex<Progress>, Condvar)>,
}

/// An in-order work queue bound to one device.
#[derive(Clone)]
pub struct CpuStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for CpuStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuStream")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .finish_non_exhaustive()
    }
}

impl CpuStream {
    /// Spawn a stream worker for `device`.
    ///
    /// # Errors
    /// Returns `Io` if the worker thread cannot be spawned.
    pub fn new(device: usize, config: Arc<CpuConfig>) -> Result<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Task>();
        let progress: Arc<(Mutex<Progress>, Condvar)> = Arc::default();
        let worker_progress = Arc::clone(&progress);
        let timeout = config.flag_timeout();

        std::thread::Builder::new()
            .name(format!("tilefuse-stream-{device}-{id}"))
            .spawn(move || {
                for task in receiver {
                    let failed = lock(&worker_progress.0).error.is_some();
                    let outcome = match task {
                        Task::Record(event, generation) => {
                            event.complete(generation);
                            Ok(())
                        }
                        Task::Wait(_, _) if failed => Ok(()),
                        Task::Wait(event, generation) => event.wait_for(generation, timeout),
                        Task::Work(name, _) if failed => {
                            trace!(stream = id, task = name, "skipped after failure");
                            Ok(())
                        }
                        Task::Work(name, work) => match catch_unwind(AssertUnwindSafe(work)) {
                            Ok(result) => result.map_err(|e| {
                                warn!(stream = id, task = name, error = %e, "stream task failed");
                                e
                            }),
                            Err(panic) => Err(Error::DeviceFailure(format!(
                                "{name} panicked: {}",
                                panic_message(panic.as_ref())
                            ))),
                        },
                    };
                    let (mutex, cv) = &*worker_progress;
                    let mut progress = lock(mutex);
                    if let Err(e) = outcome {
                        progress.error.get_or_insert(e);
                    }
                    progress.completed += 1;
                    cv.notify_all();
                }
            })?;

        Ok(Self {
            inner: Arc::new(StreamInner {
                id,
                device,
                config,
                sender: Mutex::new(sender),
                progress,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn config(&self) -> &CpuConfig {
        &self.inner.config
    }

    fn push(&self, task: Task) -> Result<()> {
        lock(&self.inner.progress.0).enqueued += 1;
        lock(&self.inner.sender)
            .send(task)
            .map_err(|_| Error::DeviceFailure(format!("stream {} worker has exited", self.inner.id)))
    }

    /// Enqueue a closure. `name` labels it in logs and failures.
    pub fn enqueue(&self, name: &'static str, work: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.push(Task::Work(name, Box::new(work)))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl StreamOps for CpuStream {
    type Event = CpuEvent;

    fn device(&self) -> usize {
        self.inner.device
    }

    fn create_event(&self) -> CpuEvent {
        CpuEvent::new()
    }

    fn record(&self, event: &CpuEvent) -> Result<()> {
        let generation = event.next_generation();
        self.push(Task::Record(event.clone(), generation))
    }

    fn wait_event(&self, event: &CpuEvent) -> Result<()> {
        let target = event.target();
        if target == 0 {
            return Ok(());
        }
        self.push(Task::Wait(event.clone(), target))
    }

    fn synchronize(&self) -> Result<()> {
        let (mutex, cv) = &*self.inner.progress;
        let mut progress = lock(mutex);
        let target = progress.enqueued;
        while progress.completed < target {
            progress = cv.wait(progress).unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        match progress.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn stream() -> CpuStream {
        CpuStream::new(0, Arc::new(CpuConfig::default())).unwrap()
    }

    #[test]
    fn test_tasks_run_in_order() {
        let s = stream();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            s.enqueue("push", move || {
                log.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        s.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_event_orders_streams() {
        let a = stream();
        let b = stream();
        let value = Arc::new(AtomicU32::new(0));
        let event = a.create_event();
        {
            let value = Arc::clone(&value);
            a.enqueue("slow write", move || {
                std::thread::sleep(Duration::from_millis(20));
                value.store(7, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        a.record(&event).unwrap();
        b.wait_event(&event).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        {
            let (value, seen) = (Arc::clone(&value), Arc::clone(&seen));
            b.enqueue("read", move || {
                seen.store(value.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        b.synchronize().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(event.query());
    }

    #[test]
    fn test_failure_surfaces_once_and_records_still_fire() {
        let s = stream();
        let event = s.create_event();
        s.enqueue("fail", || Err(Error::DeviceFailure("boom".into()))).unwrap();
        s.enqueue("panic", || panic!("never runs")).unwrap();
        s.record(&event).unwrap();
        assert!(matches!(s.synchronize(), Err(Error::DeviceFailure(m)) if m == "boom"));
        assert!(event.query());
    }

    #[test]
    fn test_panic_becomes_device_failure() {
        let s = stream();
        s.enqueue("panic", || panic!("bad tile")).unwrap();
        let err = s.synchronize().unwrap_err();
        assert!(err.to_string().contains("bad tile"));
    }

    #[test]
    fn test_same_queue() {
        let a = stream();
        assert!(a.same_queue(&a.clone()));
        assert!(!a.same_queue(&stream()));
    }
}
