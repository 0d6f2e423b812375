//! Single-consumer work queue with cooperative cancellation.
//!
//! Each owner that needs serial execution (the broadcaster, every device
//! server) runs its own `Dispatcher`. Producers hand closures to [`invoke`];
//! a dedicated worker thread runs them strictly in submission order. The
//! queue is bounded: when it is full the oldest queued task is dropped and a
//! warning is logged.
//!
//! Cancellation is cooperative. [`stop`] discards tasks that have not started
//! yet; the task currently running is allowed to finish, observing the
//! [`CancellationToken`] at its next checkpoint (typically inside
//! [`CancellationToken::sleep_for`]).
//!
//! [`invoke`]: Dispatcher::invoke
//! [`stop`]: Dispatcher::stop

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default bound on queued tasks.
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// Granularity at which [`CancellationToken::sleep_for`] re-checks the flag.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Shared flag handed to every task so long sleeps can be interrupted.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if the dispatcher was stopped while sleeping.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
        !self.is_cancelled()
    }
}

type Task = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

/// Single-consumer FIFO work queue.
pub struct Dispatcher {
    name: String,
    tx: Mutex<Option<Sender<Task>>>,
    rx: Receiver<Task>,
    cancelled: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher whose queue holds at most `capacity` tasks.
    pub fn new(name: &str, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// Spawn the consumer thread. Tasks queued before `start` run once it is up.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let rx = self.rx.clone();
        let token = CancellationToken {
            cancelled: Arc::clone(&self.cancelled),
        };
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("dispatch-{}", name))
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    if token.is_cancelled() {
                        // Queued work is discarded on stop; only the in-flight
                        // task runs to completion.
                        continue;
                    }
                    // A failing task must not take the consumer down with it.
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        task(&token);
                    }));
                    if result.is_err() {
                        log::error!("dispatcher '{}' task panicked", name);
                    }
                }
                log::debug!("dispatcher '{}' exiting", name);
            })
            .expect("failed to spawn dispatcher thread");
        *worker = Some(handle);
    }

    /// Enqueue `task`. Never blocks the caller and never runs `task` inline.
    ///
    /// When the queue is full the oldest queued task is displaced.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            log::warn!("dispatcher '{}' is stopped, task discarded", self.name);
            return;
        };
        let mut task: Task = Box::new(task);
        loop {
            match tx.try_send(task) {
                Ok(()) => return,
                Err(TrySendError::Full(t)) => {
                    if self.rx.try_recv().is_ok() {
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped.is_power_of_two() {
                            log::warn!(
                                "dispatcher '{}' queue full, dropped {} task(s) so far",
                                self.name,
                                dropped
                            );
                        }
                    }
                    task = t;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Total number of tasks displaced by queue overflow.
    pub fn dropped_tasks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Cancel queued tasks, wait for the worker to observe cancellation, join.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        // Dropping the sender disconnects the channel and wakes the worker.
        *self.tx.lock() = None;
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // Anything still queued was never started; drop it now.
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_fifo_order_off_thread() {
        let dispatcher = Dispatcher::new("test", 16);
        dispatcher.start();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let caller = thread::current().id();
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            dispatcher.invoke(move |_| {
                assert_ne!(thread::current().id(), caller);
                seen.lock().unwrap().push(i);
            });
        }

        // Tasks run in submission order once the worker drains the queue.
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let dispatcher = Dispatcher::new("test", 2);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            dispatcher.invoke(move |_| seen.lock().unwrap().push(i));
        }
        assert_eq!(dispatcher.dropped_tasks(), 2);

        dispatcher.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_stop_discards_pending() {
        let dispatcher = Dispatcher::new("test", 8);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            dispatcher.invoke(move |_| seen.lock().unwrap().push(i));
        }
        // Never started: stop must discard everything without running it.
        dispatcher.stop();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_in_flight_task_observes_cancellation() {
        let dispatcher = Dispatcher::new("test", 8);
        dispatcher.start();

        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        dispatcher.invoke(move |token| {
            while token.sleep_for(Duration::from_millis(10)) {}
            flag.store(true, Ordering::Relaxed);
        });

        thread::sleep(Duration::from_millis(30));
        dispatcher.stop();
        assert!(observed.load(Ordering::Relaxed));
    }

    #[test]
    fn test_invoke_after_stop_is_noop() {
        let dispatcher = Dispatcher::new("test", 8);
        dispatcher.start();
        dispatcher.stop();
        dispatcher.invoke(|_| panic!("must not run"));
        thread::sleep(Duration::from_millis(20));
    }
}
