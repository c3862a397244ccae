use std::fmt::Display;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    pub concurrency: usize,
    pub wave_delay: Duration,
    pub await_completion: bool,
    pub drain_poll: Duration,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            wave_delay: Duration::from_millis(200),
            await_completion: true,
            drain_poll: DEFAULT_DRAIN_POLL,
        }
    }
}

impl ScheduleOptions {
    pub fn new(concurrency: usize, wave_delay: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            wave_delay,
            ..Self::default()
        }
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.await_completion = false;
        self
    }
}

/// One unit of work plus its position in the submitted list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub index: usize,
    pub total: usize,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dispatching,
    Draining,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_index: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub total: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

struct RunState {
    next_index: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    phase: Mutex<Phase>,
    settled: Notify,
}

impl RunState {
    fn new() -> Self {
        Self {
            next_index: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            phase: Mutex::new(Phase::Idle),
            settled: Notify::new(),
        }
    }

    fn snapshot(&self) -> ScheduleState {
        ScheduleState {
            next_index: self.next_index.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Done)
    }
}

/// Releases an in-flight slot when the task that owns it finishes, including
/// when it unwinds from a panic.
struct SlotGuard {
    state: Arc<RunState>,
    index: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(index = self.index, "work item panicked");
            self.state.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.state.completed.fetch_add(1, Ordering::SeqCst);
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.settled.notify_one();
    }
}

/// Observes or cancels a running [`Scheduler`].
#[derive(Clone)]
pub struct ScheduleHandle {
    state: Arc<RunState>,
    cancel: CancellationToken,
}

impl ScheduleHandle {
    pub fn state(&self) -> ScheduleState {
        self.state.snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Drives an ordered list through an async worker with at most
/// `concurrency` invocations in flight. One scheduler serves one run.
pub struct Scheduler {
    options: ScheduleOptions,
    state: Arc<RunState>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(options: ScheduleOptions) -> Self {
        Self {
            options: ScheduleOptions {
                concurrency: options.concurrency.max(1),
                ..options
            },
            state: Arc::new(RunState::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle(&self) -> ScheduleHandle {
        ScheduleHandle {
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        }
    }

    pub async fn process_all<T, C, F, Fut, E>(
        self,
        items: Vec<T>,
        context: Arc<C>,
        worker: F,
    ) -> ScheduleSummary
    where
        T: Send + 'static,
        C: Send + Sync + 'static,
        F: Fn(WorkItem<T>, Arc<C>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let concurrency = self.options.concurrency;
        let state = Arc::clone(&self.state);
        let mut pending = items.into_iter().enumerate();
        let mut cursor = 0usize;
        let mut cancelled = false;

        state.set_phase(Phase::Dispatching);
        while cursor < total {
            if self.cancel.is_cancelled() {
                warn!(dispatched = cursor, total, "scheduling cancelled");
                cancelled = true;
                break;
            }

            let free = concurrency.saturating_sub(state.active.load(Ordering::SeqCst));
            if free == 0 {
                self.wait_for_slot().await;
                continue;
            }

            let launch = free.min(total - cursor);
            for _ in 0..launch {
                let Some((index, value)) = pending.next() else {
                    break;
                };
                state.active.fetch_add(1, Ordering::SeqCst);
                cursor += 1;
                state.next_index.store(cursor, Ordering::SeqCst);
                let guard = SlotGuard {
                    state: Arc::clone(&state),
                    index,
                };
                let item = WorkItem {
                    index,
                    total,
                    value,
                };
                let ctx = Arc::clone(&context);
                match catch_unwind(AssertUnwindSafe(|| worker(item, ctx))) {
                    Ok(task) => {
                        let task_state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(err) = task.await {
                                error!(index, error = %err, "work item failed");
                                task_state.failed.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                    }
                    Err(_) => {
                        error!(index, "worker panicked before producing a task");
                        state.failed.fetch_add(1, Ordering::SeqCst);
                        drop(guard);
                    }
                }
            }
            debug!(
                dispatched = cursor,
                total,
                in_flight = state.active.load(Ordering::SeqCst),
                "wave launched"
            );

            if cursor < total && !self.options.wave_delay.is_zero() {
                tokio::time::sleep(self.options.wave_delay).await;
            }
        }

        if self.options.await_completion {
            state.set_phase(Phase::Draining);
            while state.active.load(Ordering::SeqCst) > 0 {
                self.wait_for_settle().await;
            }
        }
        state.set_phase(Phase::Done);

        let snapshot = state.snapshot();
        ScheduleSummary {
            total,
            dispatched: cursor,
            completed: snapshot.completed,
            failed: snapshot.failed,
            cancelled,
            elapsed: started.elapsed(),
        }
    }

    async fn wait_for_slot(&self) {
        tokio::select! {
            _ = self.state.settled.notified() => {}
            _ = tokio::time::sleep(self.options.drain_poll) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn wait_for_settle(&self) {
        tokio::select! {
            _ = self.state.settled.notified() => {}
            _ = tokio::time::sleep(self.options.drain_poll) => {}
        }
    }
}
