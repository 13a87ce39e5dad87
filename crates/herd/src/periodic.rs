//! The cooperative periodic-task runner.
//!
//! One worker thread invokes registered tasks at their cadence, in
//! registration order when several are due. A task's error is logged and
//! swallowed; a panic is caught and logged. Cancellation blocks until any
//! in-flight invocation of the task finishes, and nothing runs after
//! shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PeriodicId(u64);

/// A task to run every `period`.
pub struct PeriodicTask {
    pub name: String,
    pub period: Duration,
    pub run: Box<dyn FnMut() -> anyhow::Result<()> + Send>,
}

impl PeriodicTask {
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        run: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            run: Box::new(run),
        }
    }
}

struct Entry {
    id: PeriodicId,
    name: String,
    period: Duration,
    next_due: Instant,
    run: Box<dyn FnMut() -> anyhow::Result<()> + Send>,
}

#[derive(Default)]
struct RunnerState {
    tasks: VecDeque<Entry>,
    next_id: u64,
    /// Task currently executing outside the lock, if any.
    running: Option<PeriodicId>,
    /// Cancellations that arrived while their task was running.
    cancel_requested: std::collections::HashSet<PeriodicId>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<RunnerState>,
    cond: Condvar,
}

pub(crate) struct Runner {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(RunnerState::default()),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("periodic-runner".into())
            .spawn(move || run_loop(worker))
            .expect("spawning the periodic runner thread");
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn register(&self, task: PeriodicTask) -> PeriodicId {
        let mut state = self.shared.state.lock().unwrap();
        state.next_id += 1;
        let id = PeriodicId(state.next_id);
        tracing::debug!(name = %task.name, period = ?task.period, "periodic task registered");
        state.tasks.push_back(Entry {
            id,
            name: task.name,
            period: task.period,
            next_due: Instant::now() + task.period,
            run: task.run,
        });
        self.shared.cond.notify_all();
        id
    }

    /// Cancel a task, waiting out any in-flight invocation. False when the
    /// id is unknown (including a second cancel).
    pub fn cancel(&self, id: PeriodicId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.running == Some(id) {
            state.cancel_requested.insert(id);
            while state.running == Some(id) {
                state = self.shared.cond.wait(state).unwrap();
            }
            return true;
        }
        let before = state.tasks.len();
        state.tasks.retain(|t| t.id != id);
        state.tasks.len() != before
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let due_index = state
            .tasks
            .iter()
            .position(|t| t.next_due <= now)
            .filter(|_| state.running.is_none());

        let Some(index) = due_index else {
            let earliest = state.tasks.iter().map(|t| t.next_due).min();
            state = match earliest {
                Some(due) if due > now => shared.cond.wait_timeout(state, due - now).unwrap().0,
                Some(_) => state,
                None => shared.cond.wait(state).unwrap(),
            };
            continue;
        };

        let mut entry = state.tasks.remove(index).expect("due index in bounds");
        state.running = Some(entry.id);
        drop(state);

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (entry.run)()));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(task = %entry.name, error = %e, "periodic task failed"),
            Err(_) => tracing::error!(task = %entry.name, "periodic task panicked"),
        }

        state = shared.state.lock().unwrap();
        state.running = None;
        if state.cancel_requested.remove(&entry.id) || state.shutdown {
            // Cancelled mid-run; the entry is simply dropped.
        } else {
            entry.next_due = Instant::now() + entry.period;
            let insert_at = index.min(state.tasks.len());
            state.tasks.insert(insert_at, entry);
        }
        shared.cond.notify_all();
    }
}
