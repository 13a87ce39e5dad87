//! One-shot timer scheduling.
//!
//! The timer thread orders pending timers by deadline and, at expiry, hands
//! the registered callback off for delivery (clients enqueue it onto their
//! user-event dispatch thread). Cancellation is first-come: cancelling an
//! already-fired or already-cancelled timer returns false.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

type FireFn = Box<dyn FnOnce() + Send>;

struct Entry {
    due: Instant,
    fire: FireFn,
}

#[derive(Default)]
struct TimerState {
    pending: HashMap<u64, Entry>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

pub(crate) struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("timer-service".into())
            .spawn(move || run_loop(worker))
            .expect("spawning the timer thread");
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedule `fire` to run once, `after` from now.
    pub fn schedule(&self, after: Duration, fire: FireFn) -> TimerId {
        let mut state = self.shared.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.pending.insert(
            id,
            Entry {
                due: Instant::now() + after,
                fire,
            },
        );
        self.shared.cond.notify_all();
        TimerId(id)
    }

    /// Cancel a pending timer; false when it already fired or was already
    /// cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        state.pending.remove(&id.0).is_some()
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.pending.clear();
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
        let due_id = state
            .pending
            .iter()
            .filter(|(_, e)| e.due <= now)
            .min_by_key(|(_, e)| e.due)
            .map(|(id, _)| *id);

        if let Some(id) = due_id {
            let entry = state.pending.remove(&id).expect("due timer present");
            drop(state);
            (entry.fire)();
            state = shared.state.lock().unwrap();
            continue;
        }

        let earliest = state.pending.values().map(|e| e.due).min();
        state = match earliest {
            Some(due) => shared.cond.wait_timeout(state, due - now).unwrap().0,
            None => shared.cond.wait(state).unwrap(),
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn timers_fire_in_deadline_order() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        timers.schedule(Duration::from_millis(40), Box::new(move || tx1.send(2).unwrap()));
        let tx2 = tx.clone();
        timers.schedule(Duration::from_millis(10), Box::new(move || tx2.send(1).unwrap()));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        timers.shutdown();
    }

    #[test]
    fn cancel_is_first_come() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = timers.schedule(Duration::from_millis(50), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timers.shutdown();
    }

    #[test]
    fn cancel_after_fire_returns_false() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let id = timers.schedule(Duration::from_millis(5), Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // Give the worker a beat to retire the entry.
        std::thread::sleep(Duration::from_millis(10));
        assert!(!timers.cancel(id));
        timers.shutdown();
    }
}
