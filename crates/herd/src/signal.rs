//! Keyed epoch/condvar cells.
//!
//! Lock waiters, sync barriers and queue takers all park here: a waiter
//! takes a reference on a string key, captures the cell's epoch *before*
//! arming its watch, and then waits for the epoch to advance. The event
//! pipeline signals the key when the corresponding store event is observed,
//! waking every waiter; an advance that races ahead of the wait is caught
//! by the stale captured epoch. Cells are reference counted and dropped at
//! zero, so the map stays bounded.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct SignalCell {
    state: Mutex<CellState>,
    cond: Condvar,
}

#[derive(Default)]
struct CellState {
    epoch: u64,
    cancelled: bool,
    refs: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Wait {
    Signalled,
    TimedOut,
    Cancelled,
}

impl SignalCell {
    /// Epoch to pass to [`SignalCell::wait_change`]; capture it before
    /// arming the watch whose event will advance it.
    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    /// Wait until the epoch differs from `seen`, the deadline passes, or
    /// the map is cancelled.
    pub fn wait_change(&self, seen: u64, timeout: Option<Duration>) -> Wait {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.cancelled {
                return Wait::Cancelled;
            }
            if state.epoch != seen {
                return Wait::Signalled;
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wait::TimedOut;
                    }
                    let (s, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = s;
                }
            }
        }
    }
}

#[derive(Default)]
pub struct SignalMap {
    cells: Mutex<HashMap<String, Arc<SignalCell>>>,
    cancelled: std::sync::atomic::AtomicBool,
}

impl SignalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on the cell for `key`, creating it if needed.
    /// Pair every call with [`SignalMap::remove_ref`].
    pub fn add_ref(&self, key: &str) -> Arc<SignalCell> {
        let mut cells = self.cells.lock().unwrap();
        let cell = cells
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(SignalCell {
                    state: Mutex::new(CellState::default()),
                    cond: Condvar::new(),
                })
            })
            .clone();
        let mut state = cell.state.lock().unwrap();
        state.refs += 1;
        if self.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
            state.cancelled = true;
        }
        drop(state);
        cell
    }

    /// Release a reference on `key`, dropping the cell at zero.
    pub fn remove_ref(&self, key: &str) {
        let mut cells = self.cells.lock().unwrap();
        let drop_cell = match cells.get(key) {
            Some(cell) => {
                let mut state = cell.state.lock().unwrap();
                if state.refs == 0 {
                    tracing::error!(%key, "signal cell released more times than referenced");
                    false
                } else {
                    state.refs -= 1;
                    state.refs == 0
                }
            }
            None => false,
        };
        if drop_cell {
            cells.remove(key);
        }
    }

    /// Advance the epoch of `key`, waking all of its waiters. A key nobody
    /// references is a no-op.
    pub fn signal(&self, key: &str) {
        let cells = self.cells.lock().unwrap();
        if let Some(cell) = cells.get(key) {
            let mut state = cell.state.lock().unwrap();
            state.epoch += 1;
            cell.cond.notify_all();
        }
    }

    /// Wake every current and future waiter with [`Wait::Cancelled`].
    pub fn cancel_all(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        let cells = self.cells.lock().unwrap();
        for cell in cells.values() {
            let mut state = cell.state.lock().unwrap();
            state.cancelled = true;
            cell.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_between_capture_and_wait_is_not_lost() {
        let map = SignalMap::new();
        let cell = map.add_ref("k");
        let seen = cell.epoch();
        map.signal("k");
        assert_eq!(cell.wait_change(seen, Some(Duration::from_millis(10))), Wait::Signalled);
        map.remove_ref("k");
    }

    #[test]
    fn wait_times_out() {
        let map = SignalMap::new();
        let cell = map.add_ref("k");
        let seen = cell.epoch();
        assert_eq!(cell.wait_change(seen, Some(Duration::from_millis(10))), Wait::TimedOut);
        map.remove_ref("k");
    }

    #[test]
    fn signal_wakes_every_waiter() {
        let map = Arc::new(SignalMap::new());
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let m = map.clone();
            waiters.push(std::thread::spawn(move || {
                let cell = m.add_ref("shared");
                let seen = cell.epoch();
                let w = cell.wait_change(seen, Some(Duration::from_secs(5)));
                m.remove_ref("shared");
                w
            }));
        }
        std::thread::sleep(Duration::from_millis(30));
        map.signal("shared");
        for w in waiters {
            assert_eq!(w.join().unwrap(), Wait::Signalled);
        }
    }

    #[test]
    fn unreferenced_key_signal_is_a_noop() {
        let map = SignalMap::new();
        map.signal("nobody");
        let cell = map.add_ref("nobody");
        // The earlier signal happened before any reference existed.
        assert_eq!(cell.epoch(), 0);
        map.remove_ref("nobody");
    }

    #[test]
    fn cancel_is_terminal_for_new_waiters() {
        let map = Arc::new(SignalMap::new());
        let m = map.clone();
        let waiter = std::thread::spawn(move || {
            let cell = m.add_ref("doomed");
            let seen = cell.epoch();
            let w = cell.wait_change(seen, None);
            m.remove_ref("doomed");
            w
        });
        std::thread::sleep(Duration::from_millis(20));
        map.cancel_all();
        assert_eq!(waiter.join().unwrap(), Wait::Cancelled);

        let cell = map.add_ref("later");
        assert_eq!(cell.wait_change(cell.epoch(), None), Wait::Cancelled);
        map.remove_ref("later");
    }
}
