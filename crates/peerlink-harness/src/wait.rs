//! Polling helpers for synchronous tests.
//!
//! Endpoints own their runtime and `stop()` must be called off the reactor,
//! so integration tests are plain `#[test]` functions that poll broadcast
//! receivers with a deadline.

use std::{
    thread,
    time::{Duration, Instant},
};

use tokio::sync::broadcast::{self, error::TryRecvError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Next value on `rx`, or `None` after `timeout`.
pub fn recv_within<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) -> Option<T> {
    recv_matching(rx, timeout, |_| true)
}

/// Next value on `rx` satisfying `pred`, skipping others, or `None` after
/// `timeout`.
pub fn recv_matching<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
    mut pred: impl FnMut(&T) -> bool,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(value) if pred(&value) => return Some(value),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return None,
            Err(TryRecvError::Empty) => {},
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
