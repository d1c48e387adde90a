//! Once-per-second wall clock for the interactive menu.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

const TICK: Duration = Duration::from_secs(1);
const SLICE: Duration = Duration::from_millis(50);

/// Background thread that refreshes a shared `HH:MM:SS` string.
///
/// Dropping the ticker stops and joins the thread.
pub struct Ticker {
    current: Arc<Mutex<String>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start() -> Self {
        let current = Arc::new(Mutex::new(clock_now()));
        let stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::clone(&current);
        let stopped = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut waited = Duration::ZERO;
            while !stopped.load(Ordering::Relaxed) {
                thread::sleep(SLICE);
                waited += SLICE;
                if waited < TICK {
                    continue;
                }
                waited = Duration::ZERO;
                if let Ok(mut slot) = shared.lock() {
                    *slot = clock_now();
                }
            }
        });

        Self {
            current,
            stop,
            handle: Some(handle),
        }
    }

    /// Latest clock reading.
    pub fn now(&self) -> String {
        self.current
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn cancel(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn clock_now() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_has_clock_shape() {
        let ticker = Ticker::start();
        let reading = ticker.now();
        assert_eq!(reading.len(), 8, "unexpected reading {:?}", reading);
        assert_eq!(reading.as_bytes()[2], b':');
        assert_eq!(reading.as_bytes()[5], b':');
    }

    #[test]
    fn cancel_joins_thread() {
        let mut ticker = Ticker::start();
        assert!(ticker.is_running());
        ticker.cancel();
        assert!(!ticker.is_running());
        // Second cancel is a no-op.
        ticker.cancel();
    }
}
