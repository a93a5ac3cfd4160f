//! Periodic background sweep thread.

use parking_lot::{Condvar, Mutex};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct StopFlag {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to a running sweep thread.
///
/// The thread calls its task once per interval until [`Sweeper::stop`] is
/// called. A sweep in progress is never interrupted; the stop flag is checked
/// between iterations.
pub struct Sweeper {
    flag: Arc<StopFlag>,
    done: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweep thread.
    pub fn spawn<F>(interval: Duration, task: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let flag = Arc::new(StopFlag {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let (done_tx, done) = mpsc::channel();

        let thread_flag = flag.clone();
        let handle = std::thread::Builder::new()
            .name("qvm-session-sweep".to_string())
            .spawn(move || {
                tracing::debug!(interval = ?interval, "session sweep started");
                loop {
                    {
                        let mut stopped = thread_flag.stopped.lock();
                        if !*stopped {
                            thread_flag.wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    task();
                }
                tracing::debug!("session sweep stopped");
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            flag,
            done,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait up to `timeout` for it to exit.
    ///
    /// Returns true if the thread exited in time. A thread that does not
    /// finish in time is detached.
    pub fn stop(mut self, timeout: Duration) -> bool {
        {
            let mut stopped = self.flag.stopped.lock();
            *stopped = true;
            self.flag.wake.notify_all();
        }

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout = ?timeout, "session sweep did not stop in time, detaching");
                self.handle.take();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_runs_periodically_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sweeper = Sweeper::spawn(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert!(sweeper.stop(Duration::from_secs(2)));
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several sweeps, got {}", seen);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_stop_wakes_long_interval() {
        let sweeper = Sweeper::spawn(Duration::from_secs(3600), || {}).unwrap();
        let start = Instant::now();
        assert!(sweeper.stop(Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_is_bounded_when_task_hangs() {
        let sweeper = Sweeper::spawn(Duration::from_millis(1), || {
            std::thread::sleep(Duration::from_secs(2));
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert!(!sweeper.stop(Duration::from_millis(100)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
