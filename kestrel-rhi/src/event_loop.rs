//! Application event loop that receives completion work posted from the notifier thread.
//!
//! The application owns the `EventLoop` and pumps it from its main thread; any number of
//! `EventLoopProxy` clones post closures into it. Tasks still queued when the loop drops run
//! on the dropping thread; later posts fail and the notifier runs those itself.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

pub type LoopTask = Box<dyn FnOnce() + Send + 'static>;

pub struct EventLoop {
    sender: Sender<LoopTask>,
    receiver: Receiver<LoopTask>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn proxy(&self) -> EventLoopProxy {
        EventLoopProxy {
            sender: self.sender.clone(),
        }
    }

    /// Number of posted tasks not yet run.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Run every task already queued without blocking. Returns how many ran.
    #[profiling::function]
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run tasks as they arrive until `timeout` has elapsed. Returns how many ran.
    pub fn run_for(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            match self.receiver.recv_deadline(deadline) {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return ran,
            }
        }
    }

    /// Run tasks until `done` returns true or `timeout` elapses. Returns whether `done` held.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            match self.receiver.recv_deadline(deadline) {
                Ok(task) => task(),
                Err(_) => return done(),
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("event loop task panicked while the loop was dropped");
            }
            ran += 1;
        }
        if ran > 0 {
            log::debug!("event loop ran {ran} leftover tasks on drop");
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("pending", &self.pending()).finish()
    }
}

/// Sending half of an `EventLoop`; cheap to clone and `Send`.
#[derive(Clone)]
pub struct EventLoopProxy {
    sender: Sender<LoopTask>,
}

impl EventLoopProxy {
    /// Queue `task` on the loop. Gives the task back if the loop no longer exists.
    pub fn post(&self, task: LoopTask) -> Result<(), LoopTask> {
        self.sender.send(task).map_err(|err| err.into_inner())
    }
}

impl fmt::Debug for EventLoopProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventLoopProxy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn posted_tasks_run_on_the_pumping_thread() {
        let event_loop = EventLoop::new();
        let proxy = event_loop.proxy();
        let counter = Arc::new(AtomicUsize::new(0));
        let main = std::thread::current().id();

        let handle = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    let counter = counter.clone();
                    proxy
                        .post(Box::new(move || {
                            assert_eq!(std::thread::current().id(), main);
                            counter.fetch_add(1, Ordering::SeqCst);
                        }))
                        .ok()
                        .unwrap();
                }
            })
        };
        handle.join().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.run_pending(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(event_loop.run_for(Duration::from_millis(5)), 0);
    }

    #[test]
    fn post_fails_after_the_loop_is_gone() {
        let event_loop = EventLoop::new();
        let proxy = event_loop.proxy();
        drop(event_loop);
        assert!(proxy.post(Box::new(|| {})).is_err());
    }

    #[test]
    fn dropping_the_loop_runs_queued_tasks() {
        let event_loop = EventLoop::new();
        let proxy = event_loop.proxy();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = counter.clone();
            proxy.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })).ok().unwrap();
        }
        proxy.post(Box::new(|| panic!("task failure"))).ok().unwrap();

        assert_eq!(event_loop.pending(), 3);
        drop(event_loop);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
