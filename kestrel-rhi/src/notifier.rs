//! Completion notifier: one background thread per device that waits on in-flight fences and
//! fires the operation registered for each.
//!
//! Registrations land in a condition-variable guarded queue. The thread starts on the first
//! registration, moves queued entries into its private pending list, and waits on all pending
//! fences at once with a bounded timeout so new registrations are picked up promptly. For each
//! signaled fence the entry is removed, its operation is invoked (directly or posted to the
//! application event loop), and the fence goes back to the pool.
//!
//! At shutdown every pending entry is drained: signaled fences complete normally, the rest
//! are reported as cancelled. No entry is ever dropped without its operation running.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use parking_lot::{Condvar, Mutex};
use kestrel_core::collections::SmallVec;

use crate::backend::NativeFence;
use crate::error::{RhiError, RhiResult};
use crate::event_loop::EventLoopProxy;
use crate::synchronization::{Fence, FencePool};

/// Terminal status delivered to every completion operation, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// The GPU finished the work.
    Completed,
    /// The device shut down before the work was observed to finish.
    Cancelled,
    /// The work was never executed: submission was rejected or the device was lost.
    Failed,
}

pub type CompletionOperation = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Where a completion operation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// On the notifier thread, immediately.
    #[default]
    Direct,
    /// Posted to the application event loop.
    EventLoop,
}

struct PendingCompletion {
    fence: Fence,
    operation: CompletionOperation,
    delivery: Delivery,
    origin: ThreadId,
}

#[derive(Default)]
struct NotifierState {
    incoming: Vec<PendingCompletion>,
    shutting_down: bool,
    stopped: bool,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

struct NotifierShared {
    state: Mutex<NotifierState>,
    wake: Condvar,
    pool: Arc<FencePool>,
    event_loop: Option<EventLoopProxy>,
    poll_interval: Duration,
    registered: AtomicU64,
    delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    pub registered: u64,
    pub delivered: u64,
}

pub struct CompletionNotifier {
    shared: Arc<NotifierShared>,
    name: String,
}

impl CompletionNotifier {
    pub fn new(name: &str, pool: Arc<FencePool>, event_loop: Option<EventLoopProxy>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(NotifierShared {
                state: Mutex::new(NotifierState::default()),
                wake: Condvar::new(),
                pool,
                event_loop,
                poll_interval,
                registered: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
            name: name.to_owned(),
        }
    }

    #[inline]
    pub fn event_loop(&self) -> Option<&EventLoopProxy> {
        self.shared.event_loop.as_ref()
    }

    /// Register `operation` to run once `fence` signals. The fence goes back to the pool after.
    ///
    /// After shutdown the operation runs immediately on the calling thread with `Completed` if
    /// the fence already signaled, `Cancelled` otherwise.
    #[profiling::function]
    pub fn add_fence_completion_handler(&self, fence: Fence, operation: CompletionOperation, delivery: Delivery) -> RhiResult<()> {
        self.shared.registered.fetch_add(1, Ordering::Relaxed);
        let entry = PendingCompletion {
            fence,
            operation,
            delivery,
            origin: thread::current().id(),
        };

        let mut state = self.shared.state.lock();
        if state.shutting_down {
            drop(state);
            log::warn!("{}: completion registered after shutdown", self.name);
            let status = match entry.fence.is_signaled() {
                Ok(true) => CompletionStatus::Completed,
                _ => CompletionStatus::Cancelled,
            };
            self.shared.finish(entry, status);
            return Ok(());
        }

        state.incoming.push(entry);
        if state.thread.is_none() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || shared.run())
                .map_err(|err| RhiError::Fatal(format!("failed to spawn completion thread: {err}")))?;
            state.thread_id = Some(handle.thread().id());
            state.thread = Some(handle);
            log::debug!("{}: completion thread started", self.name);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Whether the calling thread is this notifier's completion thread.
    pub fn is_notifier_thread(&self) -> bool {
        self.shared.state.lock().thread_id == Some(thread::current().id())
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            registered: self.shared.registered.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread after draining every pending completion, then join it.
    ///
    /// Called from the completion thread itself (from inside an operation) it only requests
    /// the stop; the thread drains and exits once that operation returns.
    pub fn shutdown(&self) {
        let handle = {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            self.shared.wake.notify_all();
            if state.thread_id == Some(thread::current().id()) {
                None
            } else {
                state.thread.take()
            }
        };

        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    log::error!("{}: completion thread panicked", self.name);
                }
                log::debug!("{}: completion thread joined", self.name);
            }
            None => {
                // Thread never started, or we are on it; drain whatever is queued here.
                let incoming = {
                    let mut state = self.shared.state.lock();
                    if state.thread.is_some() || state.stopped {
                        return;
                    }
                    std::mem::take(&mut state.incoming)
                };
                self.shared.drain(incoming);
            }
        }
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NotifierShared {
    fn run(self: Arc<Self>) {
        let mut pending: Vec<PendingCompletion> = Vec::new();

        loop {
            {
                let mut state = self.state.lock();
                pending.append(&mut state.incoming);
                if state.shutting_down {
                    break;
                }
                if pending.is_empty() {
                    self.wake.wait(&mut state);
                    continue;
                }
            }

            if let Err(err) = self.poll(&mut pending) {
                log::error!("fence wait failed ({err}); failing {} pending completions", pending.len());
                for entry in pending.drain(..) {
                    self.finish(entry, CompletionStatus::Failed);
                }
            }
        }

        self.drain(pending);
        let mut state = self.state.lock();
        let late = std::mem::take(&mut state.incoming);
        state.stopped = true;
        drop(state);
        self.drain(late);
    }

    /// Wait up to one poll interval, then complete every entry whose fence signaled.
    fn poll(&self, pending: &mut Vec<PendingCompletion>) -> RhiResult<()> {
        profiling::scope!("notifier_poll");
        let any = {
            let fences: SmallVec<[&dyn NativeFence; 16]> = pending.iter().map(|p| p.fence.native()).collect();
            self.pool.provider().wait_any(&fences, self.poll_interval)?
        };
        if !any {
            return Ok(());
        }

        let mut index = 0;
        while index < pending.len() {
            if pending[index].fence.is_signaled()? {
                let entry = pending.swap_remove(index);
                self.finish(entry, CompletionStatus::Completed);
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    fn drain(&self, pending: Vec<PendingCompletion>) {
        if pending.is_empty() {
            return;
        }
        log::debug!("draining {} pending completions", pending.len());
        for entry in pending {
            let status = match entry.fence.is_signaled() {
                Ok(true) => CompletionStatus::Completed,
                _ => CompletionStatus::Cancelled,
            };
            self.finish(entry, status);
        }
    }

    fn finish(&self, entry: PendingCompletion, status: CompletionStatus) {
        let PendingCompletion { fence, operation, delivery, origin } = entry;
        log::trace!("fence #{} finished with {status:?} (registered on {origin:?})", fence.id());

        dispatch(self.event_loop.as_ref(), operation, delivery, status);
        self.delivered.fetch_add(1, Ordering::Relaxed);

        match status {
            CompletionStatus::Completed => self.pool.return_fence(fence),
            CompletionStatus::Cancelled | CompletionStatus::Failed => self.pool.retire_fence(fence),
        }
    }
}

/// Run `operation` on the requested side. Falls back to the current thread when there is no
/// event loop to post to.
pub(crate) fn dispatch(event_loop: Option<&EventLoopProxy>, operation: CompletionOperation, delivery: Delivery, status: CompletionStatus) {
    match (delivery, event_loop) {
        (Delivery::EventLoop, Some(proxy)) => {
            if let Err(task) = proxy.post(Box::new(move || operation(status))) {
                log::warn!("event loop is gone; running completion on the notifier thread");
                invoke(task);
            }
        }
        (Delivery::EventLoop, None) => {
            log::warn!("no event loop configured; running completion on the notifier thread");
            invoke(Box::new(move || operation(status)));
        }
        (Delivery::Direct, _) => invoke(Box::new(move || operation(status))),
    }
}

fn invoke(task: Box<dyn FnOnce() + Send>) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        log::error!("completion operation panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use crate::event_loop::EventLoop;
    use crate::synchronization::tests::ManualFenceProvider;

    fn notifier(provider: Arc<ManualFenceProvider>, event_loop: Option<EventLoopProxy>) -> (CompletionNotifier, Arc<FencePool>) {
        let pool = Arc::new(FencePool::new(provider));
        let notifier = CompletionNotifier::new("test-completion", pool.clone(), event_loop, Duration::from_millis(1));
        (notifier, pool)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn signaled_fence_fires_once_and_returns_to_pool() {
        let provider = Arc::new(ManualFenceProvider::default());
        let (notifier, pool) = notifier(provider.clone(), None);
        let hits = Arc::new(AtomicUsize::new(0));

        let fence = pool.get_fence().unwrap();
        let id = fence.id() as usize;
        let counter = hits.clone();
        notifier
            .add_fence_completion_handler(
                fence,
                Box::new(move |status| {
                    assert_eq!(status, CompletionStatus::Completed);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Delivery::Direct,
            )
            .unwrap();

        thread::sleep(Duration::from_millis(10));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "unsignaled fence must not fire");
        assert_eq!(pool.stats().in_flight, 1);

        provider.signal(id);
        assert!(wait_for(|| pool.stats().free == 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        notifier.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.stats(), NotifierStats { registered: 1, delivered: 1 });
    }

    #[test]
    fn shutdown_cancels_unsignaled_entries() {
        let provider = Arc::new(ManualFenceProvider::default());
        let (notifier, pool) = notifier(provider.clone(), None);
        let statuses = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let fence = pool.get_fence().unwrap();
            if i % 2 == 0 {
                provider.signal(fence.id() as usize);
            }
            let statuses = statuses.clone();
            notifier
                .add_fence_completion_handler(fence, Box::new(move |status| statuses.lock().push(status)), Delivery::Direct)
                .unwrap();
        }
        notifier.shutdown();

        let statuses = statuses.lock();
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses.iter().filter(|s| **s == CompletionStatus::Completed).count(), 2);
        assert_eq!(statuses.iter().filter(|s| **s == CompletionStatus::Cancelled).count(), 2);

        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.retired, 2);
    }

    #[test]
    fn registration_after_shutdown_runs_inline() {
        let provider = Arc::new(ManualFenceProvider::default());
        let (notifier, pool) = notifier(provider, None);
        notifier.shutdown();

        let status = Arc::new(Mutex::new(None));
        let slot = status.clone();
        notifier
            .add_fence_completion_handler(pool.get_fence().unwrap(), Box::new(move |s| *slot.lock() = Some(s)), Delivery::Direct)
            .unwrap();
        assert_eq!(*status.lock(), Some(CompletionStatus::Cancelled));
    }

    #[test]
    fn event_loop_delivery_runs_on_the_loop() {
        let provider = Arc::new(ManualFenceProvider::default());
        let event_loop = EventLoop::new();
        let (notifier, pool) = notifier(provider.clone(), Some(event_loop.proxy()));
        let ran_on = Arc::new(Mutex::new(None));

        let fence = pool.get_fence().unwrap();
        provider.signal(fence.id() as usize);
        let slot = ran_on.clone();
        notifier
            .add_fence_completion_handler(fence, Box::new(move |_| *slot.lock() = Some(thread::current().id())), Delivery::EventLoop)
            .unwrap();

        assert!(event_loop.run_until(Duration::from_secs(5), || ran_on.lock().is_some()));
        assert_eq!(*ran_on.lock(), Some(thread::current().id()));
    }

    #[test]
    fn panicking_operation_does_not_kill_the_thread() {
        let provider = Arc::new(ManualFenceProvider::default());
        let (notifier, pool) = notifier(provider.clone(), None);
        let hits = Arc::new(AtomicUsize::new(0));

        let first = pool.get_fence().unwrap();
        provider.signal(first.id() as usize);
        notifier
            .add_fence_completion_handler(first, Box::new(|_| panic!("boom")), Delivery::Direct)
            .unwrap();

        let second = pool.get_fence().unwrap();
        provider.signal(second.id() as usize);
        let counter = hits.clone();
        notifier
            .add_fence_completion_handler(second, Box::new(move |_| { counter.fetch_add(1, Ordering::SeqCst); }), Delivery::Direct)
            .unwrap();

        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    }
}
