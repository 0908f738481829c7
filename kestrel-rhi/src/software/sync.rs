//! Fences, events and semaphores of the software device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

use crate::backend::{downcast_native, FenceProvider, NativeEvent, NativeFence, NativeSemaphore};
use crate::error::RhiResult;

/// Wakes fence waiters whenever any fence of the device signals.
#[derive(Default)]
pub(crate) struct FenceHub {
    lock: Mutex<()>,
    changed: Condvar,
}

pub(crate) struct FenceSignal {
    signaled: AtomicBool,
    hub: Arc<FenceHub>,
}

impl FenceSignal {
    pub(crate) fn signal(&self) {
        let _guard = self.hub.lock.lock();
        let was_signaled = self.signaled.swap(true, Ordering::AcqRel);
        debug_assert!(!was_signaled, "fence signaled twice without a reset");
        self.hub.changed.notify_all();
    }
}

pub(crate) struct SoftwareFence {
    state: Arc<FenceSignal>,
}

impl SoftwareFence {
    /// Handle the queue timeline signals once the submission finished.
    #[inline]
    pub(crate) fn signal_handle(&self) -> Arc<FenceSignal> {
        self.state.clone()
    }
}

impl NativeFence for SoftwareFence {
    fn is_signaled(&self) -> RhiResult<bool> {
        Ok(self.state.signaled.load(Ordering::Acquire))
    }

    fn reset(&self) -> RhiResult<()> {
        self.state.signaled.store(false, Ordering::Release);
        Ok(())
    }
}

pub(crate) struct SoftwareFenceProvider {
    hub: Arc<FenceHub>,
}

impl SoftwareFenceProvider {
    pub(crate) fn new() -> Self {
        Self { hub: Arc::new(FenceHub::default()) }
    }
}

impl FenceProvider for SoftwareFenceProvider {
    fn create_fence(&self) -> RhiResult<Box<dyn NativeFence>> {
        Ok(Box::new(SoftwareFence {
            state: Arc::new(FenceSignal {
                signaled: AtomicBool::new(false),
                hub: self.hub.clone(),
            }),
        }))
    }

    fn wait_any(&self, fences: &[&dyn NativeFence], timeout: Duration) -> RhiResult<bool> {
        let fences = fences
            .iter()
            .map(|&fence| downcast_native::<SoftwareFence>(fence.as_any(), "fence"))
            .collect::<RhiResult<Vec<_>>>()?;
        let any_signaled = || fences.iter().any(|fence| fence.state.signaled.load(Ordering::Acquire));

        let deadline = Instant::now() + timeout;
        let mut guard = self.hub.lock.lock();
        loop {
            if any_signaled() {
                return Ok(true);
            }
            if self.hub.changed.wait_until(&mut guard, deadline).timed_out() {
                return Ok(any_signaled());
            }
        }
    }
}

/// Binary signal consumed by exactly one wait.
#[derive(Default)]
pub(crate) struct SoftwareEvent {
    signaled: Mutex<bool>,
    changed: Condvar,
}

impl SoftwareEvent {
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        if *signaled {
            log::warn!("software event signaled again before its wait consumed it");
        }
        *signaled = true;
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for the signal and consume it.
    pub(crate) fn wait_consume(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.changed.wait_for(&mut signaled, timeout);
        }
        std::mem::replace(&mut *signaled, false)
    }
}

impl NativeEvent for SoftwareEvent {}

/// Monotonic counter.
#[derive(Default)]
pub(crate) struct SoftwareSemaphore {
    value: Mutex<u64>,
    changed: Condvar,
}

impl SoftwareSemaphore {
    pub(crate) fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value <= *current {
            log::warn!("software semaphore signaled with {value}, already at {}", *current);
            return;
        }
        *current = value;
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for the counter to reach `value`.
    pub(crate) fn wait_for_value(&self, value: u64, timeout: Duration) -> bool {
        let mut current = self.value.lock();
        if *current < value {
            self.changed.wait_for(&mut current, timeout);
        }
        *current >= value
    }
}

impl NativeSemaphore for SoftwareSemaphore {
    fn completed_value(&self) -> RhiResult<u64> {
        Ok(*self.value.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_any_wakes_on_signal() {
        let provider = SoftwareFenceProvider::new();
        let a = provider.create_fence().unwrap();
        let b = provider.create_fence().unwrap();
        assert!(!provider.wait_any(&[a.as_ref(), b.as_ref()], Duration::from_millis(5)).unwrap());

        let signal = downcast_native::<SoftwareFence>(b.as_ref().as_any(), "fence").unwrap().signal_handle();
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.signal();
        });
        assert!(provider.wait_any(&[a.as_ref(), b.as_ref()], Duration::from_secs(5)).unwrap());
        signaler.join().unwrap();

        assert!(b.is_signaled().unwrap());
        b.reset().unwrap();
        assert!(!b.is_signaled().unwrap());
    }

    #[test]
    fn events_are_consumed_by_one_wait() {
        let event = SoftwareEvent::default();
        assert!(!event.wait_consume(Duration::from_millis(1)));
        event.signal();
        assert!(event.wait_consume(Duration::from_millis(1)));
        assert!(!event.wait_consume(Duration::from_millis(1)));
    }

    #[test]
    fn semaphore_counts_up() {
        let semaphore = SoftwareSemaphore::default();
        semaphore.signal(3);
        semaphore.signal(2);
        assert_eq!(semaphore.completed_value().unwrap(), 3);
        assert!(semaphore.wait_for_value(3, Duration::ZERO));
        assert!(!semaphore.wait_for_value(4, Duration::from_millis(1)));
    }
}
