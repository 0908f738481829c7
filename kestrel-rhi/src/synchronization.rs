//! Fences, the fence pool, and cross-queue events and semaphores.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use kestrel_core::collections::hashset::HashSet;

use crate::backend::{FenceProvider, NativeEvent, NativeFence, NativeSemaphore};
use crate::error::RhiResult;
use crate::tracker::TrackedAllocation;

/// Binary GPU-to-CPU completion signal, owned by exactly one party at a time.
///
/// A fence is either in the pool's free list, held by a command buffer being committed, or
/// held by the completion notifier while its submission is in flight.
pub struct Fence {
    id: u64,
    native: Box<dyn NativeFence>,
}

impl Fence {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeFence {
        self.native.as_ref()
    }

    #[inline]
    pub fn is_signaled(&self) -> RhiResult<bool> {
        self.native.is_signaled()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fence").field(&self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FencePoolStats {
    /// Fences ever created by the pool.
    pub created: usize,
    /// Fences in the free list.
    pub free: usize,
    /// Fences handed out and not yet returned.
    pub in_flight: usize,
    /// Fences that could not be proven idle and are parked until the pool drops.
    pub retired: usize,
}

#[derive(Default)]
struct PoolState {
    free: Vec<Fence>,
    in_flight: HashSet<u64>,
    retired: Vec<Fence>,
}

/// Free list of fences. Fences are only destroyed when the pool itself drops.
pub struct FencePool {
    provider: Arc<dyn FenceProvider>,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl FencePool {
    pub fn new(provider: Arc<dyn FenceProvider>) -> Self {
        Self {
            provider,
            next_id: AtomicU64::new(0),
            state: Mutex::new(PoolState::default()),
        }
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn FenceProvider> {
        &self.provider
    }

    /// Pop an unsignaled fence from the free list, or create one.
    #[profiling::function]
    pub fn get_fence(&self) -> RhiResult<Fence> {
        let mut state = self.state.lock();
        let fence = match state.free.pop() {
            Some(fence) => fence,
            None => {
                let native = self.provider.create_fence()?;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                log::trace!("fence pool: created fence #{id}");
                Fence { id, native }
            }
        };
        let fresh = state.in_flight.insert(fence.id);
        debug_assert!(fresh, "fence #{} handed out twice", fence.id);
        Ok(fence)
    }

    /// Return a fence whose wait has been observed. The fence is reset before it is reused.
    pub fn return_fence(&self, fence: Fence) {
        let reset = fence.native.reset();
        let mut state = self.state.lock();
        let known = state.in_flight.remove(&fence.id);
        debug_assert!(known, "fence #{} returned twice", fence.id);

        match reset {
            Ok(()) => state.free.push(fence),
            Err(err) => {
                log::warn!("fence #{} failed to reset ({err}); retiring it", fence.id);
                state.retired.push(fence);
            }
        }
    }

    /// Park a fence whose signal was never observed; it is not reused.
    pub fn retire_fence(&self, fence: Fence) {
        let mut state = self.state.lock();
        let known = state.in_flight.remove(&fence.id);
        debug_assert!(known, "fence #{} retired twice", fence.id);
        state.retired.push(fence);
    }

    pub fn stats(&self) -> FencePoolStats {
        let state = self.state.lock();
        FencePoolStats {
            created: self.next_id.load(Ordering::Relaxed) as usize,
            free: state.free.len(),
            in_flight: state.in_flight.len(),
            retired: state.retired.len(),
        }
    }
}

/// One wait or signal operation attached to a submission.
#[derive(Clone, Debug)]
pub enum SyncPoint {
    Event(Event),
    Semaphore { semaphore: Semaphore, value: u64 },
}

struct EventInner {
    label: String,
    native: Arc<dyn NativeEvent>,
    _tracking: TrackedAllocation,
}

/// Binary GPU-side signal between submissions, possibly on different queues.
///
/// Each signal must be consumed by exactly one wait.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(label: &str, native: Arc<dyn NativeEvent>, tracking: TrackedAllocation) -> Self {
        Self {
            inner: Arc::new(EventInner {
                label: label.to_owned(),
                native,
                _tracking: tracking,
            }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeEvent {
        self.inner.native.as_ref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Event").field(&self.label()).finish()
    }
}

struct SemaphoreInner {
    label: String,
    native: Arc<dyn NativeSemaphore>,
    _tracking: TrackedAllocation,
}

/// Monotonic GPU-side counter between submissions.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub(crate) fn new(label: &str, native: Arc<dyn NativeSemaphore>, tracking: TrackedAllocation) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                label: label.to_owned(),
                native,
                _tracking: tracking,
            }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeSemaphore {
        self.inner.native.as_ref()
    }

    /// Highest value the GPU has signaled so far.
    pub fn completed_value(&self) -> RhiResult<u64> {
        self.inner.native.completed_value()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.label()).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};
    use crate::backend::FenceProvider;

    /// Fence the test flips by hand.
    pub(crate) struct ManualFence {
        pub(crate) signaled: Arc<AtomicBool>,
    }

    impl NativeFence for ManualFence {
        fn is_signaled(&self) -> RhiResult<bool> {
            Ok(self.signaled.load(Ordering::Acquire))
        }

        fn reset(&self) -> RhiResult<()> {
            self.signaled.store(false, Ordering::Release);
            Ok(())
        }
    }

    /// Provider whose fences are signaled through the returned flags.
    #[derive(Default)]
    pub(crate) struct ManualFenceProvider {
        pub(crate) flags: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl ManualFenceProvider {
        pub(crate) fn signal(&self, id: usize) {
            self.flags.lock()[id].store(true, Ordering::Release);
        }
    }

    impl FenceProvider for ManualFenceProvider {
        fn create_fence(&self) -> RhiResult<Box<dyn NativeFence>> {
            let flag = Arc::new(AtomicBool::new(false));
            self.flags.lock().push(flag.clone());
            Ok(Box::new(ManualFence { signaled: flag }))
        }

        fn wait_any(&self, fences: &[&dyn NativeFence], timeout: Duration) -> RhiResult<bool> {
            let deadline = Instant::now() + timeout;
            loop {
                for fence in fences {
                    if fence.is_signaled()? {
                        return Ok(true);
                    }
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }

    #[test]
    fn pool_reuses_returned_fences() {
        let provider = Arc::new(ManualFenceProvider::default());
        let pool = FencePool::new(provider.clone());

        let a = pool.get_fence().unwrap();
        let b = pool.get_fence().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats(), FencePoolStats { created: 2, free: 0, in_flight: 2, retired: 0 });

        provider.signal(a.id() as usize);
        assert!(a.is_signaled().unwrap());
        let a_id = a.id();
        pool.return_fence(a);

        let again = pool.get_fence().unwrap();
        assert_eq!(again.id(), a_id);
        assert!(!again.is_signaled().unwrap(), "returned fences come back reset");

        pool.retire_fence(b);
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.retired, 1);
        assert_eq!(stats.in_flight, 1);
    }
}
