//! Command queues.

use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use parking_lot::Mutex;
use kestrel_core::collections::hashmap::HashMap;

use crate::backend::{NativeCommandBuffer, NativeFence, QueueBackend, QueueCapability, QueueFamilyInfo, QueueFlags, Submission};
use crate::command::{CommandBuffer, CommandPool};
use crate::device::DeviceContext;
use crate::error::RhiResult;
use crate::synchronization::SyncPoint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandQueueStats {
    /// Successful native submissions.
    pub submissions: u64,
    /// Threads that created command buffers on this queue.
    pub thread_pools: usize,
    /// Native command buffers allocated across every thread pool.
    pub native_command_buffers: usize,
    /// Native command buffers idle in the free lists.
    pub free_command_buffers: usize,
}

thread_local! {
    /// Dropped when the thread exits; pools hold a weak reference to tell whether their owner lives.
    static THREAD_ALIVE: Arc<()> = Arc::new(());
}

struct ThreadPool {
    pool: Arc<Mutex<CommandPool>>,
    owner_alive: Weak<()>,
}

impl ThreadPool {
    /// The owning thread exited and no command buffer or in-flight submission holds the pool.
    fn is_abandoned(&self) -> bool {
        self.owner_alive.strong_count() == 0 && Arc::strong_count(&self.pool) == 1 && !self.pool.lock().has_retired()
    }
}

struct QueueInner {
    device: Arc<DeviceContext>,
    native: Arc<dyn QueueBackend>,
    label: String,
    submit_lock: Mutex<()>,
    /// One pool per thread that created command buffers. Pools of exited threads are pruned
    /// when another thread creates its pool, once nothing refers to them any more.
    pools: Mutex<HashMap<thread::ThreadId, ThreadPool>>,
    submissions: AtomicU64,
    next_buffer: AtomicU64,
}

/// An execution context of one queue family. Clones share the queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub(crate) fn new(device: Arc<DeviceContext>, native: Arc<dyn QueueBackend>, label: String) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                device,
                native,
                label,
                submit_lock: Mutex::new(()),
                pools: Mutex::new(HashMap::default()),
                submissions: AtomicU64::new(0),
                next_buffer: AtomicU64::new(0),
            }),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[inline]
    pub fn family(&self) -> &QueueFamilyInfo {
        self.inner.native.family()
    }

    #[inline]
    pub fn capabilities(&self) -> QueueFlags {
        self.family().flags
    }

    #[inline]
    pub(crate) fn supports_graphics(&self) -> bool {
        self.capabilities().contains(QueueCapability::Graphics)
    }

    #[inline]
    pub(crate) fn supports_compute(&self) -> bool {
        self.capabilities().contains(QueueCapability::Compute)
    }

    #[inline]
    pub(crate) fn device(&self) -> &Arc<DeviceContext> {
        &self.inner.device
    }

    /// Command pool of the calling thread, created on first use.
    fn thread_pool(&self) -> RhiResult<Arc<Mutex<CommandPool>>> {
        let id = thread::current().id();
        let mut pools = self.inner.pools.lock();
        if let Some(entry) = pools.get(&id) {
            return Ok(entry.pool.clone());
        }

        let before = pools.len();
        pools.retain(|_, entry| !entry.is_abandoned());
        if pools.len() < before {
            log::debug!("queue '{}': pruned {} command pools of exited threads", self.inner.label, before - pools.len());
        }

        let pool = Arc::new(Mutex::new(CommandPool::new(self.inner.native.create_command_pool()?)));
        log::debug!("queue '{}': command pool created for {:?}", self.inner.label, id);
        pools.insert(id, ThreadPool {
            pool: pool.clone(),
            owner_alive: THREAD_ALIVE.with(Arc::downgrade),
        });
        Ok(pool)
    }

    /// New command buffer drawing from the calling thread's pool.
    pub fn create_command_buffer(&self) -> RhiResult<CommandBuffer> {
        self.inner.device.ensure_ready()?;
        let pool = self.thread_pool()?;
        let index = self.inner.next_buffer.fetch_add(1, Ordering::Relaxed);
        Ok(CommandBuffer::new(self.clone(), pool, format!("{} #{index}", self.inner.label)))
    }

    /// Hand a committed buffer's passes to the native queue under the queue's submit lock.
    pub(crate) fn submit(&self, command_buffers: &[Box<dyn NativeCommandBuffer>], waits: &[SyncPoint], signals: &[SyncPoint], fence: &dyn NativeFence) -> RhiResult<()> {
        profiling::scope!("queue_submit");
        let _guard = self.inner.submit_lock.lock();
        self.inner.native.submit(Submission {
            command_buffers,
            waits,
            signals,
            fence,
        })?;
        self.inner.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block until every submission on this queue finished executing.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.inner.native.wait_idle()
    }

    pub fn stats(&self) -> CommandQueueStats {
        let pools = self.inner.pools.lock();
        let (native_command_buffers, free_command_buffers) = pools.values().fold((0, 0), |(allocated, free), entry| {
            let pool = entry.pool.lock();
            (allocated + pool.allocated_count(), free + pool.free_count())
        });
        CommandQueueStats {
            submissions: self.inner.submissions.load(Ordering::Relaxed),
            thread_pools: pools.len(),
            native_command_buffers,
            free_command_buffers,
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("label", &self.label())
            .field("family", &self.family().index)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
