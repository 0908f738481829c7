//! Command buffers and per-thread command pools.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

use crate::backend::{NativeCommandBuffer, NativeCommandPool};
use crate::device::DeviceContext;
use crate::encoder::{BlitCommandEncoder, ComputeCommandEncoder, EncodedPass, RenderCommandEncoder, RenderPassDescriptor};
use crate::error::{RhiError, RhiResult};
use crate::event_loop::EventLoopProxy;
use crate::notifier::{dispatch, CompletionOperation, CompletionStatus, Delivery};
use crate::queue::CommandQueue;
use crate::synchronization::SyncPoint;
use crate::tracker::ResourceTracker;

/// Source of reusable native command buffers for one queue on one thread.
///
/// Grows on demand and never shrinks; buffers come back once their execution completed.
pub(crate) struct CommandPool {
    native: Box<dyn NativeCommandPool>,
    owner: ThreadId,
    free: Vec<Box<dyn NativeCommandBuffer>>,
    /// Buffers whose execution was never observed to finish; kept until the pool drops.
    retired: Vec<Box<dyn NativeCommandBuffer>>,
}

impl CommandPool {
    pub(crate) fn new(native: Box<dyn NativeCommandPool>) -> Self {
        Self {
            native,
            owner: thread::current().id(),
            free: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> RhiResult<Box<dyn NativeCommandBuffer>> {
        debug_assert_eq!(self.owner, thread::current().id(), "command pool used off its owning thread");
        match self.free.pop() {
            Some(buffer) => Ok(buffer),
            None => self.native.allocate(),
        }
    }

    pub(crate) fn recycle(&mut self, buffer: Box<dyn NativeCommandBuffer>) {
        self.free.push(buffer);
    }

    pub(crate) fn retire(&mut self, buffer: Box<dyn NativeCommandBuffer>) {
        self.retired.push(buffer);
    }

    #[inline]
    pub(crate) fn allocated_count(&self) -> usize {
        self.native.allocated_count()
    }

    #[inline]
    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Whether a buffer of this pool may still be executing.
    #[inline]
    pub(crate) fn has_retired(&self) -> bool {
        !self.retired.is_empty()
    }
}

/// Lifecycle of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferStatus {
    Recording,
    Committed,
    Completed,
    /// Dropped before commit, or the device shut down before completion was observed.
    Cancelled,
    /// Submission rejected, or the device was lost.
    Failed,
}

impl CommandBufferStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandBufferStatus::Completed | CommandBufferStatus::Cancelled | CommandBufferStatus::Failed)
    }
}

impl From<CompletionStatus> for CommandBufferStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => CommandBufferStatus::Completed,
            CompletionStatus::Cancelled => CommandBufferStatus::Cancelled,
            CompletionStatus::Failed => CommandBufferStatus::Failed,
        }
    }
}

struct CompletionShared {
    status: Mutex<CommandBufferStatus>,
    changed: Condvar,
}

impl CompletionShared {
    fn set(&self, status: CommandBufferStatus) {
        *self.status.lock() = status;
        self.changed.notify_all();
    }
}

/// Thread-safe view of a command buffer's completion, usable after the buffer itself is gone.
#[derive(Clone)]
pub struct CommandBufferCompletion {
    shared: Arc<CompletionShared>,
    device: Arc<DeviceContext>,
}

impl CommandBufferCompletion {
    pub fn status(&self) -> CommandBufferStatus {
        *self.shared.status.lock()
    }

    /// Block until the buffer reaches a terminal status.
    ///
    /// Never call this from a completion operation running on the notifier thread.
    pub fn wait(&self) -> RhiResult<CommandBufferStatus> {
        self.wait_deadline(None).map(|status| status.unwrap_or(CommandBufferStatus::Committed))
    }

    /// Like `wait`, giving up after `timeout`. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> RhiResult<Option<CommandBufferStatus>> {
        self.wait_deadline(Some(Instant::now() + timeout))
    }

    fn wait_deadline(&self, deadline: Option<Instant>) -> RhiResult<Option<CommandBufferStatus>> {
        if self.device.notifier.is_notifier_thread() {
            return Err(RhiError::WouldDeadlock("waiting for command buffer completion on the notifier thread"));
        }

        let mut status = self.shared.status.lock();
        if *status == CommandBufferStatus::Recording {
            return Err(RhiError::invalid_state("command buffer was never committed"));
        }
        while !status.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                        return Ok(status.is_terminal().then_some(*status));
                    }
                }
                None => self.shared.changed.wait(&mut status),
            }
        }
        Ok(Some(*status))
    }
}

/// Work in flight on the GPU, finished by the notifier.
struct InFlight {
    natives: Vec<Box<dyn NativeCommandBuffer>>,
    /// Held only to keep referenced resources alive.
    passes: Vec<EncodedPass>,
    sync_points: Vec<SyncPoint>,
    pool: Arc<Mutex<CommandPool>>,
    handlers: Vec<(CompletionOperation, Delivery)>,
    event_loop: Option<EventLoopProxy>,
    shared: Arc<CompletionShared>,
}

impl InFlight {
    fn finish(self, status: CompletionStatus) {
        let InFlight { natives, passes, sync_points, pool, handlers, event_loop, shared } = self;
        {
            let mut guard = pool.lock();
            for native in natives {
                match status {
                    CompletionStatus::Completed => guard.recycle(native),
                    CompletionStatus::Cancelled | CompletionStatus::Failed => guard.retire(native),
                }
            }
        }
        // Released before waiters wake so an idle pool can be pruned.
        drop(pool);
        drop(passes);
        drop(sync_points);

        for (operation, delivery) in handlers {
            dispatch(event_loop.as_ref(), operation, delivery, status);
        }
        shared.set(status.into());
    }
}

/// A list of encoded passes submitted to a queue as one unit.
///
/// Bound to the thread that created it until committed: its native buffers come from that
/// thread's command pool.
pub struct CommandBuffer {
    queue: CommandQueue,
    pool: Arc<Mutex<CommandPool>>,
    label: String,
    shared: Arc<CompletionShared>,
    pub(crate) waits: Vec<SyncPoint>,
    pub(crate) signals: Vec<SyncPoint>,
    finished: Vec<Box<dyn NativeCommandBuffer>>,
    passes: Vec<EncodedPass>,
    handlers: Vec<(CompletionOperation, Delivery)>,
    next_encoder: u32,
    _thread_bound: PhantomData<*const ()>,
}

impl CommandBuffer {
    pub(crate) fn new(queue: CommandQueue, pool: Arc<Mutex<CommandPool>>, label: String) -> Self {
        Self {
            queue,
            pool,
            label,
            shared: Arc::new(CompletionShared {
                status: Mutex::new(CommandBufferStatus::Recording),
                changed: Condvar::new(),
            }),
            waits: Vec::new(),
            signals: Vec::new(),
            finished: Vec::new(),
            passes: Vec::new(),
            handlers: Vec::new(),
            next_encoder: 0,
            _thread_bound: PhantomData,
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    #[inline]
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn status(&self) -> CommandBufferStatus {
        *self.shared.status.lock()
    }

    /// Encoders ended so far and waiting for commit.
    #[inline]
    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn completion(&self) -> CommandBufferCompletion {
        CommandBufferCompletion {
            shared: self.shared.clone(),
            device: self.queue.device().clone(),
        }
    }

    #[inline]
    pub(crate) fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.queue.device().tracker
    }

    fn ensure_recording(&self, operation: &str) -> RhiResult<()> {
        match self.status() {
            CommandBufferStatus::Recording => Ok(()),
            status => Err(RhiError::invalid_state(format!(
                "{operation} on command buffer '{}' in state {status:?}",
                self.label
            ))),
        }
    }

    fn next_native(&mut self, operation: &str) -> RhiResult<(Box<dyn NativeCommandBuffer>, u32)> {
        self.ensure_recording(operation)?;
        self.queue.device().ensure_ready()?;
        let native = self.pool.lock().allocate()?;
        let index = self.next_encoder;
        self.next_encoder += 1;
        Ok((native, index))
    }

    #[profiling::function]
    pub fn create_render_command_encoder(&mut self, descriptor: &RenderPassDescriptor) -> RhiResult<RenderCommandEncoder<'_>> {
        if !self.queue.supports_graphics() {
            return Err(RhiError::DeviceCapability(format!("queue '{}' cannot execute render passes", self.queue.label())));
        }
        descriptor.validate(self.queue.device().backend.limits(), self.tracker())?;
        let (native, index) = self.next_native("create_render_command_encoder")?;
        Ok(RenderCommandEncoder::new(self, native, index, descriptor.clone()))
    }

    pub fn create_compute_command_encoder(&mut self) -> RhiResult<ComputeCommandEncoder<'_>> {
        if !self.queue.supports_compute() {
            return Err(RhiError::DeviceCapability(format!("queue '{}' cannot execute compute passes", self.queue.label())));
        }
        let (native, index) = self.next_native("create_compute_command_encoder")?;
        Ok(ComputeCommandEncoder::new(self, native, index, format!("compute pass {index}")))
    }

    pub fn create_blit_command_encoder(&mut self) -> RhiResult<BlitCommandEncoder<'_>> {
        let (native, index) = self.next_native("create_blit_command_encoder")?;
        Ok(BlitCommandEncoder::new(self, native, index, format!("blit pass {index}")))
    }

    pub(crate) fn finish_pass(&mut self, native: Box<dyn NativeCommandBuffer>, pass: EncodedPass) {
        self.finished.push(native);
        self.passes.push(pass);
    }

    pub(crate) fn recycle_native(&mut self, native: Box<dyn NativeCommandBuffer>) {
        self.pool.lock().recycle(native);
    }

    /// Run `handler` on the notifier thread once this buffer reaches its terminal status.
    pub fn add_completed_handler(&mut self, handler: impl FnOnce(CompletionStatus) + Send + 'static) -> RhiResult<()> {
        self.ensure_recording("add_completed_handler")?;
        self.handlers.push((Box::new(handler), Delivery::Direct));
        Ok(())
    }

    /// Run `handler` on the application event loop once this buffer reaches its terminal status.
    pub fn add_completed_handler_on_event_loop(&mut self, handler: impl FnOnce(CompletionStatus) + Send + 'static) -> RhiResult<()> {
        self.ensure_recording("add_completed_handler_on_event_loop")?;
        self.handlers.push((Box::new(handler), Delivery::EventLoop));
        Ok(())
    }

    /// Submit every finished pass, in encoder creation order.
    ///
    /// Returns `Ok(false)` without changing state when no encoder has finished. A rejected
    /// submission is reported once and not retried: the buffer becomes `Failed`, its handlers
    /// run with `CompletionStatus::Failed`, and the device is marked degraded.
    #[profiling::function]
    pub fn commit(&mut self) -> RhiResult<bool> {
        self.ensure_recording("commit")?;
        if self.finished.is_empty() {
            log::trace!("commit of '{}' with no finished encoders is a no-op", self.label);
            return Ok(false);
        }
        let device = self.queue.device().clone();
        device.ensure_ready()?;

        let fence = device.fence_pool.get_fence()?;
        let natives = std::mem::take(&mut self.finished);
        let waits = std::mem::take(&mut self.waits);
        let signals = std::mem::take(&mut self.signals);

        if let Err(err) = self.queue.submit(&natives, &waits, &signals, fence.native()) {
            device.fence_pool.return_fence(fence);
            device.mark_degraded(&err);
            {
                let mut pool = self.pool.lock();
                for native in natives {
                    pool.recycle(native);
                }
            }
            self.passes.clear();
            for (operation, delivery) in self.handlers.drain(..) {
                dispatch(device.notifier.event_loop(), operation, delivery, CompletionStatus::Failed);
            }
            self.shared.set(CommandBufferStatus::Failed);
            return Err(err);
        }

        self.shared.set(CommandBufferStatus::Committed);
        let in_flight = InFlight {
            natives,
            passes: std::mem::take(&mut self.passes),
            sync_points: waits.into_iter().chain(signals).collect(),
            pool: self.pool.clone(),
            handlers: std::mem::take(&mut self.handlers),
            event_loop: device.notifier.event_loop().cloned(),
            shared: self.shared.clone(),
        };
        device
            .notifier
            .add_fence_completion_handler(fence, Box::new(move |status| in_flight.finish(status)), Delivery::Direct)?;
        Ok(true)
    }

    /// Block until the committed buffer completed, failed or was cancelled.
    pub fn wait_until_completed(&self) -> RhiResult<CommandBufferStatus> {
        self.completion().wait()
    }

    pub fn wait_until_completed_timeout(&self, timeout: Duration) -> RhiResult<Option<CommandBufferStatus>> {
        self.completion().wait_timeout(timeout)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.status() != CommandBufferStatus::Recording {
            return;
        }
        if !self.finished.is_empty() {
            log::warn!("command buffer '{}' dropped with {} uncommitted passes", self.label, self.finished.len());
        }
        {
            let mut pool = self.pool.lock();
            for native in self.finished.drain(..) {
                pool.recycle(native);
            }
        }
        let event_loop = self.queue.device().notifier.event_loop().cloned();
        for (operation, delivery) in self.handlers.drain(..) {
            dispatch(event_loop.as_ref(), operation, delivery, CompletionStatus::Cancelled);
        }
        self.shared.set(CommandBufferStatus::Cancelled);
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label)
            .field("status", &self.status())
            .field("finished", &self.finished.len())
            .finish()
    }
}
