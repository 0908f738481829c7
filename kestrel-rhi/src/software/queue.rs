//! Software queues: one worker thread per hardware queue executes submissions in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::backend::{
    downcast_native, NativeCommandBuffer, NativeCommandPool, QueueBackend, QueueFamilyInfo, Submission,
};
use crate::buffer::Buffer;
use crate::encoder::{BlitCommand, ComputeCommand, EncodedPass, LoadAction, PassCommands, RenderCommand};
use crate::error::{RhiError, RhiResult};
use crate::synchronization::SyncPoint;
use crate::texture::{Texture, TextureRegion};

use super::resource::{encode_clear_color, encode_clear_depth, SoftwareBuffer, SoftwareTexture};
use super::sync::{FenceSignal, SoftwareEvent, SoftwareFence, SoftwareSemaphore};
use super::{ExecutedPass, SoftwareShared};

/// Granularity at which blocked workers notice that their queue is closing.
const CLOSE_POLL: Duration = Duration::from_millis(10);

pub(crate) struct SoftwareCommandPool {
    allocated: usize,
}

impl SoftwareCommandPool {
    pub(crate) fn new() -> Self {
        Self { allocated: 0 }
    }
}

impl NativeCommandPool for SoftwareCommandPool {
    fn allocate(&mut self) -> RhiResult<Box<dyn NativeCommandBuffer>> {
        self.allocated += 1;
        Ok(Box::new(SoftwareCommandBuffer { pass: None }))
    }

    fn allocated_count(&self) -> usize {
        self.allocated
    }
}

pub(crate) struct SoftwareCommandBuffer {
    pass: Option<EncodedPass>,
}

impl NativeCommandBuffer for SoftwareCommandBuffer {
    fn encode(&mut self, pass: &EncodedPass) -> RhiResult<()> {
        self.pass = Some(pass.clone());
        Ok(())
    }
}

struct Job {
    submission: u64,
    passes: Vec<EncodedPass>,
    waits: Vec<SyncPoint>,
    signals: Vec<SyncPoint>,
    fence: Arc<FenceSignal>,
}

/// Submissions handed to the worker and not yet finished.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

pub(crate) struct SoftwareQueue {
    family: QueueFamilyInfo,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<Pending>,
    closing: Arc<AtomicBool>,
    shared: Arc<SoftwareShared>,
}

impl SoftwareQueue {
    pub(crate) fn new(family: QueueFamilyInfo, index: u32, shared: Arc<SoftwareShared>) -> RhiResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(Pending::default());
        let closing = Arc::new(AtomicBool::new(false));

        let timeline = Timeline {
            family: family.index,
            index,
            shared: shared.clone(),
            pending: pending.clone(),
            closing: closing.clone(),
        };
        let worker = thread::Builder::new()
            .name(format!("kestrel-software-queue-{}.{index}", family.index))
            .spawn(move || timeline.run(receiver))?;

        Ok(Self {
            family,
            sender: Some(sender),
            worker: Some(worker),
            pending,
            closing,
            shared,
        })
    }
}

impl QueueBackend for SoftwareQueue {
    fn family(&self) -> &QueueFamilyInfo {
        &self.family
    }

    fn create_command_pool(&self) -> RhiResult<Box<dyn NativeCommandPool>> {
        Ok(Box::new(SoftwareCommandPool::new()))
    }

    fn submit(&self, submission: Submission<'_>) -> RhiResult<()> {
        if self.shared.take_injected_failure() {
            return Err(RhiError::Submission("injected submission failure".to_owned()));
        }
        let passes = submission
            .command_buffers
            .iter()
            .map(|cb| {
                let cb = downcast_native::<SoftwareCommandBuffer>((**cb).as_any(), "command buffer")?;
                cb.pass.clone().ok_or_else(|| RhiError::invalid_state("command buffer submitted before it was encoded"))
            })
            .collect::<RhiResult<Vec<_>>>()?;
        let fence = downcast_native::<SoftwareFence>(submission.fence.as_any(), "fence")?.signal_handle();
        let sender = self.sender.as_ref().ok_or(RhiError::ShuttingDown)?;

        let job = Job {
            submission: self.shared.next_submission(),
            passes,
            waits: submission.waits.to_vec(),
            signals: submission.signals.to_vec(),
            fence,
        };
        self.pending.begin();
        if sender.send(job).is_err() {
            self.pending.finish();
            return Err(RhiError::DeviceLost);
        }
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.pending.wait_idle();
        Ok(())
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("software queue {} worker panicked", self.family.index);
            }
        }
    }
}

/// State owned by one queue's worker thread.
struct Timeline {
    family: u32,
    index: u32,
    shared: Arc<SoftwareShared>,
    pending: Arc<Pending>,
    closing: Arc<AtomicBool>,
}

impl Timeline {
    fn run(self, receiver: Receiver<Job>) {
        log::trace!("software queue {}.{} started", self.family, self.index);
        // Buffered jobs still run after the sender is gone.
        while let Ok(job) = receiver.recv() {
            self.execute(job);
            self.pending.finish();
        }
        log::trace!("software queue {}.{} stopped", self.family, self.index);
    }

    #[inline]
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn execute(&self, job: Job) {
        profiling::scope!("software_submission");
        self.shared.wait_while_stalled(&self.closing);

        let latency = self.shared.execution_latency();
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        for wait in &job.waits {
            if let Err(err) = self.wait(wait) {
                log::error!("software queue {}.{}: {err}", self.family, self.index);
            }
        }

        for pass in &job.passes {
            match self.execute_pass(pass) {
                Ok(mut executed) => {
                    executed.submission = job.submission;
                    self.shared.record(executed);
                }
                Err(err) => log::error!("software pass '{}' failed: {err}", pass.label),
            }
        }

        for signal in &job.signals {
            if let Err(err) = signal_point(signal) {
                log::error!("software queue {}.{}: {err}", self.family, self.index);
            }
        }
        job.fence.signal();
    }

    fn wait(&self, point: &SyncPoint) -> RhiResult<()> {
        let ready = || -> RhiResult<bool> {
            Ok(match point {
                SyncPoint::Event(event) => {
                    downcast_native::<SoftwareEvent>(event.native().as_any(), "event")?.wait_consume(CLOSE_POLL)
                }
                SyncPoint::Semaphore { semaphore, value } => {
                    downcast_native::<SoftwareSemaphore>(semaphore.native().as_any(), "semaphore")?
                        .wait_for_value(*value, CLOSE_POLL)
                }
            })
        };
        while !ready()? {
            if self.is_closing() {
                log::warn!("software queue {}.{} closing with an unsatisfied wait on {point:?}", self.family, self.index);
                break;
            }
        }
        Ok(())
    }

    fn execute_pass(&self, pass: &EncodedPass) -> RhiResult<ExecutedPass> {
        let mut executed = ExecutedPass {
            queue_family: self.family,
            queue_index: self.index,
            submission: 0,
            pass_index: pass.index,
            label: pass.label.clone(),
            kind: pass.commands.kind(),
            draws: 0,
            dispatches: 0,
            blits: 0,
        };

        match &pass.commands {
            PassCommands::Render { descriptor, commands } => {
                for color in &descriptor.color_attachments {
                    if color.load_action == LoadAction::Clear {
                        let texel = encode_clear_color(color.texture.format(), color.clear_color);
                        software_texture(&color.texture)?.fill(color.mip_level, color.array_layer, &texel);
                    }
                }
                if let Some(depth) = &descriptor.depth_attachment {
                    if depth.load_action == LoadAction::Clear {
                        let texel = encode_clear_depth(depth.texture.format(), depth.clear_depth, depth.clear_stencil);
                        software_texture(&depth.texture)?.fill(0, 0, &texel);
                    }
                }
                executed.draws = commands
                    .iter()
                    .filter(|command| matches!(command, RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. }))
                    .count() as u32;
            }
            PassCommands::Compute(commands) => {
                executed.dispatches = commands
                    .iter()
                    .filter(|command| matches!(command, ComputeCommand::Dispatch { .. }))
                    .count() as u32;
            }
            PassCommands::Blit(commands) => {
                for command in commands {
                    execute_blit(command)?;
                }
                executed.blits = commands.len() as u32;
            }
        }
        Ok(executed)
    }
}

fn signal_point(point: &SyncPoint) -> RhiResult<()> {
    match point {
        SyncPoint::Event(event) => downcast_native::<SoftwareEvent>(event.native().as_any(), "event")?.signal(),
        SyncPoint::Semaphore { semaphore, value } => {
            downcast_native::<SoftwareSemaphore>(semaphore.native().as_any(), "semaphore")?.signal(*value)
        }
    }
    Ok(())
}

#[inline]
fn software_texture(texture: &Texture) -> RhiResult<&SoftwareTexture> {
    downcast_native::<SoftwareTexture>(texture.native().as_any(), "texture")
}

#[inline]
fn software_buffer(buffer: &Buffer) -> RhiResult<&SoftwareBuffer> {
    downcast_native::<SoftwareBuffer>(buffer.native().as_any(), "buffer")
}

/// Bytes a pitched copy of `region` touches on the buffer side.
fn buffer_footprint(texture: &Texture, region: &TextureRegion, bytes_per_row: u32) -> (usize, usize) {
    let row_len = region.extent[0] as usize * texture.format().bytes_per_pixel() as usize;
    let rows = (region.extent[1] * region.extent[2]) as usize;
    (row_len, bytes_per_row as usize * rows.saturating_sub(1) + row_len)
}

fn execute_blit(command: &BlitCommand) -> RhiResult<()> {
    match command {
        BlitCommand::CopyBufferToBuffer { src, src_offset, dst, dst_offset, size } => {
            let mut staging = vec![0u8; *size as usize];
            src.native().read(*src_offset, &mut staging)?;
            dst.native().write(*dst_offset, &staging)
        }
        BlitCommand::CopyBufferToTexture { src, src_offset, bytes_per_row, dst, region } => {
            let (_, footprint) = buffer_footprint(dst, region, *bytes_per_row);
            let mut staging = vec![0u8; footprint];
            src.native().read(*src_offset, &mut staging)?;
            software_texture(dst)?.write_rows(region, *bytes_per_row as usize, &staging)
        }
        BlitCommand::CopyTextureToBuffer { src, region, dst, dst_offset, bytes_per_row } => {
            let (_, footprint) = buffer_footprint(src, region, *bytes_per_row);
            // Row padding keeps the buffer's previous contents.
            let mut staging = vec![0u8; footprint];
            dst.native().read(*dst_offset, &mut staging)?;
            software_texture(src)?.read_rows(region, *bytes_per_row as usize, &mut staging)?;
            dst.native().write(*dst_offset, &staging)
        }
        BlitCommand::CopyTextureToTexture { src, src_region, dst, dst_mip_level, dst_array_layer, dst_origin } => {
            let (row_len, _) = buffer_footprint(src, src_region, 0);
            let rows = (src_region.extent[1] * src_region.extent[2]) as usize;
            let mut staging = vec![0u8; row_len * rows];
            software_texture(src)?.read_rows(src_region, row_len, &mut staging)?;
            let dst_region = TextureRegion {
                mip_level: *dst_mip_level,
                array_layer: *dst_array_layer,
                origin: *dst_origin,
                extent: src_region.extent,
            };
            software_texture(dst)?.write_rows(&dst_region, row_len, &staging)
        }
        BlitCommand::FillBuffer { buffer, offset, size, value } => software_buffer(buffer)?.fill(*offset, *size, *value),
    }
}
