use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use anyhow::{bail, Context};
use log::{info, warn};
use kestrel_rhi::{
    Buffer, BufferDescriptor, ColorAttachment, CommandBufferCompletion, CommandBufferStatus,
    CommandEncoder, CommandQueue, CompletionStatus, EventLoop, GraphicsDevice, QueueCapability,
    RenderPassDescriptor, Texture, TextureDescriptor, TextureFormat, TextureRegion,
};

const MAX_FRAMES_IN_FLIGHT: usize = 2;
const TARGET_WIDTH: u32 = 64;
const TARGET_HEIGHT: u32 = 64;

const CLEAR_COLORS: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 1.0],
    [0.0, 1.0, 0.0, 1.0],
    [0.0, 0.0, 1.0, 1.0],
];

/// Headless frame loop: every frame clears an offscreen target and reads it back.
pub struct FrameLoop {
    device: GraphicsDevice,
    queue: CommandQueue,
    event_loop: EventLoop,

    target: Texture,
    readback: Buffer,
    in_flight: VecDeque<CommandBufferCompletion>,
    completed_frames: Arc<AtomicU64>,

    frame_index: u64,
    frame_count: u64,
    last_time_printed: Instant,
}

impl FrameLoop {
    pub fn new(device: GraphicsDevice, event_loop: EventLoop) -> Result<Self, anyhow::Error> {
        let queue = device.create_command_queue(QueueCapability::Graphics)?;
        let target = device.create_texture(&TextureDescriptor::render_target(
            "offscreen target",
            TARGET_WIDTH,
            TARGET_HEIGHT,
            TextureFormat::Rgba8Unorm,
        ))?;
        let readback_size = (TARGET_WIDTH * TARGET_HEIGHT * TextureFormat::Rgba8Unorm.bytes_per_pixel()) as u64;
        let readback = device.create_buffer(&BufferDescriptor::staging("readback", readback_size))?;

        Ok(Self {
            device,
            queue,
            event_loop,

            target,
            readback,
            in_flight: VecDeque::with_capacity(MAX_FRAMES_IN_FLIGHT + 1),
            completed_frames: Arc::new(AtomicU64::new(0)),

            frame_index: 0,
            frame_count: 0,
            last_time_printed: Instant::now(),
        })
    }

    pub fn run(&mut self, frames: u32) -> Result<(), anyhow::Error> {
        for _ in 0..frames {
            self.frame()?;
        }
        self.drain()?;

        if frames > 0 {
            self.verify_last_frame()?;
        }
        self.report();
        Ok(())
    }

    #[profiling::function]
    fn frame(&mut self) -> Result<(), anyhow::Error> {
        self.event_loop.run_pending();
        self.tick();

        let color = CLEAR_COLORS[(self.frame_index % CLEAR_COLORS.len() as u64) as usize];
        let mut command_buffer = self.queue.create_command_buffer()?;
        command_buffer.set_label(format!("frame {}", self.frame_index));

        let pass = RenderPassDescriptor::new("clear")
            .with_color_attachment(ColorAttachment::new(&self.target).with_clear_color(color));
        command_buffer.create_render_command_encoder(&pass)?.end_encoding()?;

        {
            let mut blit = command_buffer.create_blit_command_encoder()?;
            let region = TextureRegion::whole(self.target.descriptor(), 0, 0);
            let bytes_per_row = TARGET_WIDTH * self.target.format().bytes_per_pixel();
            blit.copy_texture_to_buffer(&self.target, region, &self.readback, 0, bytes_per_row)?;
            blit.end_encoding()?;
        }

        let frame_index = self.frame_index;
        let completed_frames = self.completed_frames.clone();
        command_buffer.add_completed_handler_on_event_loop(move |status| match status {
            CompletionStatus::Completed => {
                completed_frames.fetch_add(1, Ordering::Relaxed);
            }
            status => warn!("frame {frame_index} finished as {status:?}"),
        })?;

        self.in_flight.push_back(command_buffer.completion());
        command_buffer.commit()?;
        self.frame_index += 1;

        while self.in_flight.len() > MAX_FRAMES_IN_FLIGHT {
            self.retire_oldest()?;
        }

        kestrel_core::profile::finish_frame();
        Ok(())
    }

    fn retire_oldest(&mut self) -> Result<(), anyhow::Error> {
        let Some(completion) = self.in_flight.pop_front() else {
            return Ok(());
        };
        match completion.wait()? {
            CommandBufferStatus::Completed => Ok(()),
            status => bail!("frame ended as {status:?}"),
        }
    }

    fn drain(&mut self) -> Result<(), anyhow::Error> {
        while !self.in_flight.is_empty() {
            self.retire_oldest()?;
        }

        let expected = self.frame_index;
        let completed_frames = self.completed_frames.clone();
        let delivered = self.event_loop.run_until(Duration::from_secs(5), || {
            completed_frames.load(Ordering::Relaxed) >= expected
        });
        if !delivered {
            warn!(
                "only {} of {expected} frame completions reached the event loop",
                self.completed_frames.load(Ordering::Relaxed)
            );
        }
        Ok(())
    }

    fn verify_last_frame(&self) -> Result<(), anyhow::Error> {
        let last = CLEAR_COLORS[((self.frame_index - 1) % CLEAR_COLORS.len() as u64) as usize];
        let expected: Vec<u8> = last.iter().map(|c| (c * 255.0).round() as u8).collect();

        let texel = self.readback.read_range(0..4).context("reading back the offscreen target")?;
        if texel != expected {
            bail!("readback mismatch: expected {expected:?}, got {texel:?}");
        }
        info!("last frame read back as {texel:?}");
        Ok(())
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = (now - self.last_time_printed).as_secs_f32();
        if elapsed > 1. {
            info!("Frame rate: {} fps", self.frame_count as f32 / elapsed);
            self.last_time_printed = now;
            self.frame_count = 0;
        }
        self.frame_count += 1;
    }

    fn report(&self) {
        let fences = self.device.fence_pool_stats();
        let notifier = self.device.notifier_stats();
        let queue = self.queue.stats();
        info!(
            "{} frames: {} fences created, {} free, {} retired; {} of {} completions delivered",
            self.frame_index, fences.created, fences.free, fences.retired, notifier.delivered, notifier.registered
        );
        info!("queue '{}': {queue:?}", self.queue.label());
        info!("pipeline cache: {:?}", self.device.pipeline_cache_stats());
    }
}
