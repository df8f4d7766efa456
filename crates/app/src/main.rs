//! swapframe demo: clears the window every frame through the frame scheduler.
//!
//! Resizing, minimizing and restoring the window exercise the swapchain
//! rebuild path; `--max-frames` makes the run finite.

mod scene;

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use clap::Parser;
use tracing::info;

use swapframe_core::config::DEFAULT_CONFIG_PATH;
use swapframe_core::{EngineConfig, PresentModePreference, Timer};
use swapframe_engine::depth_buffer::find_depth_format;
use swapframe_engine::{FrameScheduler, VulkanContext};
use swapframe_platform::WindowSystem;
use swapframe_rhi::{DisplayContext, SwapchainPreferences, SwapchainState};

use crate::scene::{ClearScene, FrameLimit, FrameStats};

#[derive(Parser, Debug)]
#[command(name = "swapframe", version, about = "Swapchain-synchronized frame presentation demo")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Close after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Enable the Vulkan validation layer regardless of the configuration
    #[arg(long)]
    validation: bool,
}

fn present_mode(preference: PresentModePreference) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

fn main() -> Result<()> {
    swapframe_core::init_logging();
    let args = Args::parse();

    let config = EngineConfig::load(&args.config)?;
    let validation = args.validation || config.present.validation;
    info!("Starting swapframe");

    // Locals drop in reverse order: scene targets, swapchain, then the context.
    let mut window_system = WindowSystem::new(&config.window)?;
    let vulkan = Arc::new(VulkanContext::new(window_system.window(), validation)?);
    let context: Arc<dyn DisplayContext> = vulkan.clone();

    let depth_format = find_depth_format(
        vulkan.instance().handle(),
        vulkan.device().physical_device(),
    )?;

    let preferences = SwapchainPreferences {
        present_mode: present_mode(config.present.mode),
        acquire_timeout: config.present.acquire_timeout_ns(),
    };
    let mut swapchain = SwapchainState::new(context.clone(), preferences)?;

    let scene = Rc::new(RefCell::new(ClearScene::new(
        vulkan.device().clone(),
        depth_format,
        config.scene.clear_color,
    )));
    let frames = Rc::new(Cell::new(0u64));

    let (presented, elapsed) = {
        let target_scene = scene.clone();
        let record_scene = scene.clone();
        let mut scheduler = FrameScheduler::new(
            context.clone(),
            &mut swapchain,
            Box::new(move |frame| target_scene.borrow_mut().build_target(frame)),
            Box::new(move |cmd, frame| record_scene.borrow().record(cmd, frame)),
        )?;

        let resize_scene = scene.clone();
        scheduler.on_resize(Box::new(move |image_count, extent| {
            resize_scene.borrow_mut().on_resize(image_count, extent);
            Ok(())
        }));

        let counter = frames.clone();
        let mut stats = FrameStats::new();
        scheduler.on_update(Box::new(move |_frame| {
            counter.set(counter.get() + 1);
            if let Some(fps) = stats.tick() {
                info!("{:.1} FPS", fps);
            }
            Ok(())
        }));

        let mut events = FrameLimit::new(&mut window_system, frames.clone(), args.max_frames);
        let run_time = Timer::new();
        scheduler.run(&mut events)?;
        (scheduler.frames_presented(), run_time.elapsed())
    };

    let extent = scene.borrow().extent();
    info!(
        "Presented {} frames in {:.1}s, final extent {}x{}",
        presented,
        elapsed.as_secs_f64(),
        extent.width,
        extent.height
    );

    Ok(())
}
