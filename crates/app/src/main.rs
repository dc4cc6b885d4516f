//! vkpipe - frame pipeline demo
//!
//! Runs the frame pipeline either against a window on a Vulkan device,
//! clearing each presented image to an animated color, or headless on the
//! software timeline as a soak test.
//!
//! # Usage
//!
//! ```bash
//! vkpipe
//! vkpipe --config vkpipe.toml
//! vkpipe --headless --frames 2000
//! ```

mod demo;
mod headless;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use winit::event_loop::ControlFlow;

use vkpipe_core::RendererConfig;
use vkpipe_platform::{ActiveEventLoop, ApplicationHandler, EventLoop, Window, WindowEvent, WindowId};

use crate::demo::Demo;

#[derive(Parser)]
#[command(name = "vkpipe")]
#[command(version, about = "Frame pipelining demo on Vulkan or a headless device")]
struct Args {
    /// Renderer configuration (TOML); defaults apply when omitted
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Run on the headless device instead of opening a window
    #[arg(long)]
    headless: bool,

    /// Frames to render in headless mode
    #[arg(long, default_value = "600")]
    frames: u64,

    /// Simulated device latency per submission in headless mode, in milliseconds
    #[arg(long, default_value = "2")]
    device_delay_ms: u64,
}

// Fields drop in order: the device goes before the window it presents to
struct App {
    config: RendererConfig,
    demo: Option<Demo>,
    window: Option<Window>,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        Self {
            config,
            demo: None,
            window: None,
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, &self.config.presentation) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };
        match Demo::new(&window, &self.config) {
            Ok(demo) => {
                info!("Initialization complete, entering main loop");
                self.demo = Some(demo);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to start renderer: {:?}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                // Tear down the device before the window it presents to
                self.demo = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = &mut self.window {
                    window.resize(size.width, size.height);
                }
                if let Some(demo) = &mut self.demo {
                    demo.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(demo) = &mut self.demo
                    && let Err(e) = demo.render_frame()
                {
                    error!("Frame failed: {:?}", e);
                    self.demo = None;
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window
            && !window.is_minimized()
        {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RendererConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RendererConfig::default(),
    };
    vkpipe_core::init_logging(config.debug.log_filter.as_deref());
    info!("Starting vkpipe");

    if args.headless {
        let report = headless::run(&config, args.frames, args.device_delay_ms)
            .context("headless run failed")?;
        info!("{}", report);
        return Ok(());
    }

    let event_loop = EventLoop::new().context("creating event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("event loop failed")?;

    Ok(())
}
