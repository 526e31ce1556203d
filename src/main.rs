// =============================================================================
// STAGED TRIANGLE - Minimal Vulkan renderer with asynchronous uploads
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS title)                       │
// │    └── Renderer                                                 │
// │          ├── VulkanDevice (instance, surface, GPU, allocator)   │
// │          ├── Swapchain (images, per-image semaphores/fences)    │
// │          ├── GraphicsPipeline (render pass, framebuffers)       │
// │          └── StagingUploads (fenced copies, reaped per frame)   │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod backend;
mod config;
mod renderer;

use anyhow::{Context, Result};
use config::Config;
use renderer::Renderer;
use std::fs::File;
use std::io::{self, Write};
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting staged triangle");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Fatal errors inside the loop are reported back through the app
    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging to stderr, optionally mirrored into a file.
///
/// The configured level applies unless `RUST_LOG` says otherwise.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(Tee { file })));
    }

    builder.try_init().context("Failed to initialize logger")?;
    Ok(())
}

/// Writes every log line to stderr and to the log file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // Renderer is declared first so it is dropped before the window
    renderer: Option<Renderer>,
    window: Option<Window>,
    is_fullscreen: bool,

    quit_key: Option<KeyCode>,
    fullscreen_key: Option<KeyCode>,

    /// First fatal error, handed back to `main`
    failure: Option<anyhow::Error>,

    frames: FrameCounter,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let quit_key = config.quit_key();
        let fullscreen_key = config.fullscreen_key();
        if quit_key.is_none() {
            log::warn!("Unknown quit key '{}'", config.controls.quit_key);
        }
        if fullscreen_key.is_none() {
            log::warn!("Unknown fullscreen key '{}'", config.controls.fullscreen_key);
        }

        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            quit_key,
            fullscreen_key,
            failure: None,
            frames: FrameCounter::new(Instant::now()),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        event_loop.exit();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(window), Some(renderer)) = (&self.window, &mut self.renderer) else {
            return;
        };

        match renderer.render_frame(window.inner_size()) {
            Ok(true) => self.update_fps(),
            Ok(false) => {}
            Err(e) => self.fail(event_loop, e.context("Render error")),
        }
    }

    fn toggle_fullscreen(&mut self) {
        let Some(window) = &self.window else {
            return;
        };
        self.is_fullscreen = !self.is_fullscreen;

        if self.is_fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }

        if let Some(renderer) = &mut self.renderer {
            renderer.needs_recreate = true;
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some((fps, frame_ms)) = self.frames.tick(Instant::now()) else {
            return;
        };

        let pending = self.renderer.as_ref().map_or(0, |r| r.pending_uploads());
        if let Some(window) = &self.window {
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms), {} upload(s) in flight",
                self.config.window.title, fps, frame_ms, pending
            ));
        }
    }
}

/// Counts presented frames and reports a rate about once per second
struct FrameCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FrameCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Record a frame at `now`. Once a second has passed since the last
    /// report, returns the average FPS and the duration of this frame in ms.
    fn tick(&mut self, now: Instant) -> Option<(f32, f32)> {
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.frames as f32 / elapsed;
        self.frames = 0;
        self.window_start = now;
        Some((fps, frame_ms))
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => w,
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                // Zero-sized windows are skipped by the renderer itself
                if let Some(renderer) = &mut self.renderer {
                    renderer.needs_recreate = true;
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if Some(key) == self.quit_key {
                    log::info!("{:?} pressed, exiting...", key);
                    event_loop.exit();
                } else if Some(key) == self.fullscreen_key {
                    self.toggle_fullscreen();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // GPU objects must go while the window (and its surface) still exist
        self.renderer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn frame_counter_reports_once_per_second() {
        let start = Instant::now();
        let mut counter = FrameCounter::new(start);

        for i in 1..60 {
            assert!(counter.tick(start + Duration::from_millis(i * 16)).is_none());
        }

        let (fps, frame_ms) = counter.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((fps - 60.0).abs() < 0.01);
        assert!((frame_ms - 56.0).abs() < 0.01);

        // The window restarts after a report
        assert!(counter.tick(start + Duration::from_millis(1016)).is_none());
    }
}
