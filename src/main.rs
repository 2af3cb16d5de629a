//! # Vellum demo client
//!
//! Drives the rendering substrate against the in-process headless server:
//! one animated window, an optional sub-surface, an optional interactive
//! resize burst and a PNG screenshot of the last committed frame.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};

use vellum::buffer::gpu::HeadlessGpu;
use vellum::buffer::{DrawTarget, ShmTarget};
use vellum::protocol::headless::{HeadlessHandle, HeadlessTransport};
use vellum::protocol::{PixelFormat, Rect, SurfaceId};
use vellum::{
    Display, Frame, Layout, SubsurfaceMode, TimerFd, VellumConfig, WindowHandler, WindowId,
};

#[derive(Parser)]
#[command(name = "vellum")]
#[command(about = concat!(
    "Headless demo of the Vellum rendering substrate (built ",
    env!("VELLUM_BUILD_DATE"),
    ", commit ",
    env!("VELLUM_GIT_COMMIT"),
    ")"
))]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/vellum/vellum.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Frames to present before exiting
    #[arg(long, default_value_t = 120)]
    frames: u64,

    /// Initial window width (0 uses the configured default)
    #[arg(long, default_value_t = 0)]
    width: u32,

    /// Initial window height (0 uses the configured default)
    #[arg(long, default_value_t = 0)]
    height: u32,

    /// Simulate an interactive resize of this many steps
    #[arg(long, default_value_t = 0)]
    resize_burst: u32,

    /// Draw through the headless GPU device instead of shared memory
    #[arg(long)]
    gpu: bool,

    /// Add an inset sub-surface to the window
    #[arg(long)]
    subsurface: bool,

    /// Write the last committed frame of the main surface to a PNG file
    #[arg(long)]
    screenshot: Option<String>,
}

/// Paints a moving disc over a solid background.
struct DemoPainter {
    presented: Rc<Cell<u64>>,
    frames: u64,
    inset: i32,
}

impl WindowHandler for DemoPainter {
    fn draw(&mut self, frame: &mut Frame<'_>) {
        let count = self.presented.get();
        let main = frame.is_main();
        match frame.target() {
            DrawTarget::Shm(target) => {
                if main {
                    paint_scene(target, count);
                } else {
                    target.fill(0xc020_2020);
                }
            }
            DrawTarget::Gpu { size } => {
                debug!("GPU frame {} at {}x{}", count, size.width, size.height);
            }
        }
        if main {
            self.presented.set(count + 1);
            if count + 1 < self.frames {
                frame.request_next_frame();
            }
        }
    }

    fn resize(&mut self, layout: &mut Layout<'_>) {
        let size = layout.size();
        let inset = self.inset;
        for surface in layout.auxiliary() {
            let width = size.width.saturating_sub(2 * inset as u32);
            let height = (size.height / 4).min(size.height.saturating_sub(2 * inset as u32));
            layout.place(surface, Rect::new(inset, inset, width, height));
        }
    }

    fn output_changed(&mut self, output: vellum::protocol::OutputId, entered: bool) {
        debug!("Output {:?} {}", output, if entered { "entered" } else { "left" });
    }
}

fn paint_scene(target: &mut ShmTarget<'_>, count: u64) {
    if target.format == PixelFormat::Rgb565 {
        let shade = (count % 32) as u32;
        target.fill(shade << 11 | shade << 6 | 0x10);
        return;
    }

    let Some(mut pixmap) = tiny_skia::Pixmap::new(target.width, target.height) else {
        return;
    };
    pixmap.fill(tiny_skia::Color::from_rgba8(24, 28, 38, 255));

    let radius = (target.width.min(target.height) as f32 / 8.0).max(2.0);
    let travel = (target.width as f32 - 2.0 * radius).max(1.0);
    let phase = (count % 120) as f32 / 120.0;
    let x = radius + travel * phase;
    let y = target.height as f32 / 2.0;

    if let Some(circle) = tiny_skia::PathBuilder::from_circle(x, y, radius) {
        let paint = tiny_skia::Paint {
            shader: tiny_skia::Shader::SolidColor(tiny_skia::Color::from_rgba8(
                236, 140, 52, 255,
            )),
            anti_alias: true,
            ..Default::default()
        };
        pixmap.fill_path(
            &circle,
            &paint,
            tiny_skia::FillRule::Winding,
            tiny_skia::Transform::identity(),
            None,
        );
    }

    // tiny-skia stores premultiplied RGBA; the buffer wants little-endian ARGB.
    let row_len = target.width as usize * 4;
    let stride = target.stride as usize;
    for (dst, src) in target
        .pixels
        .chunks_exact_mut(stride)
        .zip(pixmap.data().chunks_exact(row_len))
    {
        for (d, s) in dst[..row_len].chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
        }
    }
}

fn write_screenshot(server: &HeadlessHandle, surface: SurfaceId, path: &Path) -> Result<()> {
    let snapshot = server
        .snapshot(surface)
        .context("No buffer has been committed to the main surface")?;
    if snapshot.format.bytes_per_pixel() != 4 {
        anyhow::bail!("Screenshots need a 32-bit format, got {:?}", snapshot.format);
    }

    let mut rgba = Vec::with_capacity((snapshot.width * snapshot.height * 4) as usize);
    let row_len = snapshot.width as usize * 4;
    for row in snapshot.data.chunks_exact(snapshot.stride as usize) {
        for px in row[..row_len].chunks_exact(4) {
            let alpha = if snapshot.format.has_alpha() { px[3] } else { 255 };
            rgba.extend_from_slice(&[px[2], px[1], px[0], alpha]);
        }
    }

    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut encoder = png::Encoder::new(file, snapshot.width, snapshot.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&rgba)?;

    info!("📸 Screenshot saved to {}", path.display());
    Ok(())
}

/// Steps an interactive resize on each tick, then stops the loop once
/// enough frames were presented.
fn drive(
    display: &mut Display,
    window: WindowId,
    tick: &mut u32,
    burst: u32,
    presented: &Cell<u64>,
    frames: u64,
) {
    *tick += 1;
    if burst > 0 && *tick <= burst + 1 {
        let result = if *tick <= burst {
            let step = *tick;
            display
                .set_resizing(window, true)
                .and_then(|_| display.schedule_resize(window, 320 + step * 16, 240 + step * 9))
        } else {
            display.set_resizing(window, false)
        };
        if let Err(e) = result {
            warn!("Resize step {} failed: {}", tick, e);
        }
    }
    if presented.get() >= frames && (burst == 0 || *tick > burst) {
        display.exit_loop();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting Vellum demo");
    info!(
        "📄 Version: {} ({}, {})",
        vellum::VERSION,
        env!("VELLUM_TARGET"),
        env!("VELLUM_BUILD_DATE")
    );

    // Load configuration
    let mut config = match VellumConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            info!("📝 Using default configuration");
            VellumConfig::default()
        }
    };
    config.general.debug |= cli.debug;
    config.gpu.enabled = cli.gpu;

    let transport = HeadlessTransport::new().context("Failed to start the headless server")?;
    let server = transport.handle();
    let mut display = Display::connect(Box::new(transport), config)?;
    if cli.gpu {
        display = display.with_gpu(Box::new(HeadlessGpu::new()));
    }

    let output = server.add_output(1920, 1080, 1);

    let presented = Rc::new(Cell::new(0));
    let window = display.create_window(
        cli.width,
        cli.height,
        DemoPainter {
            presented: presented.clone(),
            frames: cli.frames.max(1),
            inset: 16,
        },
    )?;
    let main_surface = display
        .main_surface(window)
        .context("Window has no main surface")?;
    server.enter(main_surface.surface, output);

    if cli.subsurface {
        let handle = display.add_subsurface(window, SubsurfaceMode::Desynchronized)?;
        info!("🧩 Sub-surface {:?} added", handle.surface);
    }

    let timer = TimerFd::new().context("Failed to create the demo timer")?;
    timer.arm(Duration::from_millis(5), Some(Duration::from_millis(5)))?;
    let mut tick = 0;
    let burst = cli.resize_burst;
    let frames = cli.frames.max(1);
    let counter = presented.clone();
    display.add_window_timer(window, &timer, move |display, _| {
        drive(display, window, &mut tick, burst, &counter, frames)
    })?;

    display.run()?;

    if let Some(stats) = display.frame_stats(main_surface) {
        info!(
            "📊 {} frames presented, avg {:?} ({:.1} fps), min {:?}, max {:?}",
            stats.presented, stats.avg_interval, stats.fps, stats.min_interval, stats.max_interval
        );
    }
    if let Some(size) = display.committed_size(main_surface) {
        info!("📐 Final committed size {}x{}", size.width, size.height);
    }

    if let Some(path) = &cli.screenshot {
        if let Err(e) = write_screenshot(&server, main_surface.surface, Path::new(path)) {
            error!("❌ Screenshot failed: {:#}", e);
        }
    }

    display.destroy_window(window)?;
    display.shutdown()?;
    Ok(())
}
