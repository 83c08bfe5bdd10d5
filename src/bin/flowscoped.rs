//! flowscoped - dense motion-field streaming daemon
//!
//! This daemon:
//! 1. Negotiates a frame stream from a configured device
//! 2. Runs the capture/flow/render pipeline at a paced frame rate
//! 3. Captures a motion reference on request (or continuously)
//! 4. Exports the final flow field as a two-sheet workbook
//! 5. Optionally dumps the final overlay as a PPM snapshot

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use flowscope::{
    backend_for, CsvWorkbookWriter, FlowEngine, FlowscopeConfig, FrameSource, PacingScheduler,
    PipelineController, PipelineState, RasterSurface, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Capture device id (stub://static, stub://pan, /dev/video0, ...).
    #[arg(long, env = "FLOWSCOPE_DEVICE")]
    device: Option<String>,
    /// Requested resolution: a preset name (480p, 720p, ...) or WxH.
    #[arg(long)]
    resolution: Option<String>,
    /// Stop after this many frames (0 = run until interrupted).
    #[arg(long, default_value_t = 0)]
    frames: u64,
    /// Capture the motion reference after this many frames.
    #[arg(long, default_value_t = 1)]
    capture_after: u64,
    /// List available devices and their capability bounds, then exit.
    #[arg(long)]
    list_devices: bool,
    /// Write the final flow field workbook to this path on exit.
    #[arg(long)]
    export: Option<PathBuf>,
    /// Write the final overlay frame as a PPM snapshot on exit.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = FlowscopeConfig::load()?;
    if let Some(device) = args.device {
        cfg.device = device;
    }
    if let Some(spec) = &args.resolution {
        cfg.resolution = flowscope::source::resolve_resolution_spec(spec)?;
    }

    let source = open_source(&cfg.device)?;

    if args.list_devices {
        for device in source.enumerate_devices()? {
            println!(
                "{}\t{}\t(max {}x{})",
                device.id, device.label, device.max_width, device.max_height
            );
            for preset in flowscope::available_presets(Some(&device)) {
                match preset {
                    flowscope::PresetChoice::AutoMax(r) => println!("  Auto (Max)\t{}", r),
                    flowscope::PresetChoice::Fixed { name, resolution } => {
                        println!("  {}\t{}", name, resolution)
                    }
                }
            }
        }
        return Ok(());
    }

    let backend = backend_for(&cfg.backend)?;
    let mut controller = PipelineController::new(source, FlowEngine::new(backend));
    controller.start(&cfg.device, cfg.resolution, cfg.target_fps)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let scheduler = PacingScheduler::new(cfg.target_fps);
    let mut surface = RasterSurface::new(cfg.resolution);
    let mut frame_count = 0u64;

    log::info!(
        "flowscoped running: device={} fps={} backend={}",
        cfg.device,
        cfg.target_fps,
        cfg.backend
    );

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();

        controller.poll_negotiation()?;
        controller.step(&cfg.tunables, &mut surface)?;
        frame_count += 1;

        if frame_count == args.capture_after {
            controller.capture_reference();
            log::info!("motion reference captured at frame {}", frame_count);
        }
        if args.frames > 0 && frame_count >= args.frames {
            break;
        }
        if matches!(
            controller.state(),
            PipelineState::Stopped | PipelineState::Uninitialized
        ) {
            break;
        }

        std::thread::sleep(scheduler.delay_after(started));
    }

    if let Some(path) = &args.export {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            cfg.export_dir.join(path)
        };
        let mut writer = CsvWorkbookWriter::new();
        match controller.export(&mut writer, &path) {
            Ok(()) => log::info!("flow field exported to {}", path.display()),
            Err(err) => log::warn!("export skipped: {}", err),
        }
    }
    if let Some(path) = &args.snapshot {
        surface.write_ppm(path)?;
        log::info!("overlay snapshot written to {}", path.display());
    }

    controller.stop();
    log::info!("flowscoped exiting after {} frames", frame_count);
    Ok(())
}

fn open_source(device: &str) -> Result<Arc<dyn FrameSource>> {
    if device.starts_with("stub://") {
        return Ok(Arc::new(SyntheticSource::new()));
    }
    #[cfg(feature = "source-v4l2")]
    {
        Ok(Arc::new(flowscope::source::v4l2::V4l2Source::new()))
    }
    #[cfg(not(feature = "source-v4l2"))]
    {
        Err(anyhow::anyhow!(
            "device {} needs the source-v4l2 feature; only stub:// devices are built in",
            device
        ))
    }
}
