//! Drive the shim end to end against the mock HAL
//!
//! Lights every display, commits a few frames with a stack of overlay
//! planes and prints the events that come back. With `--layer-limit`
//! below the plane count the client-composition fallback kicks in.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use drm_hwcomposer_shim::commit::DRM_MODE_PAGE_FLIP_EVENT;
use drm_hwcomposer_shim::gbm_device::gbm_usage::GBM_BO_USE_SCANOUT;
use drm_hwcomposer_shim::hal::mock::{phone_display, MockHal};
use drm_hwcomposer_shim::model::PlaneType;
use drm_hwcomposer_shim::{
    logging, CommitRequest, CommitResult, CpuGlBackend, Fourcc, HwcDrmDevice, ObjectId,
    PlaneUpdate, Rect, ShimConfig, SrcRect,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const VSYNC_PERIOD: Duration = Duration::from_millis(16);

#[derive(Parser, Debug)]
#[command(name = "shim_probe")]
#[command(about = "Exercise the DRM hwcomposer shim on a mock HAL", long_about = None)]
struct Args {
    /// Frames to commit per display
    #[arg(short, long, default_value_t = 10)]
    frames: u32,

    /// Overlay planes to stack above the primary plane
    #[arg(short, long, default_value_t = 2)]
    overlays: u32,

    /// Layers the mock hwcomposer accepts per present
    #[arg(short, long)]
    layer_limit: Option<usize>,

    /// Number of mock displays
    #[arg(long, default_value_t = 1)]
    displays: u32,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,
}

struct Output {
    crtc: ObjectId,
    primary: ObjectId,
    overlays: Vec<ObjectId>,
    width: u32,
    height: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ShimConfig::default();
    config.overlay_planes = config.overlay_planes.max(args.overlays);
    if args.debug {
        config.log_filter = "debug".to_string();
    }
    logging::init(&config);

    let hal = Arc::new(MockHal::new());
    for id in 0..args.displays {
        let (display, modes) = phone_display(u64::from(id));
        hal.add_display(display, modes);
    }
    hal.set_layer_limit(args.layer_limit);

    let device = HwcDrmDevice::open(hal.clone(), Arc::new(CpuGlBackend::new()), config)
        .context("opening shim device")?;
    let events = device.subscribe().context("subscribing to events")?;

    let outputs = light_up(&device, args.overlays as usize)?;
    info!("{} output(s) lit", outputs.len());

    let running = Arc::new(AtomicBool::new(true));
    let vsync = {
        let hal = hal.clone();
        let running = running.clone();
        let displays = args.displays;
        thread::Builder::new()
            .name("probe-vsync".into())
            .spawn(move || {
                let start = Instant::now();
                while running.load(Ordering::Relaxed) {
                    let now = start.elapsed().as_nanos() as i64;
                    for id in 0..displays {
                        hal.fire_vsync(u64::from(id), now);
                    }
                    thread::sleep(VSYNC_PERIOD);
                }
            })?
    };

    for frame in 0..args.frames {
        for output in &outputs {
            let result = present_frame(&device, output, frame)?;
            if let CommitResult::Completed { outcomes, .. } = result {
                for outcome in outcomes {
                    println!(
                        "frame {:>3} crtc {} seq {:>3} {:?}",
                        frame, outcome.crtc, outcome.sequence, outcome.composition
                    );
                }
            }
        }
        while let Some(event) = events.try_next() {
            println!(
                "  event {:?} crtc {} seq {} ts {} user_data {}",
                event.kind, event.crtc_id, event.sequence, event.timestamp_ns, event.user_data
            );
        }
    }

    running.store(false, Ordering::Relaxed);
    vsync
        .join()
        .map_err(|_| anyhow!("vsync thread panicked"))?;

    println!(
        "coalesced vsyncs {}, overflowed flips {}",
        events.coalesced_vsyncs(),
        events.overflow_count()
    );
    drop(events);

    let report = device.close();
    if report.is_clean() {
        println!("closed cleanly, {} HAL buffers live", hal.live_buffers());
    } else {
        for leak in &report.leaked {
            println!("leaked buffer {} {}x{} {:?}", leak.id, leak.width, leak.height, leak.format);
        }
    }
    Ok(())
}

/// Modeset every connected connector to its preferred mode
fn light_up(device: &HwcDrmDevice, overlays: usize) -> Result<Vec<Output>> {
    let snapshot = device.enumerate();
    let mut outputs = Vec::new();
    for conn in snapshot.connectors() {
        let Some(mode) = conn.modes.first() else {
            continue;
        };
        let Some(encoder) = snapshot.encoders().find(|e| e.id == conn.encoder_id) else {
            continue;
        };
        let Some(crtc) = snapshot
            .crtcs()
            .find(|c| encoder.possible_crtcs & (1 << c.index) != 0)
        else {
            continue;
        };
        let usable = snapshot
            .planes()
            .filter(|p| p.possible_crtcs & (1 << crtc.index) != 0);
        let mut primary = None;
        let mut overlay_planes = Vec::new();
        for plane in usable {
            match plane.plane_type {
                PlaneType::Primary => primary = Some(plane.id),
                PlaneType::Overlay if overlay_planes.len() < overlays => {
                    overlay_planes.push(plane.id)
                }
                _ => {}
            }
        }
        let primary = primary.ok_or_else(|| anyhow!("CRTC {} has no primary plane", crtc.id))?;

        let fb = framebuffer(device, 256, 256)?;
        device
            .set_crtc(crtc.id, Some(fb), conn.id, mode)
            .with_context(|| format!("modeset on CRTC {}", crtc.id))?;
        println!(
            "connector {} -> CRTC {} at {}x{}@{}",
            conn.id, crtc.id, mode.hdisplay, mode.vdisplay, mode.vrefresh
        );
        outputs.push(Output {
            crtc: crtc.id,
            primary,
            overlays: overlay_planes,
            width: u32::from(mode.hdisplay),
            height: u32::from(mode.vdisplay),
        });
    }
    Ok(outputs)
}

fn framebuffer(device: &HwcDrmDevice, width: u32, height: u32) -> Result<ObjectId> {
    let bo = device
        .gbm()
        .create_bo(width, height, Fourcc::ARGB8888, GBM_BO_USE_SCANOUT)?
        .accept();
    // The framebuffer keeps its own reference to the buffer
    let fb = device.add_framebuffer(&bo, bo.format())?;
    Ok(fb)
}

fn present_frame(device: &HwcDrmDevice, output: &Output, frame: u32) -> Result<CommitResult> {
    let mut req =
        CommitRequest::new(DRM_MODE_PAGE_FLIP_EVENT).with_user_data(u64::from(frame));
    let mut fbs = vec![framebuffer(device, 256, 256)?];
    req.plane(PlaneUpdate::new(
        output.primary,
        output.crtc,
        fbs[0],
        SrcRect::from_pixels(0, 0, 256, 256),
        Rect::new(0, 0, output.width, output.height),
    ));
    for (i, &plane) in output.overlays.iter().enumerate() {
        let fb = framebuffer(device, 128, 128)?;
        fbs.push(fb);
        let offset = (frame as i32 * 8 + i as i32 * 160) % (output.width as i32 - 128).max(1);
        req.plane(
            PlaneUpdate::new(
                plane,
                output.crtc,
                fb,
                SrcRect::from_pixels(0, 0, 128, 128),
                Rect::new(offset, 200 + i as i32 * 160, 128, 128),
            )
            .with_zpos(i as u32 + 1),
        );
    }
    let result = device.commit(&req)?;
    // Planes still showing a framebuffer keep it alive after removal
    for fb in fbs {
        device.remove_framebuffer(fb.raw())?;
    }
    Ok(result)
}
