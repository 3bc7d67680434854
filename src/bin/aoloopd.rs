//! Daemon entry point: wires the simulated hardware stack, the loop
//! engine and the session layer together (spec.md §6, §9).
//!
//! Real vendor drivers (Alpao, Andor, FireWire) are out of scope
//! (spec.md §1); this binary always drives [`aoloop::sim::SimCamera`]
//! behind the same [`aoloop::device::camera::CameraDriver`] contract a
//! real driver would implement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use aoloop::cli::Cli;
use aoloop::config::ConfigFile;
use aoloop::device::camera::{CameraDevice, CameraMode};
use aoloop::device::telescope::Telescope;
use aoloop::device::wfc::{WfcDevice, WfcDriver};
use aoloop::device::{Device, Registry};
use aoloop::error::AoResult;
use aoloop::loop_engine::{LoopEngine, LoopMode};
use aoloop::ring::FrameRing;
use aoloop::session::{self, protocol, Broadcaster, SessionServer};
use aoloop::shift::ShiftEngine;
use aoloop::sim::seeing::Seeing;
use aoloop::sim::{ActuatorField, SimCamera};
use aoloop::wfs::{ApertureShape, MlaGeometry, ShwfsDevice};

/// A mirror driver with no backing hardware: the simulator reads
/// `WfcDevice::ctrl_vec` directly to shape the synthetic wavefront, so
/// the actual `dm_actuate` call has nothing to send anywhere.
struct SimulatedMirror(usize);

impl WfcDriver for SimulatedMirror {
    fn dm_actuate(&mut self, _command: &[f64]) -> AoResult<()> {
        Ok(())
    }
    fn n_actuators(&self) -> usize {
        self.0
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Lays `n` actuators on the smallest square grid that holds them,
/// spanning the frame with a one-actuator-width margin.
fn actuator_grid(n: usize, width: usize, height: usize) -> Vec<(f64, f64)> {
    let side = (n as f64).sqrt().ceil() as usize;
    let step_x = width as f64 / (side + 1) as f64;
    let step_y = height as f64 / (side + 1) as f64;
    (0..n)
        .map(|i| {
            let row = i / side;
            let col = i % side;
            (step_x * (col + 1) as f64, step_y * (row + 1) as f64)
        })
        .collect()
}

fn main() {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new()
        .with_level(cli.level_filter())
        .init()
        .expect("failed to install logger");

    if let Err(e) = run(cli) {
        log::error!("aoloopd exiting: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = match &cli.config {
        Some(path) => Some(ConfigFile::load(path)?),
        None => None,
    };
    let get_usize = |key: &str, default: usize| cfg.as_ref().map(|c| c.get_usize_or(key, default)).unwrap_or(default);
    let get_f64 = |key: &str, default: f64| cfg.as_ref().map(|c| c.get_f64_or(key, default)).unwrap_or(default);

    let width = get_usize("width", 64);
    let height = get_usize("height", 64);
    let exposure = get_f64("exposure", 0.01);
    let sub_size = get_usize("sub_size", 8);
    let n_actuators = get_usize("n_actuators", 9);
    let n_workers = get_usize("shift_workers", 4);
    let port = get_usize("port", 6666);
    let calib_dir = cfg.as_ref().and_then(|c| c.get_path("calib_dir").ok());

    let registry = Registry::new();
    let broadcaster = Broadcaster::new();
    let ring = Arc::new(FrameRing::new(16));

    let actuator_positions = actuator_grid(n_actuators, width, height);
    let actuator_size = (width.min(height) as f64) / ((n_actuators as f64).sqrt().max(1.0));

    let wfc = Arc::new(WfcDevice::new("wfc0", n_actuators, Box::new(SimulatedMirror(n_actuators))));
    registry.insert(wfc.clone() as Arc<dyn Device>)?;

    let telescope = Arc::new(Telescope::new("tel0"));
    registry.insert(telescope.clone() as Arc<dyn Device>)?;

    let geometry = MlaGeometry::generate(
        width,
        height,
        (sub_size, sub_size),
        (sub_size as f64, sub_size as f64),
        0.0,
        (0.0, 0.0),
        ApertureShape::Circular,
        0.5,
    )?;
    let mla_rects = Arc::new(Mutex::new(geometry.rects().to_vec()));

    let seeing = Seeing::new(vec![0.0; width * height * 4], width * 2, height * 2, width, height);
    let wfcerr_field = ActuatorField::new(actuator_positions.clone(), actuator_size, width, height);
    let wfc_field = ActuatorField::new(actuator_positions, actuator_size, width, height);

    let sim = SimCamera::new(
        width,
        height,
        seeing,
        (width.min(height) as f64) / 2.0,
        0.1,
        1.0,
        wfcerr_field,
        Some((wfc.clone(), wfc_field)),
        mla_rects,
    );
    let cam = CameraDevice::new("cam0", ring.clone(), Box::new(sim));
    cam.set_exposure(exposure);
    registry.insert(cam.clone() as Arc<dyn Device>)?;

    let shift_engine = ShiftEngine::new(n_workers);
    let wfs = Arc::new(ShwfsDevice::new("wfs0", "cam0", shift_engine));
    wfs.set_geometry(geometry, width, height)?;
    registry.insert(wfs.clone() as Arc<dyn Device>)?;

    let loop_engine = LoopEngine::new(Duration::from_millis(500), 1.0);
    loop_engine.set_perf_logging(cli.perflog != 0);

    let shutdown_flag = Arc::new(AtomicBool::new(false));

    if cli.signals != 0 {
        let loop_for_signal = loop_engine.clone();
        let flag_for_signal = shutdown_flag.clone();
        ctrlc::set_handler(move || {
            log::info!("SIGINT received, shutting down");
            flag_for_signal.store(true, Ordering::SeqCst);
            loop_for_signal.set_mode(LoopMode::Shutdown);
        })?;
    }

    {
        let capture_cam = cam.clone();
        let store_broadcaster = broadcaster.clone();
        std::thread::spawn(move || {
            capture_cam.run_capture_loop(|cam, frame| match cam.maybe_store(frame) {
                Ok(Some(n)) => store_broadcaster.publish("store", &protocol::ok("store", &n.to_string())),
                Ok(None) => {}
                Err(e) => log::warn!("failed to store frame: {e}"),
            })
        });
    }
    cam.set_mode(CameraMode::Running);

    {
        let le = loop_engine.clone();
        let wfs_loop = wfs.clone();
        let wfc_loop = wfc.clone();
        let telescope_loop = telescope.clone();
        let ring_loop = ring.clone();
        std::thread::spawn(move || le.run(&wfs_loop, &wfc_loop, &telescope_loop, &ring_loop));
    }

    if cli.nodaemon {
        log::info!("running without a network listener (--nodaemon)");
        while !shutdown_flag.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
    } else {
        let server = SessionServer::new(
            registry,
            broadcaster,
            loop_engine,
            wfs,
            wfc,
            telescope,
            vec![cam.clone()],
            ring,
            shutdown_flag.clone(),
            calib_dir,
        );
        let addr = format!("0.0.0.0:{port}");
        log::info!("listening on {addr}");
        session::serve(server, addr)?;
    }

    cam.shutdown();
    Ok(())
}
