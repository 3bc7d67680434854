//! Loop engine state machine (spec.md §4.7).
//!
//! Mirrors the mutex + condvar "announce on a condition variable"
//! idiom already used by [`crate::shift::ShiftEngine`] and
//! [`crate::device::camera::CameraDevice`]'s mode condition, applied to
//! the five-state `LoopMode` machine instead of per-device modes.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::device::telescope::Telescope;
use crate::device::wfc::WfcDevice;
use crate::error::{log_error, AoError, AoResult};
use crate::ring::SharedFrameRing;
use crate::wfs::ShwfsDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Listen,
    Open,
    Closed,
    Cal,
    Shutdown,
}

/// One named timestamp recorded during an iteration, for the optional
/// performance-logging ring (spec.md §4.7 "Per-iteration performance
/// logging").
#[derive(Debug, Clone, Copy)]
pub struct PhaseMark {
    pub label: &'static str,
    pub at: Instant,
}

struct PerfLog {
    enabled: bool,
    marks: Vec<PhaseMark>,
    capacity: usize,
}

impl PerfLog {
    fn record(&mut self, label: &'static str) {
        if !self.enabled {
            return;
        }
        if self.marks.len() == self.capacity {
            self.marks.remove(0);
        }
        self.marks.push(PhaseMark { label, at: Instant::now() });
    }
}

struct LoopState {
    mode: LoopMode,
    last_seen_frame: Option<u64>,
}

/// Calibration request parameters for [`LoopEngine::calib`]
/// (spec.md §4.5.3, §4.5.5).
pub enum CalibRequest {
    Zero,
    Influence { amplitudes: Vec<f64>, cutoff: crate::wfs::Cutoff },
}

/// Sequences capture -> measure -> reconstruct -> actuate (spec.md
/// §4.7). Owns no devices directly: it is handed references to the
/// camera's frame ring, the WFS, the WFC and the telescope for each
/// run, following the spec.md §9 note against cyclic back-pointers.
pub struct LoopEngine {
    state: Mutex<LoopState>,
    mode_cond: Condvar,
    perf: Mutex<PerfLog>,
    frame_deadline: Duration,
    retain: f64,
}

impl LoopEngine {
    pub fn new(frame_deadline: Duration, retain: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopState {
                mode: LoopMode::Listen,
                last_seen_frame: None,
            }),
            mode_cond: Condvar::new(),
            perf: Mutex::new(PerfLog {
                enabled: false,
                marks: Vec::new(),
                capacity: 4096,
            }),
            frame_deadline,
            retain,
        })
    }

    pub fn set_perf_logging(&self, enabled: bool) {
        self.perf.lock().unwrap().enabled = enabled;
    }

    pub fn perf_marks(&self) -> Vec<PhaseMark> {
        self.perf.lock().unwrap().marks.clone()
    }

    pub fn mode(&self) -> LoopMode {
        self.state.lock().unwrap().mode
    }

    pub fn set_mode(&self, mode: LoopMode) {
        let mut st = self.state.lock().unwrap();
        st.mode = mode;
        self.mode_cond.notify_all();
    }

    /// `mark` is cheap no-op bookkeeping when performance logging is
    /// disabled; always call it at the named phase boundary.
    fn mark(&self, label: &'static str) {
        self.perf.lock().unwrap().record(label);
    }

    /// Logs the wall-clock span of the just-finished iteration, from its
    /// `wait_frame` mark to `label`, in human-readable form.
    fn log_cycle_time(&self, label: &'static str) {
        let perf = self.perf.lock().unwrap();
        if !perf.enabled {
            return;
        }
        let start = perf.marks.iter().rev().find(|m| m.label == "wait_frame");
        let end = perf.marks.iter().rev().find(|m| m.label == label);
        if let (Some(start), Some(end)) = (start, end) {
            if end.at >= start.at {
                log::debug!(
                    "loop iteration took {}",
                    humantime::format_duration(end.at - start.at)
                );
            }
        }
    }

    /// Degrades to `LISTEN` and logs the triggering error (spec.md §7
    /// "the loop engine only ever degrades to LISTEN").
    fn degrade(&self, context: &str, e: &AoError) {
        log_error(format!("loop engine: {context} failed, degrading to LISTEN"), e);
        self.set_mode(LoopMode::Listen);
    }

    /// `open_loop` (spec.md §4.7): measure and compute diagnostics, no
    /// actuation.
    fn open_iteration(&self, wfs: &ShwfsDevice, telescope: &Telescope, ring: &SharedFrameRing) -> AoResult<()> {
        let seen = self.state.lock().unwrap().last_seen_frame;
        self.mark("wait_frame");
        let frame = ring
            .next(seen, true, Some(self.frame_deadline))
            .ok_or_else(|| AoError::Timeout { device: "frame ring".into() })?;
        self.state.lock().unwrap().last_seen_frame = Some(frame.id);

        self.mark("measure");
        let info = wfs.measure(&frame)?;
        self.mark("reconstruct");
        let act = wfs.comp_ctrlcmd(&info.wfamp)?;
        let shift_est = wfs.comp_shift(&act)?;
        let mut ttx = 0.0;
        let mut tty = 0.0;
        wfs.comp_tt(&shift_est, &mut ttx, &mut tty);
        self.mark("telescope");
        self.log_cycle_time("telescope");
        telescope.set_track_offset(ttx, tty);
        Ok(())
    }

    /// `closed_loop` (spec.md §4.7): adds `WFC.update_control` and
    /// `WFC.actuate` between `comp_ctrlcmd` and `comp_shift`; `comp_tt`
    /// then sees the full accumulated wavefront rather than just the
    /// residual.
    fn closed_iteration(
        &self,
        wfs: &ShwfsDevice,
        wfc: &WfcDevice,
        telescope: &Telescope,
        ring: &SharedFrameRing,
    ) -> AoResult<()> {
        let seen = self.state.lock().unwrap().last_seen_frame;
        self.mark("wait_frame");
        let frame = ring
            .next(seen, true, Some(self.frame_deadline))
            .ok_or_else(|| AoError::Timeout { device: "frame ring".into() })?;
        self.state.lock().unwrap().last_seen_frame = Some(frame.id);

        self.mark("measure");
        let info = wfs.measure(&frame)?;
        self.mark("reconstruct");
        let act = wfs.comp_ctrlcmd(&info.wfamp)?;
        wfc.update_control(&act, self.retain)?;
        wfc.ctrl_apply_actmap();
        self.mark("actuate");
        wfc.actuate()?;

        let full: Vec<f64> = info
            .raw_shift
            .iter()
            .zip(wfs.comp_shift(&act)?.iter())
            .map(|(r, c)| r + c)
            .collect();
        let mut ttx = 0.0;
        let mut tty = 0.0;
        wfs.comp_tt(&full, &mut ttx, &mut tty);
        self.mark("telescope");
        self.log_cycle_time("telescope");
        telescope.set_track_offset(ttx, tty);
        Ok(())
    }

    /// `calib()` (spec.md §4.5.3, §4.5.5), invoked from the `CAL`
    /// branch of the main dispatch loop and always returning to
    /// `LISTEN` afterwards.
    pub fn calib(
        &self,
        request: CalibRequest,
        wfs: &ShwfsDevice,
        wfc: &WfcDevice,
        ring: &SharedFrameRing,
    ) -> AoResult<()> {
        match request {
            CalibRequest::Zero => {
                wfc.reset()?;
                let latest = ring.latest_id();
                let frame = ring
                    .next(latest, true, Some(self.frame_deadline))
                    .ok_or_else(|| AoError::Timeout { device: "frame ring".into() })?;
                wfs.set_reference_from_frame(&frame)
            }
            CalibRequest::Influence { amplitudes, cutoff } => {
                wfs.calib_influence(wfc, ring, &amplitudes, cutoff).map(|_| ())
            }
        }
    }

    /// Main dispatch loop (spec.md §4.7 pseudocode). Runs on the
    /// calling thread until `mode` reaches `SHUTDOWN`.
    pub fn run(
        self: &Arc<Self>,
        wfs: &ShwfsDevice,
        wfc: &WfcDevice,
        telescope: &Telescope,
        ring: &SharedFrameRing,
    ) {
        loop {
            let mode = {
                let mut st = self.state.lock().unwrap();
                while st.mode == LoopMode::Listen {
                    st = self.mode_cond.wait(st).unwrap();
                }
                st.mode
            };
            match mode {
                LoopMode::Listen => continue,
                LoopMode::Open => {
                    while self.mode() == LoopMode::Open {
                        if let Err(e) = self.open_iteration(wfs, telescope, ring) {
                            self.degrade("open_loop", &e);
                        }
                    }
                }
                LoopMode::Closed => {
                    while self.mode() == LoopMode::Closed {
                        if let Err(e) = self.closed_iteration(wfs, wfc, telescope, ring) {
                            self.degrade("closed_loop", &e);
                        }
                    }
                }
                LoopMode::Cal => {
                    // The session layer populates the calibration
                    // request and calls `calib` directly; by the time
                    // mode reaches CAL here there is nothing left to
                    // do but return to LISTEN.
                    self.set_mode(LoopMode::Listen);
                }
                LoopMode::Shutdown => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::wfc::{ActuationMap, Gain, WfcDriver};
    use crate::frame::{Depth, Frame};
    use crate::ring::FrameRing;
    use crate::shift::ShiftEngine;
    use crate::wfs::mla::{MlaGeometry, OverlapPolicy, Subimage};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullDriver(usize);
    impl WfcDriver for NullDriver {
        fn dm_actuate(&mut self, _c: &[f64]) -> AoResult<()> {
            Ok(())
        }
        fn n_actuators(&self) -> usize {
            self.0
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn make_wfs() -> ShwfsDevice {
        let engine = ShiftEngine::new(2);
        let wfs = ShwfsDevice::new("wfs0", "cam0", engine);
        let mut geom = MlaGeometry::empty();
        geom.add(Subimage::new(0, 0, 8, 8).unwrap(), OverlapPolicy::Reject).unwrap();
        wfs.set_geometry(geom, 8, 8).unwrap();
        wfs
    }

    #[test]
    fn open_loop_times_out_and_degrades_to_listen() {
        let loop_engine = LoopEngine::new(Duration::from_millis(50), 1.0);
        let wfs = make_wfs();
        let wfc = WfcDevice::new("wfc0", 1, Box::new(NullDriver(1)));
        wfc.set_actmap(ActuationMap::identity(1));
        wfc.set_gain(Gain { p: 1.0, i: 0.0, d: 0.0 });
        let telescope = Telescope::new("tel0");
        let ring = Arc::new(FrameRing::new(4));

        loop_engine.set_mode(LoopMode::Open);
        let stop = Arc::new(AtomicBool::new(false));
        let (le, stop2) = (loop_engine.clone(), stop.clone());
        let handle = std::thread::spawn(move || {
            while !stop2.load(Ordering::SeqCst) {
                if le.mode() == LoopMode::Listen {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        // No frames are ever queued, so the real iteration would block;
        // exercise the timeout path directly instead of via `run`.
        let err = loop_engine
            .open_iteration(&wfs, &telescope, &ring)
            .unwrap_err();
        assert!(matches!(err, AoError::Timeout { .. }));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn closed_iteration_without_a_reconstructor_is_a_calibration_error() {
        // comp_ctrlcmd requires a calibrated reconstructor; exercising
        // that failure path confirms closed_iteration surfaces it
        // rather than panicking (spec.md §7 "calibration errors").
        let loop_engine = LoopEngine::new(Duration::from_secs(2), 1.0);
        let wfs = make_wfs();
        let wfc = WfcDevice::new("wfc0", 1, Box::new(NullDriver(1)));
        wfc.set_actmap(ActuationMap::identity(1));
        wfc.set_gain(Gain { p: 1.0, i: 0.0, d: 0.0 });
        let telescope = Telescope::new("tel0");
        telescope.set_ttgain(Gain { p: 1.0, i: 0.0, d: 0.0 });
        let ring = Arc::new(FrameRing::new(4));

        let mut data = vec![0u8; 64];
        data[4 * 8 + 4] = 255;
        ring.queue(Frame::new(0, 8, 8, Depth::U8, data.clone()));
        ring.queue(Frame::new(1, 8, 8, Depth::U8, data));

        let err = loop_engine
            .closed_iteration(&wfs, &wfc, &telescope, &ring)
            .unwrap_err();
        assert!(matches!(err, AoError::Calibration { .. }));
    }
}
