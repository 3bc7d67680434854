//! Telescope mount device (spec.md §4 data-flow diagram, §6 commands).
//!
//! Not given its own component entry in spec.md §4 beyond the
//! data-flow sketch `Telescope.set_track_offset <- tip/tilt component
//! of shifts`; grounded on the command list in spec.md §6 and the
//! tip-tilt accumulation in spec.md §4.5.4 `comp_tt` (SPEC_FULL.md
//! supplement #6).

use std::sync::Mutex;

use crate::device::wfc::Gain;
use crate::device::{CommandLock, Device, DeviceStatus};

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackOffset {
    pub ttx: f64,
    pub tty: f64,
}

struct TelescopeState {
    ccd_ang: f64,
    scalefac: (f64, f64),
    ttgain: Gain,
    track: TrackOffset,
    pix_shift: (f64, f64),
    status: DeviceStatus,
}

pub struct Telescope {
    name: String,
    state: Mutex<TelescopeState>,
    cmd_lock: CommandLock,
}

impl Telescope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TelescopeState {
                ccd_ang: 0.0,
                scalefac: (1.0, 1.0),
                ttgain: Gain::default(),
                track: TrackOffset::default(),
                pix_shift: (0.0, 0.0),
                status: DeviceStatus { online: true, ..Default::default() },
            }),
            cmd_lock: Mutex::new(()),
        }
    }

    pub fn set_ccd_ang(&self, ang: f64) {
        self.state.lock().unwrap().ccd_ang = ang;
    }
    pub fn set_scalefac(&self, fx: f64, fy: f64) {
        self.state.lock().unwrap().scalefac = (fx, fy);
    }
    pub fn set_ttgain(&self, gain: Gain) {
        self.state.lock().unwrap().ttgain = gain;
    }

    /// Rotates `(ttx, tty)` by the CCD mounting angle, scales by the
    /// pixel-to-sky calibration, applies the tip-tilt proportional
    /// gain, and accumulates into the tracking offset.
    pub fn set_track_offset(&self, ttx: f64, tty: f64) {
        let _g = self.cmd_lock.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        let (c, s) = (st.ccd_ang.cos(), st.ccd_ang.sin());
        let rx = ttx * c - tty * s;
        let ry = ttx * s + tty * c;
        let (sx, sy) = st.scalefac;
        let p = st.ttgain.p;
        st.track.ttx += p * rx * sx;
        st.track.tty += p * ry * sy;
        st.pix_shift = (ttx, tty);
    }

    pub fn track(&self) -> TrackOffset {
        self.state.lock().unwrap().track
    }
    pub fn pix_shift(&self) -> (f64, f64) {
        self.state.lock().unwrap().pix_shift
    }
    pub fn scalefac(&self) -> (f64, f64) {
        self.state.lock().unwrap().scalefac
    }
}

impl Device for Telescope {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &'static str {
        "telescope"
    }
    fn commands(&self) -> Vec<String> {
        vec![
            "get tel_track".into(),
            "get tel_units".into(),
            "get pixshift".into(),
            "set ccd_ang".into(),
            "set scalefac".into(),
            "set ttgain".into(),
        ]
    }
    fn status(&self) -> DeviceStatus {
        self.state.lock().unwrap().status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_track_offset() {
        let tel = Telescope::new("tel0");
        tel.set_ttgain(Gain { p: 1.0, i: 0.0, d: 0.0 });
        tel.set_track_offset(1.0, 2.0);
        tel.set_track_offset(1.0, 2.0);
        let t = tel.track();
        assert!((t.ttx - 2.0).abs() < 1e-9);
        assert!((t.tty - 4.0).abs() < 1e-9);
    }
}
