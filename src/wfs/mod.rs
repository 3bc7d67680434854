//! Shack-Hartmann wavefront sensor device (spec.md §4.5).

pub mod basis;
pub mod calib;
pub mod mla;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::wfc::WfcDevice;
use crate::device::{CommandLock, Device, DeviceStatus};
use crate::error::{AoError, AoResult};
use crate::frame::Frame;
use crate::ring::SharedFrameRing;
use crate::shift::{ShiftEngine, ShiftMethod};

pub use basis::{Basis, BasisKind};
pub use calib::{Cutoff, Reconstructor};
pub use mla::{ApertureShape, MlaGeometry, OverlapPolicy, Subimage};

/// Result of [`ShwfsDevice::measure`] (spec.md §4.5.2).
#[derive(Debug, Clone)]
pub struct WfInfo {
    /// Residual modes to correct, in the sensor's configured basis.
    pub wfamp: Vec<f64>,
    /// Cumulative applied correction + residual, used for telescope
    /// tip-tilt off-load; `None` in open loop where there is no
    /// applied correction yet.
    pub wf_full: Option<Vec<f64>>,
    pub raw_shift: Vec<f64>,
}

struct ShwfsState {
    geometry: MlaGeometry,
    reference: Vec<f64>,
    basis: Basis,
    reconstructor: Option<Reconstructor>,
    shift_mini: f64,
    maxshift: f64,
    camera_name: String,
    wfc_name: Option<String>,
    status: DeviceStatus,
    geometry_valid: bool,
}

/// Owns microlens-array geometry, reference vector, influence matrix
/// and its pseudo-inverse, basis transforms, and the reconstructor
/// (spec.md §4.5).
pub struct ShwfsDevice {
    name: String,
    state: Mutex<ShwfsState>,
    cmd_lock: CommandLock,
    shift_engine: Arc<ShiftEngine>,
}

impl ShwfsDevice {
    pub fn new(name: impl Into<String>, camera_name: impl Into<String>, shift_engine: Arc<ShiftEngine>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ShwfsState {
                geometry: MlaGeometry::empty(),
                reference: Vec::new(),
                basis: Basis::sensor(0),
                reconstructor: None,
                shift_mini: 0.0,
                maxshift: 50.0,
                camera_name: camera_name.into(),
                wfc_name: None,
                status: DeviceStatus { online: true, ..Default::default() },
                geometry_valid: false,
            }),
            cmd_lock: Mutex::new(()),
            shift_engine,
        }
    }

    pub fn set_geometry(&self, geom: MlaGeometry, frame_w: usize, frame_h: usize) -> AoResult<()> {
        let _g = self.cmd_lock.lock().unwrap();
        geom.validate_against(frame_w, frame_h)?;
        let mut st = self.state.lock().unwrap();
        let n = geom.len();
        st.reference = vec![0.0; 2 * n];
        st.basis = Basis::sensor(n);
        st.reconstructor = None;
        st.geometry = geom;
        st.geometry_valid = true;
        Ok(())
    }

    pub fn geometry(&self) -> MlaGeometry {
        self.state.lock().unwrap().geometry.clone()
    }

    /// In-place geometry edit (`mla add`/`mla del`): invalidates the
    /// reference vector and any existing reconstructor, since both are
    /// indexed by subimage.
    pub fn edit_geometry(&self, f: impl FnOnce(&mut MlaGeometry) -> AoResult<()>) -> AoResult<()> {
        let mut st = self.state.lock().unwrap();
        f(&mut st.geometry)?;
        let n = st.geometry.len();
        st.reference = vec![0.0; 2 * n];
        st.basis = Basis::sensor(n);
        st.reconstructor = None;
        Ok(())
    }

    pub fn set_shift_params(&self, mini: f64, maxshift: f64) {
        let mut st = self.state.lock().unwrap();
        st.shift_mini = mini;
        st.maxshift = maxshift;
    }

    pub fn set_basis(&self, basis: Basis) {
        self.state.lock().unwrap().basis = basis;
    }

    pub fn set_wfc_name(&self, wfc: impl Into<String>) {
        self.state.lock().unwrap().wfc_name = Some(wfc.into());
    }

    pub fn reconstructor(&self) -> Option<Reconstructor> {
        self.state.lock().unwrap().reconstructor.clone()
    }

    pub fn reference_vector(&self) -> Vec<f64> {
        self.state.lock().unwrap().reference.clone()
    }

    pub fn camera_name(&self) -> String {
        self.state.lock().unwrap().camera_name.clone()
    }

    pub fn wfc_name(&self) -> Option<String> {
        self.state.lock().unwrap().wfc_name.clone()
    }

    pub fn n_modes(&self) -> usize {
        self.state.lock().unwrap().basis.n_modes
    }

    pub fn basis_kind(&self) -> BasisKind {
        self.state.lock().unwrap().basis.kind
    }

    /// Writes the reference vector as a single-column CSV (spec.md §6
    /// "Persisted artifacts": "Reference vector, singular-value
    /// diagnostics: CSV"), one `dx, dy` pair per subaperture.
    pub fn store_reference_csv<P: AsRef<std::path::Path>>(&self, path: P) -> AoResult<()> {
        let reference = self.reference_vector();
        let mut f = std::fs::File::create(path)?;
        use std::io::Write as _;
        writeln!(f, "# ref_dx, ref_dy")?;
        for pair in reference.chunks(2) {
            if let [dx, dy] = pair {
                writeln!(f, "{dx}, {dy}")?;
            }
        }
        Ok(())
    }

    /// Writes the current reconstructor's singular-value spectrum and
    /// usage diagnostics as CSV (spec.md §6), or errors if nothing has
    /// been calibrated yet.
    pub fn store_singvals_csv<P: AsRef<std::path::Path>>(&self, path: P) -> AoResult<()> {
        let recon = self
            .reconstructor()
            .ok_or_else(|| AoError::calibration("no reconstructor calibrated"))?;
        let mut f = std::fs::File::create(path)?;
        use std::io::Write as _;
        writeln!(f, "# singular_value")?;
        for s in &recon.singular_values {
            writeln!(f, "{s}")?;
        }
        writeln!(f, "# modes_used, condition, power_fraction_used")?;
        writeln!(f, "# {}, {}, {}", recon.modes_used, recon.condition, recon.power_fraction_used)?;
        Ok(())
    }

    fn raw_shift(&self, frame: &Frame) -> AoResult<Vec<f64>> {
        let (rects, mini, maxshift, n) = {
            let st = self.state.lock().unwrap();
            if !st.geometry_valid {
                return Err(AoError::calibration("mla geometry is invalid for the current frame"));
            }
            (
                Arc::new(st.geometry.rects().to_vec()),
                st.shift_mini,
                st.maxshift,
                st.geometry.len(),
            )
        };
        if n == 0 {
            return Err(AoError::calibration("no mla subimages configured"));
        }
        let pairs = self.shift_engine.dispatch(Arc::new(frame.clone()), rects, ShiftMethod::Cog, mini, maxshift);
        let mut out = Vec::with_capacity(2 * n);
        for (dx, dy) in pairs {
            out.push(dx);
            out.push(dy);
        }
        Ok(out)
    }

    /// `measure(frame) -> wf_info` (spec.md §4.5.2).
    pub fn measure(&self, frame: &Frame) -> AoResult<WfInfo> {
        let raw = self.raw_shift(frame)?;
        let residual: Vec<f64> = {
            let st = self.state.lock().unwrap();
            if st.reference.len() != raw.len() {
                return Err(AoError::calibration("reference vector length mismatch"));
            }
            raw.iter().zip(&st.reference).map(|(m, r)| m - r).collect()
        };
        let wfamp = {
            let st = self.state.lock().unwrap();
            st.basis.to_modal(&residual)
        };
        Ok(WfInfo {
            wfamp,
            wf_full: None,
            raw_shift: raw,
        })
    }

    /// `set_reference(frame)` (spec.md §4.5.5): measures on the
    /// current optical state and stores the result as the new zero.
    pub fn set_reference_from_frame(&self, frame: &Frame) -> AoResult<()> {
        let raw = self.raw_shift(frame)?;
        self.state.lock().unwrap().reference = raw;
        Ok(())
    }

    /// `calib_offset(x, y)` (spec.md §4.5.5): adds a constant offset to
    /// every entry of the reference vector.
    pub fn calib_offset(&self, x: f64, y: f64) -> AoResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.reference.is_empty() {
            return Err(AoError::calibration("no reference vector to offset"));
        }
        for pair in st.reference.chunks_mut(2) {
            pair[0] += x;
            pair[1] += y;
        }
        Ok(())
    }

    /// `comp_ctrlcmd` (spec.md §4.5.4): `act = A . shift`.
    pub fn comp_ctrlcmd(&self, shift: &[f64]) -> AoResult<Vec<f64>> {
        let st = self.state.lock().unwrap();
        let recon = st
            .reconstructor
            .as_ref()
            .ok_or_else(|| AoError::calibration("no reconstructor calibrated"))?;
        Ok(recon.reconstruct(shift))
    }

    /// `comp_shift` (spec.md §4.5.4): `shift_est = M . act`, diagnostic.
    pub fn comp_shift(&self, act: &[f64]) -> AoResult<Vec<f64>> {
        let st = self.state.lock().unwrap();
        let recon = st
            .reconstructor
            .as_ref()
            .ok_or_else(|| AoError::calibration("no reconstructor calibrated"))?;
        Ok(recon.estimate_shift(act))
    }

    /// `comp_tt` (spec.md §4.5.4).
    pub fn comp_tt(&self, shift: &[f64], ttx: &mut f64, tty: &mut f64) {
        calib::comp_tt(shift, ttx, tty)
    }

    /// `calib svd <cutoff>`: re-truncates the already-measured influence
    /// matrix with a new cutoff, without re-running the push-pull
    /// sequence on hardware.
    pub fn recompute_svd(&self, cutoff: Cutoff) -> AoResult<Reconstructor> {
        let mut st = self.state.lock().unwrap();
        let influence = st
            .reconstructor
            .as_ref()
            .ok_or_else(|| AoError::calibration("no influence matrix measured yet"))?
            .influence_matrix
            .clone();
        let recon = Reconstructor::from_influence_matrix(&influence, cutoff)?;
        st.reconstructor = Some(recon.clone());
        Ok(recon)
    }

    /// Influence-matrix calibration (spec.md §4.5.3): for each
    /// actuator and each push-pull amplitude, set the WFC to zero,
    /// set the actuator, actuate, wait for a fresh frame (skipping
    /// one stale frame), measure, and fit a per-actuator column.
    pub fn calib_influence(
        &self,
        wfc: &WfcDevice,
        ring: &SharedFrameRing,
        amplitudes: &[f64],
        cutoff: Cutoff,
    ) -> AoResult<Reconstructor> {
        // Calibrated per virtual mode, not per real actuator: the
        // reconstructor this produces feeds directly into
        // `WfcDevice::update_control`, which operates in the WFC's
        // virtual-mode space and expands through the actuation map on
        // `actuate` (spec.md §4.4, §4.5.4).
        let n_virt = wfc.n_virt();
        let n_subap = self.state.lock().unwrap().geometry.len();
        if n_subap == 0 {
            return Err(AoError::calibration("no mla geometry configured"));
        }
        let mut columns = Vec::with_capacity(n_virt);
        for j in 0..n_virt {
            wfc.reset()?;
            let mut shifts = Vec::with_capacity(amplitudes.len());
            for &amp in amplitudes {
                wfc.set_target_single(j, amp)?;
                wfc.actuate()?;
                let latest = ring.latest_id();
                // Skip one frame to avoid stale data still in flight
                // when the actuator moved.
                let _ = ring.next(latest, true, Some(Duration::from_secs(2)));
                let fresh = ring
                    .next(latest, true, Some(Duration::from_secs(2)))
                    .ok_or_else(|| AoError::calibration("timed out waiting for a fresh calibration frame"))?;
                let raw = self.raw_shift(&fresh)?;
                shifts.push(raw);
            }
            let col = calib::fit_column(amplitudes, &shifts)?;
            columns.push(col);
        }
        wfc.reset()?;

        let rows = 2 * n_subap;
        let m = nalgebra::DMatrix::<f64>::from_fn(rows, n_virt, |r, c| columns[c][r]);
        let recon = Reconstructor::from_influence_matrix(&m, cutoff)?;
        self.state.lock().unwrap().reconstructor = Some(recon.clone());
        Ok(recon)
    }
}

impl Device for ShwfsDevice {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &'static str {
        "shwfs"
    }
    fn commands(&self) -> Vec<String> {
        vec![
            "measuretest".into(),
            "get modes".into(),
            "get basis".into(),
            "get calib".into(),
            "get camera".into(),
            "mla generate".into(),
            "mla find".into(),
            "mla store".into(),
            "mla del".into(),
            "mla add".into(),
            "get mla".into(),
            "set mla".into(),
            "calibrate".into(),
            "calib zero".into(),
            "calib influence".into(),
            "calib offsetvec".into(),
            "calib svd".into(),
            "get shifts".into(),
            "get singvals".into(),
            "get svdcondition".into(),
            "get svdusage".into(),
            "get refvec".into(),
        ]
    }
    fn status(&self) -> DeviceStatus {
        self.state.lock().unwrap().status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::wfc::{ActuationMap, Gain, WfcDevice, WfcDriver};
    use crate::frame::Depth;
    use crate::ring::FrameRing;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn make_wfs(n_subap: usize) -> ShwfsDevice {
        let engine = ShiftEngine::new(2);
        let wfs = ShwfsDevice::new("wfs0", "cam0", engine);
        let mut geom = MlaGeometry::empty();
        for i in 0..n_subap {
            geom.add(Subimage::new(i * 8, 0, i * 8 + 8, 8).unwrap(), OverlapPolicy::Reject)
                .unwrap();
        }
        wfs.set_geometry(geom, n_subap * 8, 8).unwrap();
        wfs
    }

    #[test]
    fn measure_subtracts_reference() {
        let wfs = make_wfs(2);
        let mut data = vec![0u8; 16 * 8];
        data[4 * 16 + 4] = 255;
        data[4 * 16 + 12] = 255;
        let flat = Frame::new(0, 16, 8, Depth::U8, data);
        wfs.set_reference_from_frame(&flat).unwrap();
        let info = wfs.measure(&flat).unwrap();
        for v in info.wfamp {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn calib_offset_shifts_reference() {
        let wfs = make_wfs(1);
        wfs.calib_offset(0.5, -0.25).unwrap();
        let r = wfs.reference_vector();
        assert_abs_diff_eq!(r[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(r[1], -0.25, epsilon = 1e-9);
    }

    #[test]
    fn calib_influence_recovers_linear_gain() {
        let wfs = make_wfs(1);
        let wfc = Arc::new(WfcDevice::new("wfc0", 1, Box::new(NullDriver(1))));
        wfc.set_actmap(ActuationMap::identity(1));
        wfc.set_gain(Gain { p: 1.0, i: 0.0, d: 0.0 });
        let ring = Arc::new(FrameRing::new(8));
        let next_id = AtomicUsize::new(0);

        // Background "hardware": reacts to the wfc's current target by
        // queuing two frames whose centroid encodes a known gain of 3
        // pixels of shift per unit of actuation, at subaperture centre
        // (4, 4) in an 8x8 frame.
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (wfc_bg, ring_bg, stop_bg) = (wfc.clone(), ring.clone(), stop.clone());
        let producer = std::thread::spawn(move || {
            let mut last = f64::NAN;
            while !stop_bg.load(Ordering::SeqCst) {
                let cur = wfc_bg.target()[0];
                if cur != last {
                    last = cur;
                    for _ in 0..2 {
                        let x = (4.0 + 3.0 * cur).round().clamp(0.0, 7.0) as usize;
                        let mut data = vec![0u8; 64];
                        data[4 * 8 + x] = 255;
                        let id = next_id.fetch_add(1, Ordering::SeqCst) as u64;
                        ring_bg.queue(Frame::new(id, 8, 8, Depth::U8, data));
                    }
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        });

        let recon = wfs
            .calib_influence(&wfc, &ring, &[-1.0, 1.0], Cutoff(1.0))
            .unwrap();
        stop.store(true, Ordering::SeqCst);
        producer.join().unwrap();

        assert_eq!(recon.modes_used, 1);
        // The column's dx entry should recover the 3 px/unit gain.
        assert_abs_diff_eq!(recon.influence_matrix[(0, 0)], 3.0, epsilon = 0.25);
    }

    #[test]
    fn store_reference_csv_round_trips_through_a_file() {
        let wfs = make_wfs(1);
        wfs.calib_offset(0.5, -0.25).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refvec.csv");
        wfs.store_reference_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let data_line = text.lines().find(|l| !l.starts_with('#')).unwrap();
        let fields: Vec<f64> = data_line.split(',').map(|f| f.trim().parse().unwrap()).collect();
        assert_abs_diff_eq!(fields[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(fields[1], -0.25, epsilon = 1e-9);
    }

    #[test]
    fn store_singvals_csv_fails_before_calibration() {
        let wfs = make_wfs(1);
        let dir = tempfile::tempdir().unwrap();
        assert!(wfs.store_singvals_csv(dir.path().join("singvals.csv")).is_err());
    }
}
