//! Influence-matrix calibration and the truncated pseudo-inverse
//! reconstructor (spec.md §3 "Influence matrix", "Actuation matrix",
//! §4.5.3, §4.5.4).

use nalgebra::{DMatrix, DVector, SVD};

use crate::error::{AoError, AoResult};

/// Singular-value truncation selector (spec.md §3):
/// - `cutoff < 0`: drop `|cutoff|` smallest singular values;
/// - `cutoff > 1`: keep `cutoff` largest modes;
/// - `0 < cutoff <= 1`: keep the smallest k with cumulative power
///   fraction `>= cutoff`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cutoff(pub f64);

impl Cutoff {
    fn modes_to_keep(self, singvals: &[f64]) -> usize {
        let n = singvals.len();
        if self.0 < 0.0 {
            let drop = (-self.0).round() as usize;
            n.saturating_sub(drop).max(0)
        } else if self.0 > 1.0 {
            (self.0.round() as usize).min(n)
        } else {
            let total: f64 = singvals.iter().map(|s| s * s).sum();
            if total <= 0.0 {
                return n;
            }
            let mut acc = 0.0;
            for (k, s) in singvals.iter().enumerate() {
                acc += s * s;
                if acc / total >= self.0 {
                    return k + 1;
                }
            }
            n
        }
    }
}

/// Result of an SVD-truncated pseudo-inverse, with the diagnostics
/// spec.md §3 requires callers to retain.
#[derive(Debug, Clone)]
pub struct Reconstructor {
    /// `A = M+`, shape `(Nact, 2*Nsubap)`.
    pub actuation_matrix: DMatrix<f64>,
    /// The raw influence matrix this reconstructor was built from.
    pub influence_matrix: DMatrix<f64>,
    pub singular_values: Vec<f64>,
    pub modes_used: usize,
    pub condition: f64,
    pub power_fraction_used: f64,
}

impl Reconstructor {
    /// Builds `A = V * Sigma^-1 * U^T` from the reduced SVD of `m`,
    /// truncated per `cutoff`.
    pub fn from_influence_matrix(m: &DMatrix<f64>, cutoff: Cutoff) -> AoResult<Self> {
        let (rows, cols) = (m.nrows(), m.ncols());
        if rows < cols {
            return Err(AoError::calibration(format!(
                "influence matrix {rows}x{cols} is ill-posed: need 2*Nsubap >= Nact"
            )));
        }
        let svd = SVD::new(m.clone(), true, true);
        let singvals: Vec<f64> = svd.singular_values.iter().cloned().collect();
        if singvals.is_empty() || singvals[0] <= 0.0 {
            return Err(AoError::calibration("influence matrix is singular"));
        }
        let k = cutoff.modes_to_keep(&singvals).max(1);

        let u = svd.u.ok_or_else(|| AoError::calibration("SVD did not produce U"))?;
        let v_t = svd.v_t.ok_or_else(|| AoError::calibration("SVD did not produce V^T"))?;

        let u_k = u.columns(0, k).into_owned();
        let v_k = v_t.rows(0, k).transpose();
        let mut sigma_inv = DMatrix::<f64>::zeros(k, k);
        for i in 0..k {
            sigma_inv[(i, i)] = 1.0 / singvals[i];
        }
        let a = &v_k * &sigma_inv * u_k.transpose();

        let total: f64 = singvals.iter().map(|s| s * s).sum();
        let used: f64 = singvals[..k].iter().map(|s| s * s).sum();
        let condition = singvals[0] / singvals[k - 1];

        Ok(Self {
            actuation_matrix: a,
            influence_matrix: m.clone(),
            singular_values: singvals,
            modes_used: k,
            condition,
            power_fraction_used: if total > 0.0 { used / total } else { 0.0 },
        })
    }

    /// `act = A . shift` (spec.md §4.5.4 `comp_ctrlcmd`).
    pub fn reconstruct(&self, shift: &[f64]) -> Vec<f64> {
        let v = DVector::from_row_slice(shift);
        (&self.actuation_matrix * v).iter().cloned().collect()
    }

    /// `shift_est = M . act` (spec.md §4.5.4 `comp_shift`).
    pub fn estimate_shift(&self, act: &[f64]) -> Vec<f64> {
        let v = DVector::from_row_slice(act);
        (&self.influence_matrix * v).iter().cloned().collect()
    }
}

/// Fits one influence-matrix column from the `(amplitude, shift)`
/// samples collected while pushing a single actuator (spec.md §4.5.3
/// step 3: least-squares linear response across amplitudes, forced
/// through the origin since the influence matrix is linearised around
/// zero via push-pull).
pub fn fit_column(amplitudes: &[f64], shifts: &[Vec<f64>]) -> AoResult<Vec<f64>> {
    if amplitudes.is_empty() || amplitudes.len() != shifts.len() {
        return Err(AoError::calibration("amplitude/shift sample count mismatch"));
    }
    let denom: f64 = amplitudes.iter().map(|a| a * a).sum();
    if denom <= 0.0 {
        return Err(AoError::calibration("degenerate calibration amplitudes"));
    }
    let n = shifts[0].len();
    let mut col = vec![0.0; n];
    for i in 0..n {
        let num: f64 = amplitudes
            .iter()
            .zip(shifts.iter())
            .map(|(a, s)| a * s[i])
            .sum();
        col[i] = num / denom;
    }
    Ok(col)
}

/// Sum of `(dx, dy)` tip-tilt over a shift vector (spec.md §4.5.4
/// `comp_tt`), added to an externally supplied accumulator.
pub fn comp_tt(shift: &[f64], ttx: &mut f64, tty: &mut f64) {
    let mut sx = 0.0;
    let mut sy = 0.0;
    for pair in shift.chunks(2) {
        if let [dx, dy] = pair {
            sx += dx;
            sy += dy;
        }
    }
    *ttx += sx;
    *tty += sy;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn identity_like_influence(n_subap: usize, n_act: usize) -> DMatrix<f64> {
        DMatrix::<f64>::from_fn(2 * n_subap, n_act, |r, c| if r == c { 1.0 } else { 0.0 })
    }

    #[test]
    fn pseudo_inverse_recovers_identity_subset() {
        let m = identity_like_influence(8, 4);
        let recon = Reconstructor::from_influence_matrix(&m, Cutoff(1.0)).unwrap();
        let shift = vec![0.0; 16];
        let mut s = shift.clone();
        s[0] = 1.0;
        let act = recon.reconstruct(&s);
        assert_abs_diff_eq!(act[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn cutoff_integer_keeps_exact_mode_count() {
        let m = identity_like_influence(8, 4);
        let recon = Reconstructor::from_influence_matrix(&m, Cutoff(2.0)).unwrap();
        assert_eq!(recon.modes_used, 2);
    }

    #[test]
    fn cutoff_negative_drops_smallest() {
        let m = identity_like_influence(8, 4);
        let recon = Reconstructor::from_influence_matrix(&m, Cutoff(-1.0)).unwrap();
        assert_eq!(recon.modes_used, 3);
    }

    #[test]
    fn cutoff_fraction_respects_power_threshold() {
        let m = identity_like_influence(8, 4);
        let recon = Reconstructor::from_influence_matrix(&m, Cutoff(0.5)).unwrap();
        let total: f64 = recon.singular_values.iter().map(|s| s * s).sum();
        let used: f64 = recon.singular_values[..recon.modes_used].iter().map(|s| s * s).sum();
        assert!(used / total >= 0.5);
    }

    #[test]
    fn condition_is_monotonic_as_truncation_increases() {
        let m = DMatrix::<f64>::from_row_slice(
            6,
            3,
            &[
                3.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
                0.0,
            ],
        );
        let r3 = Reconstructor::from_influence_matrix(&m, Cutoff(3.0)).unwrap();
        let r2 = Reconstructor::from_influence_matrix(&m, Cutoff(2.0)).unwrap();
        let r1 = Reconstructor::from_influence_matrix(&m, Cutoff(1.0)).unwrap();
        assert!(r1.condition <= r2.condition);
        assert!(r2.condition <= r3.condition);
    }

    #[test]
    fn fit_column_recovers_linear_gain() {
        let amps = vec![-1.0, -0.5, 0.5, 1.0];
        let shifts: Vec<Vec<f64>> = amps.iter().map(|a| vec![2.0 * a, -a]).collect();
        let col = fit_column(&amps, &shifts).unwrap();
        assert_abs_diff_eq!(col[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(col[1], -1.0, epsilon = 1e-9);
    }

    #[test]
    fn comp_tt_sums_pairs() {
        let mut ttx = 0.0;
        let mut tty = 0.0;
        comp_tt(&[1.0, 2.0, 3.0, 4.0], &mut ttx, &mut tty);
        assert_abs_diff_eq!(ttx, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(tty, 6.0, epsilon = 1e-9);
    }
}
