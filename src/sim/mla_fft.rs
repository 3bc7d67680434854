//! Per-subimage microlens focal-spot imaging by 2x zero-padded FFT
//! (spec.md §4.6 step 5; grounded on
//! `examples/original_source/mods/simulcam.cc` `simul_wfs`, using
//! `rustfft` in place of FFTW per `examples/other_examples/`'s crate
//! choices for spectral work).

use num_complex::Complex64;
use rustfft::FftPlanner;

use crate::wfs::mla::Subimage;

/// Replaces the pixels inside each subimage rectangle of `wave`
/// (`w x h`, row-major) with the power spectrum of its 2x zero-padded
/// Fraunhofer diffraction pattern. Subimages whose telescope-aperture
/// fill fraction is below `telapt_fill` are zeroed instead (and left
/// untouched when `telapt` is `None`). Matches the original's behaviour
/// of leaving inter-subimage pixels as whatever `wave` already held.
pub fn apply_mla_imaging(
    wave: &mut [f64],
    w: usize,
    h: usize,
    rects: &[Subimage],
    telapt: Option<&[f64]>,
    telapt_fill: f64,
    mlafac: f64,
) {
    let mut planner = FftPlanner::<f64>::new();
    for rect in rects {
        let sx = rect.width();
        let sy = rect.height();
        if sx == 0 || sy == 0 {
            continue;
        }

        if let Some(mask) = telapt {
            let mut sum = 0.0;
            for j in rect.ly..rect.ty {
                for i in rect.lx..rect.tx {
                    sum += mask[j * w + i];
                }
            }
            if sum < telapt_fill * (sx * sy) as f64 {
                for j in rect.ly..rect.ty {
                    for i in rect.lx..rect.tx {
                        wave[j * w + i] = 0.0;
                    }
                }
                continue;
            }
        }

        let (bw, bh) = (sx * 2, sy * 2);
        let mut buf = vec![Complex64::new(0.0, 0.0); bw * bh];
        let off_x = sx / 2;
        let off_y = sy / 2;
        for j in 0..sy {
            for i in 0..sx {
                let phi = wave[(rect.ly + j) * w + (rect.lx + i)] * mlafac;
                buf[(j + off_y) * bw + (i + off_x)] = Complex64::new(phi.cos(), phi.sin());
            }
        }

        fft2d(&mut buf, bw, bh, &mut planner);
        fftshift2d(&mut buf, bw, bh);

        let crop_x0 = (bw - sx) / 2;
        let crop_y0 = (bh - sy) / 2;
        for j in 0..sy {
            for i in 0..sx {
                let c = buf[(crop_y0 + j) * bw + (crop_x0 + i)];
                wave[(rect.ly + j) * w + (rect.lx + i)] = c.norm_sqr();
            }
        }
    }
}

fn fft2d(buf: &mut [Complex64], w: usize, h: usize, planner: &mut FftPlanner<f64>) {
    let row_fft = planner.plan_fft_forward(w);
    for row in buf.chunks_mut(w) {
        row_fft.process(row);
    }
    transpose(buf, w, h);
    let col_fft = planner.plan_fft_forward(h);
    for row in buf.chunks_mut(h) {
        col_fft.process(row);
    }
    transpose(buf, h, w);
}

fn transpose(buf: &mut [Complex64], w: usize, h: usize) {
    let mut out = vec![Complex64::new(0.0, 0.0); w * h];
    for j in 0..h {
        for i in 0..w {
            out[i * h + j] = buf[j * w + i];
        }
    }
    buf.copy_from_slice(&out);
}

/// Swaps quadrants so the zero-frequency component lands at the centre.
fn fftshift2d(buf: &mut [Complex64], w: usize, h: usize) {
    let hw = w / 2;
    let hh = h / 2;
    let mut out = vec![Complex64::new(0.0, 0.0); w * h];
    for j in 0..h {
        let sj = (j + hh) % h;
        for i in 0..w {
            let si = (i + hw) % w;
            out[sj * w + si] = buf[j * w + i];
        }
    }
    buf.copy_from_slice(&out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wfs::mla::Subimage;

    #[test]
    fn flat_wavefront_produces_a_single_central_peak() {
        let w = 16;
        let h = 16;
        let mut wave = vec![0.0; w * h];
        let rects = vec![Subimage::new(0, 0, 8, 8).unwrap()];
        apply_mla_imaging(&mut wave, w, h, &rects, None, 0.7, 1.0);
        // A flat (zero-phase) wavefront diffracts to an Airy-like peak
        // at the subimage centre.
        let rect = &rects[0];
        let cx = (rect.lx + rect.tx) / 2;
        let cy = (rect.ly + rect.ty) / 2;
        let centre = wave[cy * w + cx];
        let corner = wave[rect.ly * w + rect.lx];
        assert!(centre > corner);
    }

    #[test]
    fn low_fill_fraction_zeroes_the_subimage() {
        let w = 16;
        let h = 16;
        let mut wave = vec![1.0; w * h];
        let rects = vec![Subimage::new(0, 0, 8, 8).unwrap()];
        let telapt = vec![0.0; w * h]; // aperture excludes everything
        apply_mla_imaging(&mut wave, w, h, &rects, Some(&telapt), 0.7, 1.0);
        for j in 0..8 {
            for i in 0..8 {
                assert_eq!(wave[j * w + i], 0.0);
            }
        }
    }
}
