//! Correlation (SAD) shift measurement with subpixel parabolic fit
//! (spec.md §4.2).

use crate::frame::Frame;
use crate::wfs::mla::Subimage;

/// Sum-of-absolute-differences minimum over a `+-window` search,
/// comparing the subimage against itself at a zero reference offset,
/// refined to subpixel precision with a 1-D parabolic fit along each
/// axis independently.
pub fn corr_shift(frame: &Frame, rect: &Subimage, window: usize) -> (f64, f64) {
    let w = window as isize;
    let mut best = (0isize, 0isize);
    let mut best_sad = f64::INFINITY;
    let mut sad_at = |dx: isize, dy: isize| -> f64 { sad(frame, rect, dx, dy) };
    for dy in -w..=w {
        for dx in -w..=w {
            let s = sad_at(dx, dy);
            if s < best_sad {
                best_sad = s;
                best = (dx, dy);
            }
        }
    }
    let (bx, by) = best;
    let dx = parabolic_refine(bx, |d| sad_at(d, by));
    let dy = parabolic_refine(by, |d| sad_at(bx, d));
    (dx, dy)
}

fn sad(frame: &Frame, rect: &Subimage, dx: isize, dy: isize) -> f64 {
    let w = (rect.tx - rect.lx) as isize;
    let h = (rect.ty - rect.ly) as isize;
    let mut acc = 0.0;
    for j in 0..h {
        for i in 0..w {
            let x0 = rect.lx as isize + i;
            let y0 = rect.ly as isize + j;
            let x1 = x0 + dx;
            let y1 = y0 + dy;
            if x1 < 0 || y1 < 0 || x1 as usize >= frame.width || y1 as usize >= frame.height {
                acc += frame.pixel(x0 as usize, y0 as usize);
                continue;
            }
            acc += (frame.pixel(x0 as usize, y0 as usize) - frame.pixel(x1 as usize, y1 as usize)).abs();
        }
    }
    acc
}

/// Fits a parabola through `(best-1, best, best+1)` of `f` and returns
/// the location of its minimum, clamped to `[best-1, best+1]`.
fn parabolic_refine(best: isize, mut f: impl FnMut(isize) -> f64) -> f64 {
    let y0 = f(best - 1);
    let y1 = f(best);
    let y2 = f(best + 1);
    let denom = y0 - 2.0 * y1 + y2;
    if denom.abs() < 1e-12 {
        return best as f64;
    }
    let delta = 0.5 * (y0 - y2) / denom;
    best as f64 + delta.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Depth;
    use approx::assert_abs_diff_eq;

    #[test]
    fn zero_shift_on_uniform_frame() {
        let frame = Frame::new(0, 8, 8, Depth::U8, vec![50u8; 64]);
        let rect = Subimage {
            lx: 1,
            ly: 1,
            tx: 5,
            ty: 5,
        };
        let (dx, dy) = corr_shift(&frame, &rect, 2);
        assert_abs_diff_eq!(dx, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dy, 0.0, epsilon = 1e-6);
    }
}
