//! Centre-of-gravity shift measurement (spec.md §4.2).

use crate::frame::Frame;
use crate::wfs::mla::Subimage;

/// Intensity-weighted centroid of `rect` minus the rectangle centre.
/// Pixels below `mini` are excluded. Returns `(0,0)` when the weighted
/// sum of intensities is non-positive (dark subimage).
pub fn cog_shift(frame: &Frame, rect: &Subimage, mini: f64) -> (f64, f64) {
    let mut s = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for j in rect.ly..rect.ty {
        for i in rect.lx..rect.tx {
            let p = frame.pixel(i, j);
            if p < mini {
                continue;
            }
            s += p;
            vx += p * i as f64;
            vy += p * j as f64;
        }
    }
    if s <= 0.0 {
        return (0.0, 0.0);
    }
    let cx = (rect.lx + rect.tx) as f64 / 2.0;
    let cy = (rect.ly + rect.ty) as f64 / 2.0;
    (vx / s - cx, vy / s - cy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Depth;
    use approx::assert_abs_diff_eq;

    #[test]
    fn dark_subimage_returns_zero() {
        let frame = Frame::new(0, 4, 4, Depth::U8, vec![0u8; 16]);
        let rect = Subimage {
            lx: 0,
            ly: 0,
            tx: 4,
            ty: 4,
        };
        let (dx, dy) = cog_shift(&frame, &rect, 1.0);
        assert_eq!((dx, dy), (0.0, 0.0));
    }

    #[test]
    fn centred_spot_has_zero_shift() {
        let mut data = vec![0u8; 16];
        data[2 * 4 + 2] = 100; // centre of a 4x4 rect is (2,2)
        let frame = Frame::new(0, 4, 4, Depth::U8, data);
        let rect = Subimage {
            lx: 0,
            ly: 0,
            tx: 4,
            ty: 4,
        };
        let (dx, dy) = cog_shift(&frame, &rect, 1.0);
        assert_abs_diff_eq!(dx, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dy, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn threshold_excludes_background() {
        let mut data = vec![5u8; 16];
        data[1 * 4 + 3] = 200;
        let frame = Frame::new(0, 4, 4, Depth::U8, data);
        let rect = Subimage {
            lx: 0,
            ly: 0,
            tx: 4,
            ty: 4,
        };
        let (dx, dy) = cog_shift(&frame, &rect, 50.0);
        assert_abs_diff_eq!(dx, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dy, -1.0, epsilon = 1e-9);
    }
}
