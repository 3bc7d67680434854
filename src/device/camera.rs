//! Camera device (spec.md §4.3).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::device::{CommandLock, Device, DeviceStatus};
use crate::error::{AoError, AoResult};
use crate::fits::FitsHeader;
use crate::frame::{Depth, Frame};
use crate::ring::SharedFrameRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMode {
    Off,
    Waiting,
    Single,
    Running,
    Config,
    Error,
}

/// Hardware-agnostic acquisition contract a camera driver implements.
/// A real driver wraps a vendor SDK (Alpao/Andor/FireWire call
/// sequences, explicitly out of scope per spec.md §1); the simulator
/// (`crate::sim`) substitutes a synthetic optical pipeline behind the
/// same trait.
pub trait CameraDriver: Send {
    /// Blocks (with a hardware-imposed timeout) until one frame is
    /// ready, writing pixels into `buf`. Returns `Err(Timeout)` on a
    /// transient read timeout.
    fn acquire(&mut self, buf: &mut [u8], exposure: f64) -> AoResult<()>;
    fn resolution(&self) -> (usize, usize);
    fn depth(&self) -> Depth;
    /// Warms a cooled sensor up to ambient before releasing the driver
    /// handle (spec.md §4.7 shutdown ordering).
    fn warm_up(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CameraSettings {
    pub exposure: f64,
    pub interval: f64,
    pub gain: f64,
    pub offset: f64,
}

#[derive(Debug, Clone)]
pub struct DarkFlat {
    pub sum: Vec<u32>,
    pub n_frames: u32,
    pub exposure: f64,
}

#[derive(Default)]
struct FitsTags {
    observer: String,
    target: String,
    comment: String,
    filename: String,
}

struct CameraState {
    mode: CameraMode,
    settings: CameraSettings,
    dark: Option<DarkFlat>,
    flat: Option<DarkFlat>,
    dark_flat_valid: bool,
    store_n: u32,
    tags: FitsTags,
    status: DeviceStatus,
    timeout_count: u64,
}

/// Threaded camera device: a long-running capture thread feeds the
/// frame ring (spec.md §4.3), plus dark/flat accumulation, store-N
/// persistence, thumbnail/grab network payload preparation.
pub struct CameraDevice {
    name: String,
    ring: SharedFrameRing,
    state: Mutex<CameraState>,
    mode_cond: Condvar,
    cmd_lock: CommandLock,
    next_id: AtomicU32,
    shutdown: AtomicBool,
    driver: Mutex<Box<dyn CameraDriver>>,
    store_dir: Mutex<Option<std::path::PathBuf>>,
}

impl CameraDevice {
    pub fn new(name: impl Into<String>, ring: SharedFrameRing, driver: Box<dyn CameraDriver>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ring,
            state: Mutex::new(CameraState {
                mode: CameraMode::Off,
                settings: CameraSettings::default(),
                dark: None,
                flat: None,
                dark_flat_valid: false,
                store_n: 0,
                tags: FitsTags::default(),
                status: DeviceStatus { online: true, ..Default::default() },
                timeout_count: 0,
            }),
            mode_cond: Condvar::new(),
            cmd_lock: Mutex::new(()),
            next_id: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            driver: Mutex::new(driver),
            store_dir: Mutex::new(None),
        })
    }

    pub fn ring(&self) -> SharedFrameRing {
        self.ring.clone()
    }

    pub fn resolution(&self) -> (usize, usize) {
        self.driver.lock().unwrap().resolution()
    }

    pub fn set_store_dir(&self, dir: std::path::PathBuf) {
        *self.store_dir.lock().unwrap() = Some(dir);
    }

    pub fn set_mode(&self, mode: CameraMode) {
        let mut st = self.state.lock().unwrap();
        st.mode = mode;
        self.mode_cond.notify_all();
    }

    pub fn mode(&self) -> CameraMode {
        self.state.lock().unwrap().mode
    }

    pub fn settings(&self) -> CameraSettings {
        self.state.lock().unwrap().settings
    }

    pub fn depth(&self) -> Depth {
        self.driver.lock().unwrap().depth()
    }

    pub fn filename(&self) -> String {
        self.state.lock().unwrap().tags.filename.clone()
    }

    pub fn fits_tags(&self) -> (String, String, String) {
        let st = self.state.lock().unwrap();
        (st.tags.observer.clone(), st.tags.target.clone(), st.tags.comment.clone())
    }

    /// Changing exposure/gain/offset invalidates dark/flat calibration
    /// (spec.md §4.3).
    pub fn set_exposure(&self, v: f64) {
        let _g = self.cmd_lock.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        st.settings.exposure = v;
        st.dark_flat_valid = false;
    }
    pub fn set_gain(&self, v: f64) {
        let _g = self.cmd_lock.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        st.settings.gain = v;
        st.dark_flat_valid = false;
    }
    pub fn set_offset(&self, v: f64) {
        let _g = self.cmd_lock.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        st.settings.offset = v;
        st.dark_flat_valid = false;
    }
    pub fn set_interval(&self, v: f64) {
        self.state.lock().unwrap().settings.interval = v;
    }
    pub fn set_fits_tags(&self, observer: String, target: String, comment: String) {
        let mut st = self.state.lock().unwrap();
        st.tags.observer = observer;
        st.tags.target = target;
        st.tags.comment = comment;
    }
    pub fn set_filename(&self, filename: String) {
        self.state.lock().unwrap().tags.filename = filename;
    }

    /// `set store <n>`: the processing worker persists the next `n`
    /// frames to disk, decrementing on each success, auto-disabling
    /// and broadcasting `ok store 0` on the frame after the last.
    pub fn set_store(&self, n: u32) {
        self.state.lock().unwrap().store_n = n;
    }

    pub fn timeout_count(&self) -> u64 {
        self.state.lock().unwrap().timeout_count
    }

    /// Runs the capture loop on the calling thread (spawn this in a
    /// dedicated thread per spec.md §5 "one per camera hardware
    /// device").
    pub fn run_capture_loop(self: &Arc<Self>, on_frame: impl Fn(&Arc<Self>, &Frame) + Send) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                let mut driver = self.driver.lock().unwrap();
                driver.warm_up();
                return;
            }
            let mode = {
                let mut st = self.state.lock().unwrap();
                while st.mode != CameraMode::Running && st.mode != CameraMode::Single {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    let (guard, timeout) = self
                        .mode_cond
                        .wait_timeout(st, Duration::from_millis(200))
                        .unwrap();
                    st = guard;
                    if timeout.timed_out() {
                        continue;
                    }
                }
                st.mode
            };

            let one_shot = mode == CameraMode::Single;
            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if self.mode() != CameraMode::Running && !one_shot {
                    break;
                }
                match self.acquire_one() {
                    Ok(frame) => {
                        self.ring.queue(frame.clone());
                        on_frame(self, &frame);
                    }
                    Err(AoError::Timeout { .. }) => {
                        let mut st = self.state.lock().unwrap();
                        st.timeout_count += 1;
                    }
                    Err(e) => {
                        let mut st = self.state.lock().unwrap();
                        st.status.record_error(e.to_string());
                        st.mode = CameraMode::Error;
                        break;
                    }
                }
                if one_shot {
                    break;
                }
            }
            if one_shot {
                self.set_mode(CameraMode::Waiting);
            }
        }
    }

    fn acquire_one(&self) -> AoResult<Frame> {
        let (w, h, depth, exposure) = {
            let st = self.state.lock().unwrap();
            let (w, h) = self.driver.lock().unwrap().resolution();
            (w, h, self.driver.lock().unwrap().depth(), st.settings.exposure)
        };
        let mut buf = vec![0u8; Frame::bytesize(w, h, depth)];
        self.driver.lock().unwrap().acquire(&mut buf, exposure)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(Frame::new(id, w, h, depth, buf))
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.mode_cond.notify_all();
    }

    /// Accumulates `n` successive frames into a running `u32` sum
    /// image (spec.md §4.3 "Dark/flat").
    pub fn accumulate_dark(&self, frames: &[Frame]) {
        let exposure = self.state.lock().unwrap().settings.exposure;
        let df = accumulate(frames);
        let mut st = self.state.lock().unwrap();
        st.dark = Some(DarkFlat {
            exposure,
            ..df
        });
        st.dark_flat_valid = true;
    }
    pub fn accumulate_flat(&self, frames: &[Frame]) {
        let exposure = self.state.lock().unwrap().settings.exposure;
        let df = accumulate(frames);
        let mut st = self.state.lock().unwrap();
        st.flat = Some(DarkFlat {
            exposure,
            ..df
        });
        st.dark_flat_valid = true;
    }

    /// `(raw - dark) * flat`, clamped to the representable pixel range.
    pub fn correct(&self, frame: &Frame) -> AoResult<Vec<f64>> {
        let st = self.state.lock().unwrap();
        if !st.dark_flat_valid {
            return Err(AoError::calibration("dark/flat calibration is stale"));
        }
        let dark = st.dark.as_ref().ok_or_else(|| AoError::calibration("no dark frame"))?;
        let flat = st.flat.as_ref().ok_or_else(|| AoError::calibration("no flat frame"))?;
        let max = (1u64 << frame.depth.bits()) as f64 - 1.0;
        let n = frame.width * frame.height;
        let mut out = vec![0.0; n];
        for i in 0..n {
            let raw = frame.pixel(i % frame.width, i / frame.width);
            let d = dark.sum[i] as f64 / dark.n_frames.max(1) as f64;
            let fl = flat.sum[i] as f64 / flat.n_frames.max(1) as f64;
            out[i] = ((raw - d) * fl).clamp(0.0, max);
        }
        Ok(out)
    }

    /// Downsamples by equal integer steps to 32x32x8 for network
    /// transmission (spec.md §4.3 "Thumbnail").
    pub fn thumbnail(&self, frame: &Frame) -> Vec<u8> {
        let step_x = (frame.width / 32).max(1);
        let step_y = (frame.height / 32).max(1);
        let max = (1u64 << frame.depth.bits()) as f64 - 1.0;
        let mut out = vec![0u8; 32 * 32];
        for ty in 0..32 {
            for tx in 0..32 {
                let x = (tx * step_x).min(frame.width - 1);
                let y = (ty * step_y).min(frame.height - 1);
                let v = frame.pixel(x, y) / max * 255.0;
                out[ty * 32 + tx] = v.clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    /// Crops to `(x1,y1,x2,y2)` with integer subsampling `scale`,
    /// optionally dark/flat corrected (spec.md §4.3 "Grab").
    pub fn grab(&self, frame: &Frame, x1: usize, y1: usize, x2: usize, y2: usize, scale: usize, darkflat: bool) -> AoResult<Vec<u8>> {
        if x2 <= x1 || y2 <= y1 || x2 > frame.width || y2 > frame.height {
            return Err(AoError::protocol("grab", "out-of-range crop rectangle"));
        }
        let scale = scale.max(1);
        let corrected = if darkflat { Some(self.correct(frame)?) } else { None };
        let max = (1u64 << frame.depth.bits()) as f64 - 1.0;
        let mut out = Vec::new();
        let mut y = y1;
        while y < y2 {
            let mut x = x1;
            while x < x2 {
                let v = match &corrected {
                    Some(buf) => buf[y * frame.width + x],
                    None => frame.pixel(x, y),
                };
                out.push((v / max * 255.0).clamp(0.0, 255.0) as u8);
                x += scale;
            }
            y += scale;
        }
        Ok(out)
    }

    pub fn fits_header(&self, frame: &Frame) -> FitsHeader {
        let st = self.state.lock().unwrap();
        FitsHeader {
            devname: self.name.clone(),
            devtype: "camera".into(),
            exptime: st.settings.exposure,
            interval: st.settings.interval,
            gain: st.settings.gain,
            offset: st.settings.offset,
            observer: st.tags.observer.clone(),
            target: st.tags.target.clone(),
            comment: st.tags.comment.clone(),
            timestamp: frame.timestamp,
        }
    }

    /// Called by the post-processing worker after each frame: stores
    /// it if `store_n > 0`, returning the remaining count (and whether
    /// this was the last one, in which case the caller should
    /// broadcast `ok store 0`).
    pub fn maybe_store(&self, frame: &Frame) -> AoResult<Option<u32>> {
        let remaining = {
            let mut st = self.state.lock().unwrap();
            if st.store_n == 0 {
                return Ok(None);
            }
            st.store_n -= 1;
            st.store_n
        };
        let dir = self.store_dir.lock().unwrap().clone().unwrap_or_else(|| std::path::PathBuf::from("."));
        let header = self.fits_header(frame);
        let path = dir.join(format!("{}_{:08}.fits", self.name, frame.id));
        crate::fits::write_fits(&path, frame, &header)?;
        Ok(Some(remaining))
    }
}

fn accumulate(frames: &[Frame]) -> DarkFlat {
    assert!(!frames.is_empty());
    let n = frames[0].width * frames[0].height;
    let mut sum = vec![0u32; n];
    for f in frames {
        for i in 0..n {
            sum[i] += f.pixel(i % f.width, i / f.width) as u32;
        }
    }
    DarkFlat {
        sum,
        n_frames: frames.len() as u32,
        exposure: 0.0,
    }
}

impl Device for CameraDevice {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &'static str {
        "camera"
    }
    fn commands(&self) -> Vec<String> {
        vec![
            "set mode".into(),
            "set exposure".into(),
            "set interval".into(),
            "set gain".into(),
            "set offset".into(),
            "set filename".into(),
            "set fits".into(),
            "set store".into(),
            "get mode".into(),
            "get exposure".into(),
            "get interval".into(),
            "get gain".into(),
            "get offset".into(),
            "get width".into(),
            "get height".into(),
            "get depth".into(),
            "get resolution".into(),
            "get filename".into(),
            "get fits".into(),
            "thumbnail".into(),
            "grab".into(),
            "dark".into(),
            "flat".into(),
        ]
    }
    fn status(&self) -> DeviceStatus {
        self.state.lock().unwrap().status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Depth;

    struct FixedDriver {
        w: usize,
        h: usize,
        value: u8,
    }
    impl CameraDriver for FixedDriver {
        fn acquire(&mut self, buf: &mut [u8], _exposure: f64) -> AoResult<()> {
            buf.fill(self.value);
            Ok(())
        }
        fn resolution(&self) -> (usize, usize) {
            (self.w, self.h)
        }
        fn depth(&self) -> Depth {
            Depth::U8
        }
    }

    #[test]
    fn exposure_change_invalidates_dark_flat() {
        let ring = Arc::new(crate::ring::FrameRing::new(4));
        let cam = CameraDevice::new(
            "cam0",
            ring,
            Box::new(FixedDriver { w: 4, h: 4, value: 10 }),
        );
        let frames: Vec<Frame> = (0..3).map(|i| Frame::new(i, 4, 4, Depth::U8, vec![10; 16])).collect();
        cam.accumulate_dark(&frames);
        cam.accumulate_flat(&frames);
        assert!(cam.state.lock().unwrap().dark_flat_valid);
        cam.set_exposure(0.5);
        assert!(!cam.state.lock().unwrap().dark_flat_valid);
    }

    #[test]
    fn thumbnail_is_32x32() {
        let ring = Arc::new(crate::ring::FrameRing::new(4));
        let cam = CameraDevice::new(
            "cam0",
            ring,
            Box::new(FixedDriver { w: 128, h: 128, value: 200 }),
        );
        let frame = Frame::new(0, 128, 128, Depth::U8, vec![200u8; 128 * 128]);
        let thumb = cam.thumbnail(&frame);
        assert_eq!(thumb.len(), 32 * 32);
    }

    #[test]
    fn grab_rejects_out_of_range() {
        let ring = Arc::new(crate::ring::FrameRing::new(4));
        let cam = CameraDevice::new(
            "cam0",
            ring,
            Box::new(FixedDriver { w: 16, h: 16, value: 1 }),
        );
        let frame = Frame::new(0, 16, 16, Depth::U8, vec![1u8; 256]);
        assert!(cam.grab(&frame, 0, 0, 100, 100, 1, false).is_err());
    }

    #[test]
    fn store_n_decrements_and_signals_zero() {
        let ring = Arc::new(crate::ring::FrameRing::new(4));
        let cam = CameraDevice::new(
            "cam0",
            ring,
            Box::new(FixedDriver { w: 4, h: 4, value: 1 }),
        );
        let dir = tempfile::tempdir().unwrap();
        cam.set_store_dir(dir.path().to_path_buf());
        cam.set_store(2);
        let frame = Frame::new(0, 4, 4, Depth::U8, vec![1u8; 16]);
        assert_eq!(cam.maybe_store(&frame).unwrap(), Some(1));
        assert_eq!(cam.maybe_store(&frame).unwrap(), Some(0));
        assert_eq!(cam.maybe_store(&frame).unwrap(), None);
    }
}
