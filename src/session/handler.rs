//! Per-device command dispatch (spec.md §6).
//!
//! A `DeviceHandle` wraps one concrete device type. Dispatch matches on
//! the enum once per call instead of downcasting a `dyn Device`, per
//! the spec.md §9 note against cross-hierarchy downcasts: the generic
//! [`crate::device::Registry`] stores `Arc<dyn Device>` for listing and
//! status only, while the session layer keeps a separate map of typed
//! handles for actual command execution.

use std::sync::Arc;
use std::time::Duration;

use crate::device::camera::{CameraDevice, CameraMode};
use crate::device::telescope::Telescope;
use crate::device::wfc::{Gain, WfcDevice};
use crate::device::{Device, DeviceStatus};
use crate::error::{AoError, AoResult};
use crate::session::protocol;
use crate::wfs::{BasisKind, Cutoff, ShwfsDevice};

/// Lookup a camera device's resolution/latest frame by name, so WFS
/// `mla generate`/`mla find` commands (which need the frame size or a
/// live frame) can reach across devices without the session layer
/// handing `ShwfsDevice` a back-pointer to its camera (spec.md §9
/// design note against cyclic device references).
///
/// `publish` gives dispatch the same cross-device decoupling for
/// broadcasting a changed setting to a tag's subscribers (spec.md §6
/// tag mechanism) without handing dispatch a concrete `Broadcaster`.
pub struct DispatchCtx<'a> {
    pub find_camera: &'a dyn Fn(&str) -> Option<Arc<CameraDevice>>,
    pub publish: &'a dyn Fn(&str, &str),
}

/// Dispatch result: a framed text line, optionally followed by a raw
/// byte payload (image/thumbnail transfers, spec.md §6 "Image
/// on-wire").
pub struct Reply {
    pub line: String,
    pub bytes: Option<Vec<u8>>,
}

impl Reply {
    fn line(s: impl Into<String>) -> Self {
        Self { line: s.into(), bytes: None }
    }
    fn with_bytes(line: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { line: line.into(), bytes: Some(bytes) }
    }
}

#[derive(Clone)]
pub enum DeviceHandle {
    Camera(Arc<CameraDevice>),
    Wfc(Arc<WfcDevice>),
    Wfs(Arc<ShwfsDevice>),
    Telescope(Arc<Telescope>),
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        match self {
            DeviceHandle::Camera(d) => d.name(),
            DeviceHandle::Wfc(d) => d.name(),
            DeviceHandle::Wfs(d) => d.name(),
            DeviceHandle::Telescope(d) => d.name(),
        }
    }

    fn as_device(&self) -> &dyn Device {
        match self {
            DeviceHandle::Camera(d) => d.as_ref(),
            DeviceHandle::Wfc(d) => d.as_ref(),
            DeviceHandle::Wfs(d) => d.as_ref(),
            DeviceHandle::Telescope(d) => d.as_ref(),
        }
    }

    /// Commands common to every device kind (spec.md §4.8 "Commands
    /// common to all devices"), tried before kind-specific dispatch.
    fn common(&self, tokens: &[&str]) -> Option<AoResult<Reply>> {
        match tokens {
            ["get", "commands"] => {
                let cmds = self.as_device().commands();
                Some(Ok(Reply::line(format!("{} {}", cmds.len(), cmds.join(";")))))
            }
            ["get", "status"] => Some(Ok(Reply::line(format_status(&self.as_device().status())))),
            ["get", "calib"] if !matches!(self, DeviceHandle::Wfs(_)) => Some(Ok(Reply::line("none"))),
            _ => None,
        }
    }

    pub fn dispatch(&self, tokens: &[&str], ctx: &DispatchCtx) -> AoResult<Reply> {
        if let Some(r) = self.common(tokens) {
            return r;
        }
        match self {
            DeviceHandle::Camera(d) => dispatch_camera(d, tokens, ctx),
            DeviceHandle::Wfc(d) => dispatch_wfc(d, tokens, ctx),
            DeviceHandle::Wfs(d) => dispatch_wfs(d, tokens, ctx),
            DeviceHandle::Telescope(d) => dispatch_telescope(d, tokens, ctx),
        }
    }
}

fn format_status(s: &DeviceStatus) -> String {
    format!(
        "online={} errors={} last={}",
        s.online,
        s.error_count,
        s.last_error.as_deref().unwrap_or("-")
    )
}

fn parse_f64(verb: &str, s: &str) -> AoResult<f64> {
    s.parse().map_err(|_| AoError::protocol(verb, format!("not a number: {s}")))
}
fn parse_usize(verb: &str, s: &str) -> AoResult<usize> {
    s.parse().map_err(|_| AoError::protocol(verb, format!("not an unsigned integer: {s}")))
}

fn camera_mode_from_str(verb: &str, s: &str) -> AoResult<CameraMode> {
    match s {
        "OFF" => Ok(CameraMode::Off),
        "WAITING" => Ok(CameraMode::Waiting),
        "SINGLE" => Ok(CameraMode::Single),
        "RUNNING" => Ok(CameraMode::Running),
        "CONFIG" => Ok(CameraMode::Config),
        other => Err(AoError::protocol(verb, format!("unknown camera mode: {other}"))),
    }
}

fn camera_mode_str(m: CameraMode) -> &'static str {
    match m {
        CameraMode::Off => "OFF",
        CameraMode::Waiting => "WAITING",
        CameraMode::Single => "SINGLE",
        CameraMode::Running => "RUNNING",
        CameraMode::Config => "CONFIG",
        CameraMode::Error => "ERROR",
    }
}

fn dispatch_camera(cam: &Arc<CameraDevice>, tokens: &[&str], ctx: &DispatchCtx) -> AoResult<Reply> {
    match tokens {
        ["set", "mode", m] => {
            cam.set_mode(camera_mode_from_str("set mode", m)?);
            (ctx.publish)("mode", &protocol::ok("mode", m));
            Ok(Reply::line(format!("mode {m}")))
        }
        ["set", "exposure", v] => {
            cam.set_exposure(parse_f64("set exposure", v)?);
            (ctx.publish)("exposure", &protocol::ok("exposure", v));
            Ok(Reply::line(format!("exposure {v}")))
        }
        ["set", "interval", v] => {
            cam.set_interval(parse_f64("set interval", v)?);
            (ctx.publish)("interval", &protocol::ok("interval", v));
            Ok(Reply::line(format!("interval {v}")))
        }
        ["set", "gain", v] => {
            cam.set_gain(parse_f64("set gain", v)?);
            (ctx.publish)("gain", &protocol::ok("gain", v));
            Ok(Reply::line(format!("gain {v}")))
        }
        ["set", "offset", v] => {
            cam.set_offset(parse_f64("set offset", v)?);
            (ctx.publish)("offset", &protocol::ok("offset", v));
            Ok(Reply::line(format!("offset {v}")))
        }
        ["set", "filename", name] => {
            cam.set_filename((*name).to_string());
            (ctx.publish)("filename", &protocol::ok("filename", name));
            Ok(Reply::line(format!("filename {name}")))
        }
        ["set", "fits", tags] => {
            let parts: Vec<&str> = tags.split(',').collect();
            if parts.len() != 3 {
                return Err(AoError::protocol("set fits", "expected observer,target,comment"));
            }
            cam.set_fits_tags(parts[0].to_string(), parts[1].to_string(), parts[2].to_string());
            (ctx.publish)("fits", &protocol::ok("fits", tags));
            Ok(Reply::line("fits"))
        }
        ["set", "store", n] => {
            cam.set_store(parse_usize("set store", n)? as u32);
            Ok(Reply::line(format!("store {n}")))
        }
        ["get", "mode"] => Ok(Reply::line(camera_mode_str(cam.mode()))),
        ["get", "exposure"] => Ok(Reply::line(cam.settings().exposure.to_string())),
        ["get", "interval"] => Ok(Reply::line(cam.settings().interval.to_string())),
        ["get", "gain"] => Ok(Reply::line(cam.settings().gain.to_string())),
        ["get", "offset"] => Ok(Reply::line(cam.settings().offset.to_string())),
        ["get", "width"] => Ok(Reply::line(cam.resolution().0.to_string())),
        ["get", "height"] => Ok(Reply::line(cam.resolution().1.to_string())),
        ["get", "depth"] => Ok(Reply::line(cam.depth().bits().to_string())),
        ["get", "resolution"] => {
            let (w, h) = cam.resolution();
            Ok(Reply::line(format!("{w} {h}")))
        }
        ["get", "filename"] => Ok(Reply::line(cam.filename())),
        ["get", "fits"] => {
            let (observer, target, comment) = cam.fits_tags();
            Ok(Reply::line(format!("{observer},{target},{comment}")))
        }
        ["thumbnail"] => {
            let frame = cam
                .ring()
                .latest()
                .ok_or_else(|| AoError::Timeout { device: cam.name().to_string() })?;
            let thumb = cam.thumbnail(&frame);
            Ok(Reply::with_bytes("image 1024 0 0 32 32 1", thumb))
        }
        ["grab", x1, y1, x2, y2, scale, rest @ ..] => {
            let frame = cam
                .ring()
                .latest()
                .ok_or_else(|| AoError::Timeout { device: cam.name().to_string() })?;
            let (x1, y1, x2, y2, scale) = (
                parse_usize("grab", x1)?,
                parse_usize("grab", y1)?,
                parse_usize("grab", x2)?,
                parse_usize("grab", y2)?,
                parse_usize("grab", scale)?,
            );
            let darkflat = rest.contains(&"darkflat");
            let pixels = cam.grab(&frame, x1, y1, x2, y2, scale, darkflat)?;
            let mut f = frame.clone();
            let stats = f.stats();
            let header = format!(
                "image {} {x1} {y1} {x2} {y2} {scale} avg {:.3} rms {:.3} min {} max {}",
                pixels.len(),
                stats.mean,
                stats.rms,
                stats.min as i64,
                stats.max as i64,
            );
            Ok(Reply::with_bytes(header, pixels))
        }
        ["dark", rest @ ..] | ["flat", rest @ ..] => {
            let n = match rest {
                [n] => parse_usize("dark/flat", n)?,
                [] => 10,
                _ => return Err(AoError::protocol("dark/flat", "expected at most one count argument")),
            };
            let frames = collect_frames(cam, n)?;
            if tokens[0] == "dark" {
                cam.accumulate_dark(&frames);
                Ok(Reply::line(format!("dark {n}")))
            } else {
                cam.accumulate_flat(&frames);
                Ok(Reply::line(format!("flat {n}")))
            }
        }
        _ => Err(AoError::protocol(tokens.join(" "), "unrecognised camera command")),
    }
}

fn collect_frames(cam: &Arc<CameraDevice>, n: usize) -> AoResult<Vec<crate::frame::Frame>> {
    let ring = cam.ring();
    let mut frames = Vec::with_capacity(n);
    let mut seen = ring.latest_id();
    for _ in 0..n {
        let frame = ring
            .next(seen, true, Some(Duration::from_secs(5)))
            .ok_or_else(|| AoError::Timeout { device: cam.name().to_string() })?;
        seen = Some(frame.id);
        frames.push(frame);
    }
    Ok(frames)
}

fn dispatch_wfc(wfc: &Arc<WfcDevice>, tokens: &[&str], ctx: &DispatchCtx) -> AoResult<Reply> {
    match tokens {
        ["set", "gain", p, i, d] => {
            let gain = Gain {
                p: parse_f64("set gain", p)?,
                i: parse_f64("set gain", i)?,
                d: parse_f64("set gain", d)?,
            };
            wfc.set_gain(gain);
            (ctx.publish)("gain", &protocol::ok("gain", &format!("{p} {i} {d}")));
            Ok(Reply::line(format!("gain {p} {i} {d}")))
        }
        ["set", "maxact", v] => {
            wfc.set_maxact(parse_f64("set maxact", v)?);
            (ctx.publish)("maxact", &protocol::ok("maxact", v));
            Ok(Reply::line(format!("maxact {v}")))
        }
        ["set", "offset", n, rest @ ..] => {
            let n = parse_usize("set offset", n)?;
            if rest.len() != n {
                return Err(AoError::protocol("set offset", "value count does not match n"));
            }
            let values = rest
                .iter()
                .map(|v| parse_f64("set offset", v))
                .collect::<AoResult<Vec<f64>>>()?;
            wfc.set_offset(values)?;
            (ctx.publish)("offset", &protocol::ok("offset", &rest.join(" ")));
            Ok(Reply::line("offset"))
        }
        ["get", "gain"] => {
            let g = wfc.gain();
            Ok(Reply::line(format!("{} {} {}", g.p, g.i, g.d)))
        }
        ["get", "nact"] => Ok(Reply::line(wfc.n_real().to_string())),
        ["get", "ctrl"] => Ok(Reply::line(format_vec(&wfc.ctrl_vec()))),
        ["get", "maxact"] => Ok(Reply::line(wfc.maxact().to_string())),
        ["get", "offset"] => Ok(Reply::line(format_vec(&wfc.offset()))),
        ["act", "all", v] => {
            wfc.set_target_all(parse_f64("act all", v)?);
            wfc.actuate()?;
            Ok(Reply::line(format!("all {v}")))
        }
        ["act", "one", idx, v] => {
            wfc.set_target_single(parse_usize("act one", idx)?, parse_f64("act one", v)?)?;
            wfc.actuate()?;
            Ok(Reply::line(format!("one {idx} {v}")))
        }
        ["act", "vec", rest @ ..] => {
            let values = rest
                .iter()
                .map(|v| parse_f64("act vec", v))
                .collect::<AoResult<Vec<f64>>>()?;
            wfc.set_target_vec(values)?;
            wfc.actuate()?;
            Ok(Reply::line("vec"))
        }
        ["act", "waffle", v] => {
            let a = parse_f64("act waffle", v)?;
            let n = wfc.n_real();
            let (even, odd): (Vec<usize>, Vec<usize>) = (0..n).partition(|i| i % 2 == 0);
            wfc.set_wafflepattern(a, &even, &odd);
            wfc.actuate()?;
            Ok(Reply::line(format!("waffle {v}")))
        }
        ["act", "random", v] => {
            wfc.set_randompattern(parse_f64("act random", v)?);
            wfc.actuate()?;
            Ok(Reply::line(format!("random {v}")))
        }
        _ => Err(AoError::protocol(tokens.join(" "), "unrecognised wfc command")),
    }
}

fn format_vec(v: &[f64]) -> String {
    v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(" ")
}

fn wfs_camera<'a>(wfs: &ShwfsDevice, ctx: &DispatchCtx<'a>) -> AoResult<Arc<CameraDevice>> {
    (ctx.find_camera)(&wfs.camera_name()).ok_or_else(|| AoError::UnknownDevice(wfs.camera_name()))
}

fn dispatch_wfs(wfs: &Arc<ShwfsDevice>, tokens: &[&str], ctx: &DispatchCtx) -> AoResult<Reply> {
    match tokens {
        ["measuretest"] => Ok(Reply::line("measuretest requires a live frame; use the loop engine in OPEN or CLOSED mode")),
        ["get", "modes"] => Ok(Reply::line(wfs.n_modes().to_string())),
        ["get", "basis"] => Ok(Reply::line(basis_kind_str(wfs.basis_kind()))),
        ["get", "calib"] => match wfs.reconstructor() {
            Some(r) => Ok(Reply::line(format!(
                "modes_used {} condition {:.3} power {:.3}",
                r.modes_used, r.condition, r.power_fraction_used
            ))),
            None => Ok(Reply::line("none")),
        },
        ["get", "camera"] => Ok(Reply::line(wfs.camera_name())),
        ["mla", "del", idx] => {
            let idx = parse_usize("mla del", idx)?;
            wfs.edit_geometry(|g| g.remove(idx).map(|_| ()))?;
            (ctx.publish)("mla", &protocol::ok("mla", wfs.geometry().len().to_string().as_str()));
            Ok(Reply::line(format!("del {idx}")))
        }
        ["mla", "add", lx, ly, tx, ty] => {
            let rect = crate::wfs::Subimage::new(
                parse_usize("mla add", lx)?,
                parse_usize("mla add", ly)?,
                parse_usize("mla add", tx)?,
                parse_usize("mla add", ty)?,
            )?;
            wfs.edit_geometry(|g| g.add(rect, crate::wfs::OverlapPolicy::Reject))?;
            (ctx.publish)("mla", &protocol::ok("mla", wfs.geometry().len().to_string().as_str()));
            Ok(Reply::line("add"))
        }
        ["mla", "store", path] => {
            wfs.geometry().store_csv(path)?;
            Ok(Reply::line(format!("store {path}")))
        }
        ["mla", "generate", sx, sy, px, py, row_offset, cdx, cdy, shape] => {
            let cam = wfs_camera(wfs, ctx)?;
            let (w, h) = cam.resolution();
            let shape = match *shape {
                "square" => crate::wfs::ApertureShape::Square,
                "circular" => crate::wfs::ApertureShape::Circular,
                other => return Err(AoError::protocol("mla generate", format!("unknown aperture shape: {other}"))),
            };
            let geom = crate::wfs::MlaGeometry::generate(
                w,
                h,
                (parse_usize("mla generate", sx)?, parse_usize("mla generate", sy)?),
                (parse_f64("mla generate", px)?, parse_f64("mla generate", py)?),
                parse_f64("mla generate", row_offset)?,
                (parse_f64("mla generate", cdx)?, parse_f64("mla generate", cdy)?),
                shape,
                1.0,
            )?;
            let n = geom.len();
            wfs.set_geometry(geom, w, h)?;
            (ctx.publish)("mla", &protocol::ok("mla", &n.to_string()));
            Ok(Reply::line(format!("generate {n}")))
        }
        ["mla", "find", sx, sy, threshold, max_spots, refine] => {
            let cam = wfs_camera(wfs, ctx)?;
            let (w, h) = cam.resolution();
            let frame = cam
                .ring()
                .latest()
                .ok_or_else(|| AoError::Timeout { device: cam.name().to_string() })?;
            let geom = crate::wfs::MlaGeometry::find_bright_spots(
                &frame,
                (parse_usize("mla find", sx)?, parse_usize("mla find", sy)?),
                parse_f64("mla find", threshold)?,
                parse_usize("mla find", max_spots)?,
                parse_usize("mla find", refine)?,
            )?;
            let n = geom.len();
            wfs.set_geometry(geom, w, h)?;
            (ctx.publish)("mla", &protocol::ok("mla", &n.to_string()));
            Ok(Reply::line(format!("find {n}")))
        }
        ["set", "mla", path] => {
            let cam = wfs_camera(wfs, ctx)?;
            let (w, h) = cam.resolution();
            let geom = crate::wfs::MlaGeometry::load_csv(path)?;
            let n = geom.len();
            wfs.set_geometry(geom, w, h)?;
            (ctx.publish)("mla", &protocol::ok("mla", &n.to_string()));
            Ok(Reply::line(format!("mla {n}")))
        }
        ["get", "mla"] => Ok(Reply::line(wfs.geometry().len().to_string())),
        ["calib", "offsetvec", x, y] => {
            wfs.calib_offset(parse_f64("calib offsetvec", x)?, parse_f64("calib offsetvec", y)?)?;
            (ctx.publish)("calib", &protocol::ok("calib", &format!("offsetvec {x} {y}")));
            Ok(Reply::line(format!("offsetvec {x} {y}")))
        }
        ["calib", "svd", cutoff] => {
            let recon = wfs.recompute_svd(Cutoff(parse_f64("calib svd", cutoff)?))?;
            (ctx.publish)("calib", &protocol::ok("calib", &format!("svd modes_used {}", recon.modes_used)));
            Ok(Reply::line(format!("svd modes_used {}", recon.modes_used)))
        }
        ["get", "singvals"] => match wfs.reconstructor() {
            Some(r) => Ok(Reply::line(format_vec(&r.singular_values))),
            None => Err(AoError::calibration("no reconstructor calibrated")),
        },
        ["get", "svdcondition"] => match wfs.reconstructor() {
            Some(r) => Ok(Reply::line(r.condition.to_string())),
            None => Err(AoError::calibration("no reconstructor calibrated")),
        },
        ["get", "svdusage"] => match wfs.reconstructor() {
            Some(r) => Ok(Reply::line(r.power_fraction_used.to_string())),
            None => Err(AoError::calibration("no reconstructor calibrated")),
        },
        ["get", "refvec"] => Ok(Reply::line(format_vec(&wfs.reference_vector()))),
        _ => Err(AoError::protocol(tokens.join(" "), "unrecognised wfs command")),
    }
}

fn basis_kind_str(k: BasisKind) -> &'static str {
    match k {
        BasisKind::Sensor => "sensor",
        BasisKind::Zernike => "zernike",
        BasisKind::Kl => "kl",
        BasisKind::Mirror => "mirror",
    }
}

fn dispatch_telescope(tel: &Arc<Telescope>, tokens: &[&str], ctx: &DispatchCtx) -> AoResult<Reply> {
    match tokens {
        ["get", "tel_track"] => {
            let t = tel.track();
            Ok(Reply::line(format!("{} {}", t.ttx, t.tty)))
        }
        ["get", "tel_units"] => {
            let (fx, fy) = tel.scalefac();
            Ok(Reply::line(format!("{fx} {fy}")))
        }
        ["get", "pixshift"] => {
            let (x, y) = tel.pix_shift();
            Ok(Reply::line(format!("{x} {y}")))
        }
        ["set", "ccd_ang", v] => {
            tel.set_ccd_ang(parse_f64("set ccd_ang", v)?);
            (ctx.publish)("ccd_ang", &protocol::ok("ccd_ang", v));
            Ok(Reply::line(format!("ccd_ang {v}")))
        }
        ["set", "scalefac", fx, fy] => {
            tel.set_scalefac(parse_f64("set scalefac", fx)?, parse_f64("set scalefac", fy)?);
            (ctx.publish)("scalefac", &protocol::ok("scalefac", &format!("{fx} {fy}")));
            Ok(Reply::line(format!("scalefac {fx} {fy}")))
        }
        ["set", "ttgain", p, i, d] => {
            let gain = Gain {
                p: parse_f64("set ttgain", p)?,
                i: parse_f64("set ttgain", i)?,
                d: parse_f64("set ttgain", d)?,
            };
            tel.set_ttgain(gain);
            (ctx.publish)("ttgain", &protocol::ok("ttgain", &format!("{p} {i} {d}")));
            Ok(Reply::line(format!("ttgain {p} {i} {d}")))
        }
        _ => Err(AoError::protocol(tokens.join(" "), "unrecognised telescope command")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::camera::CameraDriver;
    use crate::frame::Depth;
    use crate::ring::FrameRing;

    struct FixedDriver;
    impl CameraDriver for FixedDriver {
        fn acquire(&mut self, buf: &mut [u8], _exposure: f64) -> AoResult<()> {
            buf.fill(7);
            Ok(())
        }
        fn resolution(&self) -> (usize, usize) {
            (8, 8)
        }
        fn depth(&self) -> Depth {
            Depth::U8
        }
    }

    fn no_camera_ctx() -> DispatchCtx<'static> {
        DispatchCtx { find_camera: &|_: &str| None, publish: &|_, _| {} }
    }

    #[test]
    fn set_then_get_exposure_round_trips() {
        let cam = CameraDevice::new("cam0", Arc::new(FrameRing::new(4)), Box::new(FixedDriver));
        let handle = DeviceHandle::Camera(cam);
        let ctx = no_camera_ctx();
        handle.dispatch(&["set", "exposure", "0.02"], &ctx).unwrap();
        let r = handle.dispatch(&["get", "exposure"], &ctx).unwrap();
        assert_eq!(r.line, "0.02");
    }

    #[test]
    fn set_exposure_publishes_to_the_exposure_tag() {
        let cam = CameraDevice::new("cam0", Arc::new(FrameRing::new(4)), Box::new(FixedDriver));
        let handle = DeviceHandle::Camera(cam);
        let published = std::cell::RefCell::new(Vec::new());
        let publish = |tag: &str, line: &str| published.borrow_mut().push((tag.to_string(), line.to_string()));
        let ctx = DispatchCtx { find_camera: &|_: &str| None, publish: &publish };
        handle.dispatch(&["set", "exposure", "0.02"], &ctx).unwrap();
        assert_eq!(published.borrow().as_slice(), [("exposure".to_string(), "ok exposure 0.02".to_string())]);
    }

    #[test]
    fn get_commands_lists_descriptors() {
        let cam = CameraDevice::new("cam0", Arc::new(FrameRing::new(4)), Box::new(FixedDriver));
        let handle = DeviceHandle::Camera(cam);
        let r = handle.dispatch(&["get", "commands"], &no_camera_ctx()).unwrap();
        assert!(r.line.starts_with("22 ") || r.line.contains(';'));
    }

    #[test]
    fn unrecognised_command_is_a_protocol_error() {
        let tel = Arc::new(Telescope::new("tel0"));
        let handle = DeviceHandle::Telescope(tel);
        assert!(handle.dispatch(&["bogus"], &no_camera_ctx()).is_err());
    }
}
