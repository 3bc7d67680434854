//! TCP control server: thread-per-connection line protocol (spec.md
//! §4.8, §5 "one network listener per listening port, plus one per
//! accepted connection").

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::device::camera::CameraDevice;
use crate::device::telescope::Telescope;
use crate::device::wfc::WfcDevice;
use crate::device::{Device, SharedRegistry};
use crate::error::AoResult;
use crate::loop_engine::{CalibRequest, LoopEngine, LoopMode};
use crate::ring::SharedFrameRing;
use crate::session::broadcast::Broadcaster;
use crate::session::handler::{DeviceHandle, DispatchCtx};
use crate::session::protocol;
use crate::wfs::{Cutoff, ShwfsDevice};

enum ConnectionAction {
    Reply(String),
    ReplyWithBytes(String, Vec<u8>),
    Close,
}

/// Owns the device name -> handle map, the broadcaster, and the loop
/// engine wiring shared by every connection.
pub struct SessionServer {
    devices: HashMap<String, DeviceHandle>,
    cameras: HashMap<String, Arc<CameraDevice>>,
    registry: SharedRegistry,
    broadcaster: Arc<Broadcaster>,
    loop_engine: Arc<LoopEngine>,
    wfs: Arc<ShwfsDevice>,
    wfc: Arc<WfcDevice>,
    ring: SharedFrameRing,
    verbosity: AtomicI32,
    shutdown_flag: Arc<AtomicBool>,
    calib_dir: Option<std::path::PathBuf>,
}

impl SessionServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: SharedRegistry,
        broadcaster: Arc<Broadcaster>,
        loop_engine: Arc<LoopEngine>,
        wfs: Arc<ShwfsDevice>,
        wfc: Arc<WfcDevice>,
        telescope: Arc<Telescope>,
        cameras: Vec<Arc<CameraDevice>>,
        ring: SharedFrameRing,
        shutdown_flag: Arc<AtomicBool>,
        calib_dir: Option<std::path::PathBuf>,
    ) -> Arc<Self> {
        let mut devices = HashMap::new();
        let mut camera_map = HashMap::new();
        for cam in cameras {
            devices.insert(cam.name().to_string(), DeviceHandle::Camera(cam.clone()));
            camera_map.insert(cam.name().to_string(), cam);
        }
        devices.insert(wfs.name().to_string(), DeviceHandle::Wfs(wfs.clone()));
        devices.insert(wfc.name().to_string(), DeviceHandle::Wfc(wfc.clone()));
        devices.insert(telescope.name().to_string(), DeviceHandle::Telescope(telescope));
        Arc::new(Self {
            devices,
            cameras: camera_map,
            registry,
            calib_dir,
            broadcaster,
            loop_engine,
            wfs,
            wfc,
            ring,
            verbosity: AtomicI32::new(2),
            shutdown_flag,
        })
    }

    fn handle_line(&self, client_id: u64, line: &str) -> ConnectionAction {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return ConnectionAction::Reply(protocol::err("", "empty command"));
        }
        if let Some(handle) = self.devices.get(tokens[0]) {
            return self.dispatch_device(handle, tokens[0], &tokens[1..]);
        }
        self.dispatch_global(client_id, &tokens)
    }

    fn dispatch_device(&self, handle: &DeviceHandle, device_name: &str, rest: &[&str]) -> ConnectionAction {
        if let DeviceHandle::Wfs(wfs) = handle {
            if Arc::ptr_eq(wfs, &self.wfs) {
                if let Some(action) = self.try_long_running_calib(rest) {
                    return action;
                }
            }
        }
        let ctx = DispatchCtx {
            find_camera: &|name: &str| self.cameras.get(name).cloned(),
            publish: &|tag: &str, line: &str| self.broadcaster.publish(tag, line),
        };
        match handle.dispatch(rest, &ctx) {
            Ok(reply) => {
                let line = protocol::ok(device_name, &reply.line);
                match reply.bytes {
                    Some(bytes) => ConnectionAction::ReplyWithBytes(line, bytes),
                    None => ConnectionAction::Reply(line),
                }
            }
            Err(e) => ConnectionAction::Reply(protocol::err(&format!("{device_name} {}", rest.join(" ")), &e.to_string())),
        }
    }

    /// Calibration is the one command class spec.md §4.8 requires to
    /// return immediately and finish asynchronously: a background
    /// thread runs it and publishes the outcome under the `calib` tag.
    fn try_long_running_calib(&self, rest: &[&str]) -> Option<ConnectionAction> {
        let verb = rest.join(" ");
        let request = match rest {
            ["calibrate"] | ["calib", "zero"] => CalibRequest::Zero,
            ["calib", "influence"] => CalibRequest::Influence {
                amplitudes: vec![-0.1, 0.1],
                cutoff: Cutoff(1.0),
            },
            ["calib", "influence", amp] => {
                let amp: f64 = match amp.parse() {
                    Ok(v) => v,
                    Err(_) => return Some(ConnectionAction::Reply(protocol::err(&verb, "amplitude is not a number"))),
                };
                CalibRequest::Influence { amplitudes: vec![-amp, amp], cutoff: Cutoff(1.0) }
            }
            ["calib", "influence", amp, cutoff] => {
                let amp: f64 = match amp.parse() {
                    Ok(v) => v,
                    Err(_) => return Some(ConnectionAction::Reply(protocol::err(&verb, "amplitude is not a number"))),
                };
                let cutoff: f64 = match cutoff.parse() {
                    Ok(v) => v,
                    Err(_) => return Some(ConnectionAction::Reply(protocol::err(&verb, "cutoff is not a number"))),
                };
                CalibRequest::Influence { amplitudes: vec![-amp, amp], cutoff: Cutoff(cutoff) }
            }
            _ => return None,
        };

        let wfs = self.wfs.clone();
        let wfc = self.wfc.clone();
        let ring = self.ring.clone();
        let loop_engine = self.loop_engine.clone();
        let broadcaster = self.broadcaster.clone();
        let verb_for_thread = verb.clone();
        let calib_dir = self.calib_dir.clone();
        thread::spawn(move || match loop_engine.calib(request, &wfs, &wfc, &ring) {
            Ok(()) => {
                if let Some(dir) = &calib_dir {
                    if let Err(e) = wfs.store_reference_csv(dir.join("refvec.csv")) {
                        log::warn!("failed to persist reference vector: {e}");
                    }
                    if let Err(e) = wfs.store_singvals_csv(dir.join("singvals.csv")) {
                        log::debug!("no singular-value diagnostics to persist: {e}");
                    }
                }
                broadcaster.publish("calib", &protocol::ok("calib", &format!("{verb_for_thread} done")));
            }
            Err(e) => broadcaster.publish("calib", &protocol::err(&verb_for_thread, &e.to_string())),
        });
        Some(ConnectionAction::Reply(protocol::ok("cmd", &verb)))
    }

    fn dispatch_global(&self, client_id: u64, tokens: &[&str]) -> ConnectionAction {
        match tokens {
            ["help"] | ["help", _] => ConnectionAction::Reply(protocol::ok("help", HELP_TEXT)),
            ["quit"] | ["bye"] | ["exit"] => ConnectionAction::Close,
            ["shutdown"] => {
                self.shutdown_flag.store(true, Ordering::SeqCst);
                self.loop_engine.set_mode(LoopMode::Shutdown);
                ConnectionAction::Reply(protocol::ok("shutdown", ""))
            }
            ["verb"] => ConnectionAction::Reply(protocol::ok("verb", &self.verbosity.load(Ordering::SeqCst).to_string())),
            ["verb", delta] => self.adjust_verbosity(delta),
            ["broadcast", rest @ ..] => {
                let msg = rest.join(" ");
                self.broadcaster.publish("broadcast", &protocol::notify(&msg));
                ConnectionAction::Reply(protocol::ok("broadcast", &msg))
            }
            ["subscribe", tag] => {
                self.broadcaster.subscribe(client_id, tag);
                ConnectionAction::Reply(protocol::ok("subscribe", tag))
            }
            ["unsubscribe", tag] => {
                self.broadcaster.unsubscribe(client_id, tag);
                ConnectionAction::Reply(protocol::ok("unsubscribe", tag))
            }
            ["get", "mode"] => ConnectionAction::Reply(protocol::ok("mode", loop_mode_str(self.loop_engine.mode()))),
            ["get", "devices"] => ConnectionAction::Reply(protocol::ok("devices", &self.registry.names().join(";"))),
            ["mode", m] => match parse_loop_mode(m) {
                Some(mode) => {
                    self.loop_engine.set_mode(mode);
                    self.broadcaster.publish("mode", &protocol::ok("mode", m));
                    ConnectionAction::Reply(protocol::ok("mode", m))
                }
                None => ConnectionAction::Reply(protocol::err("mode", "unknown mode, expected open|closed|listen|calib")),
            },
            _ => ConnectionAction::Reply(protocol::err(&tokens.join(" "), "unrecognised command")),
        }
    }

    fn adjust_verbosity(&self, delta: &str) -> ConnectionAction {
        let mut v = self.verbosity.load(Ordering::SeqCst);
        match delta {
            "+" => v += 1,
            "-" => v -= 1,
            n => match n.parse::<i32>() {
                Ok(x) => v = x,
                Err(_) => return ConnectionAction::Reply(protocol::err("verb", "expected +, -, or an integer")),
            },
        }
        v = v.clamp(0, 4);
        self.verbosity.store(v, Ordering::SeqCst);
        log::set_max_level(level_for(v));
        ConnectionAction::Reply(protocol::ok("verb", &v.to_string()))
    }
}

const HELP_TEXT: &str = "help;quit;bye;exit;shutdown;verb;broadcast;subscribe;unsubscribe;get mode;get devices;mode";

fn level_for(v: i32) -> log::LevelFilter {
    match v {
        v if v <= 0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn parse_loop_mode(s: &str) -> Option<LoopMode> {
    match s {
        "open" => Some(LoopMode::Open),
        "closed" => Some(LoopMode::Closed),
        "listen" => Some(LoopMode::Listen),
        "calib" => Some(LoopMode::Cal),
        _ => None,
    }
}

fn loop_mode_str(m: LoopMode) -> &'static str {
    match m {
        LoopMode::Open => "open",
        LoopMode::Closed => "closed",
        LoopMode::Listen => "listen",
        LoopMode::Cal => "calib",
        LoopMode::Shutdown => "shutdown",
    }
}

fn handle_connection(server: Arc<SessionServer>, stream: TcpStream) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let writer = Arc::new(Mutex::new(stream));
    let (client_id, rx) = server.broadcaster.register();

    let bw = writer.clone();
    let broadcast_thread = thread::spawn(move || {
        for line in rx {
            let mut w = bw.lock().unwrap();
            if writeln!(w, "{line}").is_err() {
                break;
            }
        }
    });

    let reader = BufReader::new(reader_stream);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match server.handle_line(client_id, trimmed) {
            ConnectionAction::Reply(text) => {
                let mut w = writer.lock().unwrap();
                if writeln!(w, "{text}").is_err() {
                    break;
                }
            }
            ConnectionAction::ReplyWithBytes(text, bytes) => {
                let mut w = writer.lock().unwrap();
                if writeln!(w, "{text}").is_err() || w.write_all(&bytes).is_err() {
                    break;
                }
            }
            ConnectionAction::Close => break,
        }
    }
    server.broadcaster.unregister(client_id);
    drop(writer);
    let _ = broadcast_thread.join();
}

/// Accepts connections until the listener errors or `shutdown` is
/// requested, spawning one thread per connection (spec.md §5).
pub fn serve(server: Arc<SessionServer>, addr: impl ToSocketAddrs) -> AoResult<()> {
    let listener = TcpListener::bind(addr)?;
    for stream in listener.incoming() {
        if server.shutdown_flag.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(_) => continue,
        };
        let server = server.clone();
        thread::spawn(move || handle_connection(server, stream));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::camera::CameraDriver;
    use crate::frame::Depth;
    use crate::ring::FrameRing;
    use crate::shift::ShiftEngine;
    use crate::wfs::mla::{MlaGeometry, OverlapPolicy, Subimage};

    struct NullDriver(usize);
    impl crate::device::wfc::WfcDriver for NullDriver {
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
    struct FixedDriver;
    impl CameraDriver for FixedDriver {
        fn acquire(&mut self, buf: &mut [u8], _exposure: f64) -> AoResult<()> {
            buf.fill(3);
            Ok(())
        }
        fn resolution(&self) -> (usize, usize) {
            (8, 8)
        }
        fn depth(&self) -> Depth {
            Depth::U8
        }
    }

    fn make_server() -> Arc<SessionServer> {
        let registry = crate::device::Registry::new();
        let ring = Arc::new(FrameRing::new(4));
        let cam = CameraDevice::new("cam0", ring.clone(), Box::new(FixedDriver));
        registry.insert(cam.clone() as Arc<dyn Device>).unwrap();
        let engine = ShiftEngine::new(2);
        let wfs = Arc::new(ShwfsDevice::new("wfs0", "cam0", engine));
        let mut geom = MlaGeometry::empty();
        geom.add(Subimage::new(0, 0, 8, 8).unwrap(), OverlapPolicy::Reject).unwrap();
        wfs.set_geometry(geom, 8, 8).unwrap();
        registry.insert(wfs.clone() as Arc<dyn Device>).unwrap();
        let wfc = Arc::new(WfcDevice::new("wfc0", 1, Box::new(NullDriver(1))));
        registry.insert(wfc.clone() as Arc<dyn Device>).unwrap();
        let telescope = Arc::new(Telescope::new("tel0"));
        registry.insert(telescope.clone() as Arc<dyn Device>).unwrap();
        let loop_engine = LoopEngine::new(std::time::Duration::from_millis(200), 1.0);
        let broadcaster = Broadcaster::new();
        SessionServer::new(
            registry,
            broadcaster,
            loop_engine,
            wfs,
            wfc,
            telescope,
            vec![cam],
            ring,
            Arc::new(AtomicBool::new(false)),
            None,
        )
    }

    #[test]
    fn device_prefixed_command_routes_and_replies() {
        let server = make_server();
        match server.handle_line(1, "cam0 set exposure 0.02") {
            ConnectionAction::Reply(line) => assert_eq!(line, "ok cam0 exposure 0.02"),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn unknown_device_prefix_falls_back_to_global_and_errors() {
        let server = make_server();
        match server.handle_line(1, "nosuchdevice get mode") {
            ConnectionAction::Reply(line) => assert!(line.starts_with("err")),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn get_devices_lists_registered_names() {
        let server = make_server();
        match server.handle_line(1, "get devices") {
            ConnectionAction::Reply(line) => {
                assert!(line.contains("cam0"));
                assert!(line.contains("wfs0"));
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn mode_command_drives_the_loop_engine() {
        let server = make_server();
        server.handle_line(1, "mode open");
        assert_eq!(server.loop_engine.mode(), LoopMode::Open);
        server.handle_line(1, "mode listen");
        assert_eq!(server.loop_engine.mode(), LoopMode::Listen);
    }

    #[test]
    fn calibrate_returns_immediately() {
        let server = make_server();
        match server.handle_line(1, "wfs0 calib zero") {
            ConnectionAction::Reply(line) => assert_eq!(line, "ok cmd calib zero"),
            _ => panic!("expected a reply"),
        }
    }
}
