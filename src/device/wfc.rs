//! Wavefront corrector device (spec.md §3 "WFC control state", §4.4).

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::device::{CommandLock, Device, DeviceStatus};
use crate::error::{AoError, AoResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct Gain {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// Sparse `virtual_mode -> [real_actuator]` relation (spec.md §3
/// "Actuation map"). `None` means identity (`Nvirt == Nreal`).
#[derive(Debug, Clone, Default)]
pub struct ActuationMap {
    map: HashMap<usize, Vec<usize>>,
    n_real: usize,
}

impl ActuationMap {
    pub fn identity(n: usize) -> Self {
        Self {
            map: (0..n).map(|i| (i, vec![i])).collect(),
            n_real: n,
        }
    }

    pub fn new(map: HashMap<usize, Vec<usize>>, n_real: usize) -> Self {
        Self { map, n_real }
    }

    pub fn n_real(&self) -> usize {
        self.n_real
    }

    /// Broadcasts each modal value in `target` to its mapped real
    /// actuators.
    pub fn expand(&self, target: &[f64]) -> Vec<f64> {
        let mut ctrl = vec![0.0; self.n_real];
        for (mode, value) in target.iter().enumerate() {
            if let Some(actuators) = self.map.get(&mode) {
                for &a in actuators {
                    if a < ctrl.len() {
                        ctrl[a] = *value;
                    }
                }
            }
        }
        ctrl
    }
}

/// Hardware driver contract: deliver a fully resolved actuator command
/// to the mirror (vendor ABI is out of scope, spec.md §1).
pub trait WfcDriver: Send + 'static {
    fn dm_actuate(&mut self, command: &[f64]) -> AoResult<()>;
    fn n_actuators(&self) -> usize;

    /// Downcast hook for tests that need to inspect a concrete driver
    /// behind the `dyn WfcDriver` boundary.
    fn as_any(&self) -> &dyn std::any::Any;
}

struct WfcState {
    target: Vec<f64>,
    ctrl_vec: Vec<f64>,
    offset: Vec<f64>,
    err: Vec<f64>,
    prev: Vec<f64>,
    pid_int: Vec<f64>,
    gain: Gain,
    maxact: f64,
    actmap: ActuationMap,
    status: DeviceStatus,
}

/// Maps a modal target vector to a hardware actuator command, with
/// clamping, the calibrated zero-position offset, the actuation-map
/// fan-out, and the PID-style update law (spec.md §4.4).
pub struct WfcDevice {
    name: String,
    n_virt: usize,
    state: Mutex<WfcState>,
    cmd_lock: CommandLock,
    driver: Mutex<Box<dyn WfcDriver>>,
}

impl WfcDevice {
    pub fn new(name: impl Into<String>, n_virt: usize, driver: Box<dyn WfcDriver>) -> Self {
        let n_real = driver.n_actuators();
        Self {
            name: name.into(),
            n_virt,
            state: Mutex::new(WfcState {
                target: vec![0.0; n_virt],
                ctrl_vec: vec![0.0; n_real],
                offset: vec![0.0; n_real],
                err: vec![0.0; n_virt],
                prev: vec![0.0; n_virt],
                pid_int: vec![0.0; n_virt],
                gain: Gain::default(),
                maxact: 1.0,
                actmap: ActuationMap::identity(n_virt.min(n_real)),
                status: DeviceStatus { online: true, ..Default::default() },
            }),
            cmd_lock: Mutex::new(()),
            driver: Mutex::new(driver),
        }
    }

    pub fn n_virt(&self) -> usize {
        self.n_virt
    }
    pub fn n_real(&self) -> usize {
        self.driver.lock().unwrap().n_actuators()
    }

    pub fn set_gain(&self, gain: Gain) {
        let _g = self.cmd_lock.lock().unwrap();
        self.state.lock().unwrap().gain = gain;
    }
    pub fn gain(&self) -> Gain {
        self.state.lock().unwrap().gain
    }

    pub fn set_maxact(&self, maxact: f64) {
        self.state.lock().unwrap().maxact = maxact;
    }
    pub fn maxact(&self) -> f64 {
        self.state.lock().unwrap().maxact
    }

    pub fn set_actmap(&self, map: ActuationMap) {
        let _g = self.cmd_lock.lock().unwrap();
        self.state.lock().unwrap().actmap = map;
    }

    pub fn set_offset(&self, offset: Vec<f64>) -> AoResult<()> {
        let _g = self.cmd_lock.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        if offset.len() != st.offset.len() {
            return Err(AoError::protocol("set offset", "length mismatch"));
        }
        st.offset = offset;
        Ok(())
    }

    pub fn offset(&self) -> Vec<f64> {
        self.state.lock().unwrap().offset.clone()
    }
    pub fn ctrl_vec(&self) -> Vec<f64> {
        self.state.lock().unwrap().ctrl_vec.clone()
    }
    pub fn target(&self) -> Vec<f64> {
        self.state.lock().unwrap().target.clone()
    }

    /// Proportional-only update law (spec.md §4.4 step 1); the I and D
    /// branches are reserved workspace, not wired into the base
    /// contract (spec.md §4.4 final paragraph).
    pub fn update_control(&self, err: &[f64], retain: f64) -> AoResult<()> {
        let _g = self.cmd_lock.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        if err.len() != self.n_virt {
            return Err(AoError::protocol("update_control", "error vector length mismatch"));
        }
        st.err.copy_from_slice(err);
        let maxact = st.maxact;
        let gain_p = st.gain.p;
        for i in 0..self.n_virt {
            st.target[i] = st.target[i] * retain + gain_p * st.err[i];
            st.target[i] = st.target[i].clamp(-maxact, maxact);
        }
        Ok(())
    }

    /// Expands `target` through the actuation map into `ctrl_vec`.
    pub fn ctrl_apply_actmap(&self) {
        let mut st = self.state.lock().unwrap();
        st.ctrl_vec = st.actmap.expand(&st.target);
    }

    /// `command = ctrl_vec + offset`, clamped to `[-maxact, maxact]`
    /// (spec.md §9 mandates clamping the sum rather than just the
    /// target), then sent to the driver.
    pub fn actuate(&self) -> AoResult<()> {
        let _g = self.cmd_lock.lock().unwrap();
        let (command, maxact) = {
            let st = self.state.lock().unwrap();
            let maxact = st.maxact;
            let command: Vec<f64> = st
                .ctrl_vec
                .iter()
                .zip(st.offset.iter())
                .map(|(c, o)| (c + o).clamp(-maxact, maxact))
                .collect();
            (command, maxact)
        };
        let _ = maxact;
        let result = self.driver.lock().unwrap().dm_actuate(&command);
        if let Err(e) = &result {
            self.state.lock().unwrap().status.record_error(e.to_string());
        }
        result
    }

    /// Sign-alternating pattern on a named set of actuators, bypassing
    /// the map (spec.md §4.4 `set_wafflepattern`).
    pub fn set_wafflepattern(&self, amplitude: f64, even: &[usize], odd: &[usize]) {
        let mut st = self.state.lock().unwrap();
        let n = st.ctrl_vec.len();
        st.ctrl_vec = vec![0.0; n];
        for &i in even {
            if i < n {
                st.ctrl_vec[i] = amplitude;
            }
        }
        for &i in odd {
            if i < n {
                st.ctrl_vec[i] = -amplitude;
            }
        }
    }

    /// Uniform random in `[-a, a]` on every modal element, through the
    /// map (spec.md §4.4 `set_randompattern`).
    pub fn set_randompattern(&self, amplitude: f64) {
        let mut rng = rand::thread_rng();
        let mut st = self.state.lock().unwrap();
        for t in st.target.iter_mut() {
            *t = rng.gen_range(-amplitude..=amplitude);
        }
        let target = st.target.clone();
        st.ctrl_vec = st.actmap.expand(&target);
    }

    /// Zeroes the target and actuates (spec.md §4.4 `reset`).
    pub fn reset(&self) -> AoResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            st.target = vec![0.0; self.n_virt];
            st.ctrl_vec = st.actmap.expand(&st.target);
        }
        self.actuate()
    }

    /// Pushes `+a`, `-a` alternately `n` times with delay `dt`, to
    /// relax the mirror (spec.md §4.4 `loosen`).
    pub fn loosen(&self, amplitude: f64, n: usize, dt: std::time::Duration) -> AoResult<()> {
        for i in 0..n {
            let a = if i % 2 == 0 { amplitude } else { -amplitude };
            {
                let mut st = self.state.lock().unwrap();
                st.target = vec![a; self.n_virt];
                st.ctrl_vec = st.actmap.expand(&st.target);
            }
            self.actuate()?;
            std::thread::sleep(dt);
        }
        self.reset()
    }

    pub fn set_target_single(&self, idx: usize, value: f64) -> AoResult<()> {
        let mut st = self.state.lock().unwrap();
        if idx >= st.target.len() {
            return Err(AoError::protocol("act one", "index out of range"));
        }
        st.target[idx] = value;
        drop(st);
        self.ctrl_apply_actmap();
        Ok(())
    }

    pub fn set_target_all(&self, value: f64) {
        {
            let mut st = self.state.lock().unwrap();
            st.target = vec![value; self.n_virt];
        }
        self.ctrl_apply_actmap();
    }

    pub fn set_target_vec(&self, v: Vec<f64>) -> AoResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            if v.len() != self.n_virt {
                return Err(AoError::protocol("act vec", "length mismatch"));
            }
            st.target = v;
        }
        self.ctrl_apply_actmap();
        Ok(())
    }
}

impl Device for WfcDevice {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &'static str {
        "wfc"
    }
    fn commands(&self) -> Vec<String> {
        vec![
            "set gain".into(),
            "set maxact".into(),
            "set offset".into(),
            "get gain".into(),
            "get nact".into(),
            "get ctrl".into(),
            "get maxact".into(),
            "get offset".into(),
            "act all".into(),
            "act one".into(),
            "act vec".into(),
            "act waffle".into(),
            "act random".into(),
        ]
    }
    fn status(&self) -> DeviceStatus {
        self.state.lock().unwrap().status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDriver {
        n: usize,
        pub last: Vec<f64>,
    }
    impl WfcDriver for MockDriver {
        fn dm_actuate(&mut self, command: &[f64]) -> AoResult<()> {
            self.last = command.to_vec();
            Ok(())
        }
        fn n_actuators(&self) -> usize {
            self.n
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn clamping_holds_for_any_target() {
        let wfc = WfcDevice::new("wfc0", 4, Box::new(MockDriver { n: 4, last: vec![] }));
        wfc.set_maxact(1.0);
        wfc.set_offset(vec![0.8, -0.8, 0.0, 0.0]).unwrap();
        wfc.update_control(&[10.0, -10.0, 0.5, -0.5], 1.0).unwrap();
        wfc.ctrl_apply_actmap();
        wfc.actuate().unwrap();
        let driver = wfc.driver.lock().unwrap();
        let mock = driver.as_any().downcast_ref::<MockDriver>().unwrap();
        for v in &mock.last {
            assert!(v.abs() <= 1.0 + 1e-9);
        }
    }

    #[test]
    fn actuation_map_fanout() {
        let mut map = std::collections::HashMap::new();
        map.insert(0, vec![0, 1, 2]);
        let wfc = WfcDevice::new("wfc0", 1, Box::new(MockDriver { n: 5, last: vec![] }));
        wfc.set_actmap(ActuationMap::new(map, 5));
        wfc.set_target_vec(vec![0.7]).unwrap();
        let ctrl = wfc.ctrl_vec();
        assert_eq!(ctrl, vec![0.7, 0.7, 0.7, 0.0, 0.0]);
    }

    #[test]
    fn waffle_pattern_alternates_sign() {
        let wfc = WfcDevice::new("wfc0", 4, Box::new(MockDriver { n: 4, last: vec![] }));
        wfc.set_wafflepattern(0.5, &[0, 2], &[1, 3]);
        assert_eq!(wfc.ctrl_vec(), vec![0.5, -0.5, 0.5, -0.5]);
    }

    #[test]
    fn reset_zeroes_and_actuates() {
        let wfc = WfcDevice::new("wfc0", 2, Box::new(MockDriver { n: 2, last: vec![] }));
        wfc.set_target_all(0.9);
        wfc.reset().unwrap();
        assert_eq!(wfc.target(), vec![0.0, 0.0]);
        let driver = wfc.driver.lock().unwrap();
        let mock = driver.as_any().downcast_ref::<MockDriver>().unwrap();
        assert_eq!(mock.last, vec![0.0, 0.0]);
    }
}
