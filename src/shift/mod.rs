//! Subimage shift measurement (spec.md §4.2).
//!
//! A fixed pool of `W` worker threads computes one shift vector per
//! call, using a three-lock fork/join protocol (spec.md §4.2):
//! `work_lock` guards job dispatch, `workpool_lock` guards the
//! finisher count, `done_lock`/`done_cond` wakes the controller. The
//! locking order documented there must never be violated: a worker
//! only ever takes `done_lock` after releasing `workpool_lock`, and
//! the controller holds `done_lock` across its wait so the last
//! finisher's notification can never be lost.

mod cog;
mod corr;

pub use cog::cog_shift;
pub use corr::corr_shift;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::frame::Frame;
use crate::wfs::mla::Subimage;

/// Centroiding method (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftMethod {
    /// Intensity-weighted centre of gravity.
    Cog,
    /// SAD-based correlation with parabolic subpixel fit, window of
    /// `+-window` pixels.
    Corr { window: usize },
}

/// One dispatched job: shared inputs plus the output buffer workers
/// write into (each worker owns disjoint indices, written exactly
/// once).
struct Job {
    frame: Arc<Frame>,
    rects: Arc<Vec<Subimage>>,
    method: ShiftMethod,
    mini: f64,
    maxshift: f64,
    output: Mutex<Vec<(f64, f64)>>,
}

struct WorkState {
    job: Option<Arc<Job>>,
    jobs_remaining: isize,
    generation: u64,
}

struct PoolState {
    workers_finished: usize,
}

/// Fork/join worker pool computing shift vectors for one frame at a
/// time. Only one [`dispatch`](Self::dispatch) is ever in flight, so
/// the done-flag is a simple bool reset each round.
pub struct ShiftEngine {
    n_workers: usize,
    work_lock: Mutex<WorkState>,
    work_cond: Condvar,
    pool_lock: Mutex<PoolState>,
    done_lock: Mutex<bool>,
    done_cond: Condvar,
    shutdown: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShiftEngine {
    pub fn new(n_workers: usize) -> Arc<Self> {
        assert!(n_workers > 0);
        let engine = Arc::new(Self {
            n_workers,
            work_lock: Mutex::new(WorkState {
                job: None,
                jobs_remaining: -1,
                generation: 0,
            }),
            work_cond: Condvar::new(),
            pool_lock: Mutex::new(PoolState { workers_finished: 0 }),
            done_lock: Mutex::new(true),
            done_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        });
        let mut handles = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let e = engine.clone();
            handles.push(std::thread::spawn(move || e.worker_loop()));
        }
        *engine.handles.lock().unwrap() = handles;
        engine
    }

    fn worker_loop(self: Arc<Self>) {
        let mut last_seen = 0u64;
        loop {
            // 1. wait on work_cond under work_lock for a new generation.
            let job = {
                let mut ws = self.work_lock.lock().unwrap();
                loop {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    if ws.generation != last_seen {
                        break;
                    }
                    ws = self.work_cond.wait(ws).unwrap();
                }
                last_seen = ws.generation;
                ws.job.clone()
            };
            let Some(job) = job else { continue };

            // 2. claim disjoint subimage indices until exhausted.
            loop {
                let idx = {
                    let mut ws = self.work_lock.lock().unwrap();
                    let i = ws.jobs_remaining;
                    if i >= 0 {
                        ws.jobs_remaining -= 1;
                    }
                    i
                };
                if idx < 0 {
                    break;
                }
                let i = idx as usize;
                let shift = compute_one(&job.frame, &job.rects[i], job.method, job.mini, job.maxshift);
                job.output.lock().unwrap()[i] = shift;
            }

            // 3. under workpool_lock, count finishers; the last one
            // signals done_cond while holding done_lock.
            let last = {
                let mut ps = self.pool_lock.lock().unwrap();
                ps.workers_finished += 1;
                let last = ps.workers_finished == self.n_workers;
                if last {
                    ps.workers_finished = 0;
                }
                last
            };
            if last {
                let mut done = self.done_lock.lock().unwrap();
                *done = true;
                self.done_cond.notify_all();
            }
        }
    }

    /// Dispatches one frame's worth of shift computation and blocks
    /// until every subimage has been processed. Returns the shift
    /// vector in MLA order, pairs `(dx, dy)`.
    pub fn dispatch(
        &self,
        frame: Arc<Frame>,
        rects: Arc<Vec<Subimage>>,
        method: ShiftMethod,
        mini: f64,
        maxshift: f64,
    ) -> Vec<(f64, f64)> {
        let n = rects.len();
        let job = Arc::new(Job {
            frame,
            rects,
            method,
            mini,
            maxshift,
            output: Mutex::new(vec![(0.0, 0.0); n]),
        });

        // Step 1: take done_lock first so the last finisher's
        // notification cannot be missed.
        let mut done = self.done_lock.lock().unwrap();
        *done = false;

        // Step 2: publish the job under work_lock.
        {
            let mut ws = self.work_lock.lock().unwrap();
            ws.job = Some(job.clone());
            ws.jobs_remaining = n as isize - 1;
            ws.generation += 1;
            self.work_cond.notify_all();
        }

        // Step 3: wait for completion.
        while !*done {
            done = self.done_cond.wait(done).unwrap();
        }

        let result = job.output.lock().unwrap().clone();
        result
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.work_cond.notify_all();
        let mut handles = self.handles.lock().unwrap();
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for ShiftEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compute_one(
    frame: &Frame,
    rect: &Subimage,
    method: ShiftMethod,
    mini: f64,
    maxshift: f64,
) -> (f64, f64) {
    let (dx, dy) = match method {
        ShiftMethod::Cog => cog_shift(frame, rect, mini),
        ShiftMethod::Corr { window } => corr_shift(frame, rect, window),
    };
    (dx.clamp(-maxshift, maxshift), dy.clamp(-maxshift, maxshift))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Depth;
    use crate::wfs::mla::Subimage;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn make_rects(n: usize, size: usize) -> Arc<Vec<Subimage>> {
        Arc::new(
            (0..n)
                .map(|i| Subimage {
                    lx: i * size,
                    ly: 0,
                    tx: i * size + size,
                    ty: size,
                })
                .collect(),
        )
    }

    #[test]
    fn disjoint_writes_no_race_over_many_iterations() {
        let engine = ShiftEngine::new(4);
        let rects = make_rects(16, 8);
        let w = 16 * 8;
        let h = 8;
        for iter in 0..2000u32 {
            let v = (iter % 200) as u8 + 1;
            let data = vec![v; w * h];
            let frame = Arc::new(Frame::new(0, w, h, Depth::U8, data));
            let out = engine.dispatch(frame, rects.clone(), ShiftMethod::Cog, 0.0, 100.0);
            assert_eq!(out.len(), 16);
            for (dx, dy) in out {
                assert_abs_diff_eq!(dx, 0.0, epsilon = 1e-9);
                assert_abs_diff_eq!(dy, 0.0, epsilon = 1e-9);
            }
        }
        engine.shutdown();
    }

    #[test]
    fn single_delta_recovered_exactly() {
        let engine = ShiftEngine::new(2);
        let rects = make_rects(2, 8);
        let w = 16;
        let h = 8;
        let mut data = vec![0u8; w * h];
        // Subimage 0 centre is (4,4); put a bright pixel at (5,5) -> shift (1,1).
        data[5 * w + 5] = 255;
        // Subimage 1 centre is (12,4); bright pixel at (12,4) -> shift (0,0).
        data[4 * w + 12] = 255;
        let frame = Arc::new(Frame::new(0, w, h, Depth::U8, data));
        let out = engine.dispatch(frame, rects, ShiftMethod::Cog, 10.0, 100.0);
        assert_abs_diff_eq!(out[0].0, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out[0].1, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out[1].0, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out[1].1, 0.0, epsilon = 1e-9);
        engine.shutdown();
    }
}
