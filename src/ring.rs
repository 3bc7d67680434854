//! Bounded circular frame buffer (spec.md §3 "Frame ring", §4.1).
//!
//! One producer (the camera capture thread), many consumers (loop
//! engine, GUIs, monitors). Slot `i` holds the frame whose id is
//! congruent to `i mod N`; readers either ask for the latest frame,
//! a specific id, or block for "next after seen id".

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::frame::Frame;

struct RingState {
    slots: Vec<Option<Frame>>,
    /// Number of frames ever queued; the next id to be assigned.
    count: u64,
}

/// Lock-protected bounded ring of `N` frame slots.
pub struct FrameRing {
    capacity: usize,
    state: Mutex<RingState>,
    /// Signalled by the producer whenever a new frame is published.
    arrived: Condvar,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame ring capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                count: 0,
            }),
            arrived: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Producer call: publishes `frame` (whose id must be `count`) into
    /// its slot and wakes any waiting consumer. Returns the frame that
    /// previously occupied the slot, if any, so the camera can recycle
    /// its backing store.
    pub fn queue(&self, frame: Frame) -> Option<Frame> {
        let mut st = self.state.lock().unwrap();
        let id = frame.id;
        debug_assert_eq!(id, st.count, "frames must be queued in strict id order");
        let slot = (id as usize) % self.capacity;
        let evicted = st.slots[slot].take();
        st.slots[slot] = Some(frame);
        st.count = id + 1;
        self.arrived.notify_all();
        evicted
    }

    /// Non-blocking: returns a clone of the newest published frame, or
    /// `None` if the ring is still empty.
    pub fn latest(&self) -> Option<Frame> {
        let st = self.state.lock().unwrap();
        if st.count == 0 {
            return None;
        }
        let slot = ((st.count - 1) as usize) % self.capacity;
        st.slots[slot].clone()
    }

    /// Returns the first frame with `id > seen_id`. When `blocking`,
    /// waits on the arrival condition (honouring `deadline` if given);
    /// otherwise returns `None` immediately if nothing new is ready.
    pub fn next(&self, seen_id: Option<u64>, blocking: bool, deadline: Option<Duration>) -> Option<Frame> {
        let mut st = self.state.lock().unwrap();
        loop {
            let want = seen_id.map(|s| s + 1).unwrap_or(0);
            if st.count > want {
                let slot = (want as usize) % self.capacity;
                if let Some(f) = &st.slots[slot] {
                    if f.id == want {
                        return Some(f.clone());
                    }
                }
                // The slot has been overwritten by a newer frame: the
                // requested id is gone, fall through to "too old".
                return None;
            }
            if !blocking {
                return None;
            }
            let wait_for = deadline.unwrap_or(Duration::from_secs(3600));
            let (guard, timeout) = self.arrived.wait_timeout(st, wait_for).unwrap();
            st = guard;
            if timeout.timed_out() && deadline.is_some() {
                return None;
            }
        }
    }

    /// Returns slot `id mod N` iff it still holds that exact id.
    /// Fails (returns `None`) when `id` is too old (`< count - N`) or
    /// not yet produced (`id >= count`) and `blocking` is false.
    pub fn get(&self, id: u64, blocking: bool, deadline: Option<Duration>) -> Option<Frame> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.count > self.capacity as u64 && id < st.count - self.capacity as u64 {
                return None; // too old
            }
            if id < st.count {
                let slot = (id as usize) % self.capacity;
                return st.slots[slot].as_ref().filter(|f| f.id == id).cloned();
            }
            if !blocking {
                return None;
            }
            let wait_for = deadline.unwrap_or(Duration::from_secs(3600));
            let (guard, timeout) = self.arrived.wait_timeout(st, wait_for).unwrap();
            st = guard;
            if timeout.timed_out() && deadline.is_some() {
                return None;
            }
        }
    }

    pub fn latest_id(&self) -> Option<u64> {
        let st = self.state.lock().unwrap();
        if st.count == 0 {
            None
        } else {
            Some(st.count - 1)
        }
    }
}

pub type SharedFrameRing = Arc<FrameRing>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Depth;
    use std::thread;

    fn mkframe(id: u64) -> Frame {
        Frame::new(id, 2, 2, Depth::U8, vec![id as u8; 4])
    }

    #[test]
    fn strictly_increasing_and_overflow_is_null() {
        let ring = FrameRing::new(8);
        for id in 0..20u64 {
            ring.queue(mkframe(id));
        }
        // id 0 is long gone (20 - 8 = 12 is the oldest retained).
        assert!(ring.get(0, false, None).is_none());
        assert!(ring.get(12, false, None).is_some());
        assert_eq!(ring.latest_id(), Some(19));
    }

    #[test]
    fn next_returns_strictly_increasing_ids() {
        let ring = Arc::new(FrameRing::new(8));
        let r2 = ring.clone();
        let producer = thread::spawn(move || {
            for id in 0..50u64 {
                r2.queue(mkframe(id));
                thread::sleep(Duration::from_micros(200));
            }
        });
        let mut seen = None;
        let mut got = Vec::new();
        while got.len() < 50 {
            if let Some(f) = ring.next(seen, true, Some(Duration::from_secs(2))) {
                seen = Some(f.id);
                got.push(f.id);
            }
        }
        producer.join().unwrap();
        for w in got.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn ring_overflow_while_consumer_sleeps() {
        // S5: N=8, consumer lags by exactly N frames, id=0 must be null.
        let ring = FrameRing::new(8);
        for id in 0..16u64 {
            ring.queue(mkframe(id));
        }
        assert!(ring.get(0, false, None).is_none());
    }
}
