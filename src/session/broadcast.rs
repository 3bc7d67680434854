//! Tag-based pub-sub fan-out (spec.md §4.8 "tag mechanism").
//!
//! A client subscribes to named tags (`exposure`, `mode`, `mla`, ...);
//! `publish` only reaches clients holding the matching tag, so one
//! verbose device doesn't flood every connected GUI. Grounded on
//! `dos_actors`'s `flume`-channel-per-subscriber fan-out
//! (`examples/Cdribusch-dos-actors/src/io.rs` `Output::senders`), with
//! `crossbeam-channel` in place of `flume` per the other example repos'
//! choice for plain OS-thread pub-sub.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

struct Client {
    sender: Sender<String>,
    tags: HashSet<String>,
}

/// Process-wide broadcast registry: one entry per connected client.
pub struct Broadcaster {
    clients: Mutex<HashMap<u64, Client>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a new client, returning its id and the receiving end
    /// of its outgoing line queue.
    pub fn register(&self) -> (u64, Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded();
        self.clients.lock().unwrap().insert(
            id,
            Client {
                sender: tx,
                tags: HashSet::new(),
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.lock().unwrap().remove(&id);
    }

    pub fn subscribe(&self, id: u64, tag: &str) {
        if let Some(c) = self.clients.lock().unwrap().get_mut(&id) {
            c.tags.insert(tag.to_string());
        }
    }

    pub fn unsubscribe(&self, id: u64, tag: &str) {
        if let Some(c) = self.clients.lock().unwrap().get_mut(&id) {
            c.tags.remove(tag);
        }
    }

    /// Sends `line` to every client subscribed to `tag`. A closed
    /// client channel is pruned silently (spec.md §5 "pending
    /// broadcasts to a closed connection are dropped silently").
    pub fn publish(&self, tag: &str, line: &str) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|_, c| {
            if c.tags.contains(tag) {
                c.sender.send(line.to_string()).is_ok()
            } else {
                true
            }
        });
    }

    /// Sends `line` to a single client, ignoring a closed channel.
    pub fn send_to(&self, id: u64, line: &str) {
        if let Some(c) = self.clients.lock().unwrap().get(&id) {
            let _ = c.sender.send(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_only_subscribed_clients() {
        let b = Broadcaster::new();
        let (a_id, a_rx) = b.register();
        let (b_id, b_rx) = b.register();
        b.subscribe(a_id, "mode");
        b.publish("mode", "ok mode closed");
        assert_eq!(a_rx.try_recv().unwrap(), "ok mode closed");
        assert!(b_rx.try_recv().is_err());
        let _ = b_id;
    }

    #[test]
    fn unregistered_client_is_dropped_from_future_publishes() {
        let b = Broadcaster::new();
        let (id, rx) = b.register();
        b.subscribe(id, "mla");
        drop(rx);
        b.publish("mla", "ok mla 3");
        assert!(b.clients.lock().unwrap().is_empty());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let b = Broadcaster::new();
        let (id, rx) = b.register();
        b.subscribe(id, "exposure");
        b.unsubscribe(id, "exposure");
        b.publish("exposure", "ok exposure 0.01");
        assert!(rx.try_recv().is_err());
    }
}
