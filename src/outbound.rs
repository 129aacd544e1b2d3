//! The outbound serializer: the single multi-producer sink every component
//! (HTTP workers, room subscriptions, pull loops) enqueues into. Exactly one
//! task ever writes to the control websocket, which is what prevents
//! interleaved partial frames under N concurrent producers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use futures_util::SinkExt;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

/// Priority 0 = real-time relay (broadcast events); anything else is bulk.
pub const PRIORITY_RELAY: i32 = 0;
pub const PRIORITY_BULK: i32 = 1;

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub priority: i32,
    pub payload: String,
}

/// Wraps a message with a monotonic sequence number so the heap can break
/// priority ties by insertion order (equal-priority messages are never
/// reordered, per spec.md §5).
struct Ordered {
    priority: i32,
    sequence: u64,
    payload: String,
}

impl PartialEq for Ordered {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Ordered {}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert both fields so lowest priority
        // (and, within a priority, earliest insertion) pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Handle producers use to enqueue outbound messages. Cheap to clone and
/// survives control-channel reconnects — only the serializer task is torn
/// down and recreated against the new socket.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Ordered>,
    sequence: std::sync::Arc<AtomicU64>,
}

impl OutboundSender {
    pub fn send(&self, priority: i32, payload: String) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        if self
            .tx
            .send(Ordered {
                priority,
                sequence,
                payload,
            })
            .is_err()
        {
            warn!("outbound queue closed, dropping message");
        }
    }
}

/// Owns the priority heap and the websocket sink. One instance per
/// connection generation; recreated on every reconnect.
pub struct OutboundSerializer {
    rx: mpsc::UnboundedReceiver<Ordered>,
    heap: BinaryHeap<Ordered>,
}

pub fn channel() -> (OutboundSender, OutboundSerializer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        OutboundSender {
            tx,
            sequence: std::sync::Arc::new(AtomicU64::new(0)),
        },
        OutboundSerializer {
            rx,
            heap: BinaryHeap::new(),
        },
    )
}

impl OutboundSerializer {
    /// Synchronously pull whatever has been enqueued so far and return the
    /// highest-priority message, if any. Used by tests that assert on a
    /// producer's enqueued payload without running the full serializer loop.
    pub fn try_drain_one(&mut self) -> Option<String> {
        while let Ok(msg) = self.rx.try_recv() {
            self.heap.push(msg);
        }
        self.heap.pop().map(|m| m.payload)
    }

    /// Drain the queue onto `sink` until the channel closes or the sink
    /// write fails. Returns on either; the caller decides whether that
    /// means "reconnect" or "shut down".
    pub async fn run<S>(mut self, sink: &Mutex<S>)
    where
        S: futures_util::Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        loop {
            // Drain everything currently queued before picking the next
            // message, so priority ordering is enforced across bursts.
            while let Ok(msg) = self.rx.try_recv() {
                self.heap.push(msg);
            }

            let next = match self.heap.pop() {
                Some(msg) => msg,
                None => match self.rx.recv().await {
                    Some(msg) => msg,
                    None => return,
                },
            };

            let mut guard = sink.lock().await;
            if let Err(e) = guard.send(Message::Text(next.payload)).await {
                error!("outbound write failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_pops_lowest_priority_first() {
        let mut heap = BinaryHeap::new();
        heap.push(Ordered {
            priority: PRIORITY_BULK,
            sequence: 0,
            payload: "bulk".into(),
        });
        heap.push(Ordered {
            priority: PRIORITY_RELAY,
            sequence: 1,
            payload: "relay".into(),
        });
        assert_eq!(heap.pop().unwrap().payload, "relay");
        assert_eq!(heap.pop().unwrap().payload, "bulk");
    }

    #[test]
    fn equal_priority_breaks_ties_by_insertion_order() {
        let mut heap = BinaryHeap::new();
        for i in 0..5u64 {
            heap.push(Ordered {
                priority: PRIORITY_BULK,
                sequence: i,
                payload: i.to_string(),
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|m| m.payload)).collect();
        assert_eq!(order, vec!["0", "1", "2", "3", "4"]);
    }
}
