//! A subscription pool: a cooperative scheduler hosting up to
//! `PER_POOL_CAP` rooms on a dedicated OS thread, so hundreds of rooms can
//! share few OS threads without one failing room blocking the rest.
//!
//! Grounded on `original_source/dm_manager.py`'s `DManager` — "a thread
//! with its own event loop" — the latest revision per SPEC_FULL.md §9(b).

use std::sync::Arc;

use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::outbound::OutboundSender;
use crate::room::{self, RoomSubscription};

pub const PER_POOL_CAP: usize = 50;

enum PoolCommand {
    Watch {
        room_id: u64,
        http: reqwest::Client,
        outbound: OutboundSender,
    },
    Shutdown,
}

/// A handle to a pool running on its own OS thread. Talking to the pool is
/// always a message send — the manager never touches a pool's room list
/// directly, per the "coroutine fan-out" design note.
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolCommand>,
    size: Arc<std::sync::atomic::AtomicUsize>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PoolHandle {
    /// `closed_tx` is how the pool's sweep reports a room whose connection
    /// died permanently, so the owning manager can drop it from its watched
    /// set and free up room-cap headroom for the next pick.
    pub fn spawn(closed_tx: mpsc::UnboundedSender<u64>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let size = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let thread_size = size.clone();

        let thread = std::thread::Builder::new()
            .name("subscription-pool".into())
            .spawn(move || run_pool(rx, thread_size, closed_tx))
            .expect("failed to spawn subscription pool thread");

        Self {
            tx,
            size,
            thread: Some(thread),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn available(&self) -> bool {
        self.size() < PER_POOL_CAP
    }

    pub fn watch(&self, room_id: u64, http: reqwest::Client, outbound: OutboundSender) {
        let _ = self.tx.send(PoolCommand::Watch {
            room_id,
            http,
            outbound,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PoolCommand::Shutdown);
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The pool's own cooperative scheduler: a current-thread tokio runtime, so
/// room futures run on this dedicated thread and never compete with the
/// control client's scheduler.
fn run_pool(
    mut rx: mpsc::UnboundedReceiver<PoolCommand>,
    size: Arc<std::sync::atomic::AtomicUsize>,
    closed_tx: mpsc::UnboundedSender<u64>,
) {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build pool runtime");

    rt.block_on(async move {
        let mut rooms: Vec<RoomSubscription> = Vec::new();
        let mut sweep = tokio::time::interval(std::time::Duration::from_millis(1000));

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(PoolCommand::Watch { room_id, http, outbound }) => {
                            let sub = room::spawn(room_id, http, outbound).await;
                            rooms.push(sub);
                            size.store(rooms.len(), std::sync::atomic::Ordering::Relaxed);
                            debug!(room_id, "pool now watching room");
                        }
                        Some(PoolCommand::Shutdown) | None => {
                            for room in &rooms {
                                room.close();
                            }
                            return;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let before = rooms.len();
                    for room in rooms.iter().filter(|r| r.is_closed()) {
                        let _ = closed_tx.send(room.room_id);
                    }
                    rooms.retain(|r| !r.is_closed());
                    if rooms.len() != before {
                        warn!(dropped = before - rooms.len(), "swept dead rooms from pool");
                    }
                    size.store(rooms.len(), std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pool_is_available() {
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let pool = PoolHandle::spawn(closed_tx);
        assert!(pool.available());
        assert_eq!(pool.size(), 0);
        pool.shutdown();
    }
}
