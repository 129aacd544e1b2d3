//! The subscription manager: owns the set of rooms the coordinator has
//! asked us to watch, fans new rooms out across [`pool::PoolHandle`]s, and
//! enforces the overall room cap.
//!
//! Grounded on `original_source/dm_manager.py` (`DManager.add_room`,
//! `is_available`, `_clean_dead_rooms`, the list of `DManager` instances it
//! rotates through).

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::IpFamily;
use crate::http_job::build_client;
use crate::outbound::OutboundSender;
use crate::pool::PoolHandle;

/// Tracks which rooms are currently subscribed and owns the pools that run
/// them. Not `Clone`: there is exactly one manager per control-client
/// session, and it outlives individual reconnects.
pub struct SubscriptionManager {
    pools: Vec<PoolHandle>,
    watched: HashSet<u64>,
    http: reqwest::Client,
    room_cap: u64,
    closed_tx: mpsc::UnboundedSender<u64>,
    closed_rx: mpsc::UnboundedReceiver<u64>,
}

impl SubscriptionManager {
    pub fn new(ip_family: IpFamily, room_cap: u64) -> anyhow::Result<Self> {
        let http = build_client(ip_family)?;
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Ok(Self {
            pools: Vec::new(),
            watched: HashSet::new(),
            http,
            room_cap,
            closed_tx,
            closed_rx,
        })
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn is_watching(&self, room_id: u64) -> bool {
        self.watched.contains(&room_id)
    }

    /// Drain every room id a pool's sweep has reported dead since the last
    /// call and drop it from the watched set, freeing room-cap headroom.
    /// Cheap and non-blocking; call before gating anything on
    /// `watched_count`, per spec.md §4.3/§7 (the sweep frees capacity so the
    /// pull loop can eventually request a new pick).
    pub fn reap_closed(&mut self) {
        while let Ok(room_id) = self.closed_rx.try_recv() {
            if self.watched.remove(&room_id) {
                info!(room_id, total = self.watched.len(), "room subscription closed, freed slot");
            }
        }
    }

    /// Subscribe to `room_id` if not already watched and the cap allows it.
    /// Returns `false` (without erroring) when the cap is full, since a full
    /// cap is routine operating state, not a failure.
    pub fn watch(&mut self, room_id: u64, outbound: &OutboundSender) -> bool {
        self.reap_closed();

        if self.watched.contains(&room_id) {
            return true;
        }
        if self.watched.len() as u64 >= self.room_cap {
            warn!(room_id, cap = self.room_cap, "room cap reached, dropping subscribe request");
            return false;
        }

        let pool = self.pool_with_room();
        pool.watch(room_id, self.http.clone(), outbound.clone());
        self.watched.insert(room_id);
        info!(room_id, total = self.watched.len(), "subscribed to room");
        true
    }

    /// Find a pool with spare capacity, spawning a new one if every existing
    /// pool is at [`pool::PER_POOL_CAP`]. Mirrors `dm_manager.py`'s linear
    /// scan over its `DManager` list plus lazy creation of a new one.
    fn pool_with_room(&mut self) -> &PoolHandle {
        if let Some(idx) = self.pools.iter().position(|p| p.available()) {
            return &self.pools[idx];
        }
        self.pools.push(PoolHandle::spawn(self.closed_tx.clone()));
        self.pools.last().expect("just pushed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_room_cap() {
        let mut manager = SubscriptionManager::new(IpFamily::Both, 2).unwrap();
        let (tx, _rx) = crate::outbound::channel();
        assert!(manager.watch(1, &tx));
        assert!(manager.watch(2, &tx));
        assert!(!manager.watch(3, &tx));
        assert_eq!(manager.watched_count(), 2);
    }

    #[test]
    fn watching_same_room_twice_is_idempotent() {
        let mut manager = SubscriptionManager::new(IpFamily::Both, 5).unwrap();
        let (tx, _rx) = crate::outbound::channel();
        assert!(manager.watch(1, &tx));
        assert!(manager.watch(1, &tx));
        assert_eq!(manager.watched_count(), 1);
    }

    #[test]
    fn reaping_a_closed_room_frees_its_cap_slot() {
        let mut manager = SubscriptionManager::new(IpFamily::Both, 1).unwrap();
        let (tx, _rx) = crate::outbound::channel();
        assert!(manager.watch(1, &tx));
        assert!(!manager.watch(2, &tx));

        manager.closed_tx.send(1).unwrap();
        manager.reap_closed();

        assert_eq!(manager.watched_count(), 0);
        assert!(manager.watch(2, &tx));
    }
}
