//! Long-lived per-destination state.
//!
//! A [`Peer`] exists for every host we have communicated with, as client
//! or server. Peers cache the unscheduled-priority cutoffs advertised by
//! the host and carry the backlog of acks waiting to be piggybacked on
//! outgoing packets. The table is read on every packet, so lookups go
//! through a concurrent map; eviction is a slow-path sweep from the timer.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use dashmap::DashMap;

use crate::type_alias::*;
use crate::wire::{HomaAck, HOMA_MAX_ACKS_PER_PKT, HOMA_MAX_PRIORITIES};

/// State for one remote host.
pub(crate) struct Peer {
    /// Canonical (IPv6) address of the host.
    pub addr: Ipv6Addr,

    /// Time (ns) of the most recent use of this peer; drives GC.
    pub access_ns: AtomicU64,

    /// `cutoff_version` from the most recent CUTOFFS packet received from
    /// this host; 0 means none has arrived yet.
    pub cutoff_version: AtomicU32,

    /// Priorities to use for unscheduled packets sent to this host, as
    /// advertised in its most recent CUTOFFS packet.
    pub unsched_cutoffs: Mutex<[u32; HOMA_MAX_PRIORITIES]>,

    /// Timer tick when we last sent a CUTOFFS packet to this host; used
    /// to avoid flooding a sender whose stream carries a stale version.
    pub last_cutoffs_tick: AtomicU32,

    /// RESENDs sent to this host (spaced `resend_interval` apart) since
    /// the last packet arrived from it.
    pub outstanding_resends: AtomicU32,

    /// Number of this peer's messages currently holding a slot in the
    /// grant scheduler's active set. Only mutated under the grant lock.
    pub active_rpcs: AtomicUsize,

    /// Pending acks to piggyback on the next outgoing packet; bounded at
    /// [`HOMA_MAX_ACKS_PER_PKT`].
    acks: Mutex<Vec<HomaAck>>,
}

impl Peer {
    fn new(addr: Ipv6Addr, now_ns: u64) -> Self {
        let mut cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        /* Until the host tells us otherwise, send everything at the
         * highest priority (entry 0 catches all message sizes).
         */
        cutoffs[HOMA_MAX_PRIORITIES - 1] = u32::MAX;
        Peer {
            addr,
            access_ns: AtomicU64::new(now_ns),
            cutoff_version: AtomicU32::new(0),
            unsched_cutoffs: Mutex::new(cutoffs),
            last_cutoffs_tick: AtomicU32::new(u32::MAX),
            outstanding_resends: AtomicU32::new(0),
            active_rpcs: AtomicUsize::new(0),
            acks: Mutex::new(Vec::new()),
        }
    }

    /// Append an ack for a completed client RPC, to ride along on the
    /// next outgoing packet to this host. If the backlog is full, the
    /// entire batch (including the new ack) is returned and must be sent
    /// as an explicit ACK packet by the caller.
    pub fn add_ack(&self, id: RpcId, server_port: Port) -> Option<Vec<HomaAck>> {
        let mut acks = self.acks.lock().unwrap();
        if acks.len() < HOMA_MAX_ACKS_PER_PKT {
            acks.push(HomaAck {
                client_id: id,
                server_port,
            });
            return None;
        }
        let mut flush = std::mem::take(&mut *acks);
        flush.push(HomaAck {
            client_id: id,
            server_port,
        });
        Some(flush)
    }

    /// Remove and return up to `count` pending acks.
    pub fn get_acks(&self, count: usize) -> Vec<HomaAck> {
        let mut acks = self.acks.lock().unwrap();
        let keep = acks.len().saturating_sub(count);
        acks.split_off(keep)
    }

    /// Install a new cutoff table received from this host.
    pub fn set_cutoffs(&self, cutoffs: &[u32; HOMA_MAX_PRIORITIES], version: u16) {
        *self.unsched_cutoffs.lock().unwrap() = *cutoffs;
        self.cutoff_version.store(version as u32, Ordering::Release);
    }

    /// Forget the peer's cutoff version so the next DATA packet from it
    /// triggers a fresh CUTOFFS exchange.
    pub fn mark_cutoffs_stale(&self) {
        self.last_cutoffs_tick.store(u32::MAX, Ordering::Relaxed);
    }

    #[inline]
    pub fn touch(&self, now_ns: u64) {
        self.access_ns.store(now_ns, Ordering::Relaxed);
    }
}

/// All the peers this transport instance has communicated with, keyed by
/// canonical address. Reads are lock-free; eviction happens in
/// [`PeerTable::gc`], and a peer is only dropped when nothing else holds
/// a reference to it.
pub(crate) struct PeerTable {
    peers: DashMap<Ipv6Addr, Arc<Peer>, RandomState>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            peers: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Find the peer for `addr`, creating it on first contact.
    pub fn find_or_create(&self, addr: Ipv6Addr, now_ns: u64) -> Arc<Peer> {
        if let Some(peer) = self.peers.get(&addr) {
            peer.touch(now_ns);
            return peer.clone();
        }
        let peer = self
            .peers
            .entry(addr)
            .or_insert_with(|| Arc::new(Peer::new(addr, now_ns)))
            .clone();
        peer.touch(now_ns);
        peer
    }

    pub fn get(&self, addr: &Ipv6Addr) -> Option<Arc<Peer>> {
        self.peers.get(addr).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Evict peers that have been idle longer than `idle_max_ns`, but
    /// only while the table holds more than `threshold` entries and only
    /// if no RPC still references the peer.
    pub fn gc(&self, now_ns: u64, threshold: usize, idle_max_ns: u64) {
        let mut excess = self.peers.len().saturating_sub(threshold);
        if excess == 0 {
            return;
        }
        self.peers.retain(|_, peer| {
            if excess == 0 {
                return true;
            }
            let idle = now_ns.saturating_sub(peer.access_ns.load(Ordering::Relaxed));
            if idle < idle_max_ns {
                return true;
            }
            /* A count of 1 means the table holds the only reference, so
             * no RPC can be using the peer.
             */
            if Arc::strong_count(peer) > 1 {
                return true;
            }
            log::debug!("peer gc: evicting idle peer {}", peer.addr);
            excess -= 1;
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(x: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, x)
    }

    #[test]
    fn test_find_or_create_returns_same_peer() {
        let tab = PeerTable::new();
        let a = tab.find_or_create(addr(1), 0);
        let b = tab.find_or_create(addr(1), 10);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn test_ack_backlog_flushes_when_full() {
        let peer = Peer::new(addr(1), 0);
        for i in 0..HOMA_MAX_ACKS_PER_PKT {
            assert!(peer.add_ack(2 * i as RpcId, 99).is_none());
        }
        let flush = peer.add_ack(1000, 99).expect("backlog should overflow");
        assert_eq!(flush.len(), HOMA_MAX_ACKS_PER_PKT + 1);
        assert!(peer.get_acks(5).is_empty());
    }

    #[test]
    fn test_get_acks_drains_most_recent_first_batch() {
        let peer = Peer::new(addr(1), 0);
        peer.add_ack(2, 1);
        peer.add_ack(4, 1);
        assert_eq!(peer.get_acks(1).len(), 1);
        assert_eq!(peer.get_acks(5).len(), 1);
    }

    #[test]
    fn test_mark_cutoffs_stale_clears_rate_limit() {
        let peer = Peer::new(addr(1), 0);
        /* Pretend a CUTOFFS was just sent this tick... */
        assert_ne!(peer.last_cutoffs_tick.swap(7, Ordering::AcqRel), 7);
        assert_eq!(peer.last_cutoffs_tick.swap(7, Ordering::AcqRel), 7);
        /* ...then force the next mismatch to resend regardless. */
        peer.mark_cutoffs_stale();
        assert_ne!(peer.last_cutoffs_tick.swap(7, Ordering::AcqRel), 7);
    }

    #[test]
    fn test_gc_spares_busy_and_recent_peers() {
        let tab = PeerTable::new();
        let held = tab.find_or_create(addr(1), 0);
        tab.find_or_create(addr(2), 0);
        tab.find_or_create(addr(3), 1_000_000_000);
        /* threshold 0 forces a sweep; only the idle unreferenced peer
         * (addr 2) may go.
         */
        tab.gc(2_000_000_000, 0, 1_500_000_000);
        assert!(tab.get(&addr(1)).is_some());
        assert!(tab.get(&addr(2)).is_none());
        assert!(tab.get(&addr(3)).is_some());
        drop(held);
    }
}
