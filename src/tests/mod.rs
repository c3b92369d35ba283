#![allow(unused_imports)]

//! End-to-end tests over an in-memory network: each "host" is a Homa
//! instance whose packets travel through a shared queue, so tests can
//! interleave, drop, and inspect traffic deterministically. The timer
//! is driven by hand.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use simple_logger::SimpleLogger;

use super::*;
use crate::wire::PacketType;

mod grants;
mod pacing;
mod sockets;

pub(self) fn init_logging() {
    let _ = SimpleLogger::new().with_level(log::LevelFilter::Info).init();
}

/// One packet as emitted by a host (recorded before any drop filter).
#[derive(Clone)]
pub(self) struct SentRecord {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub pkt: Packet,
    pub priority: u8,
}

type DropFilter = Box<dyn FnMut(Ipv6Addr, &Packet) -> bool + Send>;

struct NetInner {
    hosts: Mutex<HashMap<Ipv6Addr, Arc<Homa>>>,
    tx: Sender<(Ipv6Addr, Ipv6Addr, Packet)>,
    rx: Receiver<(Ipv6Addr, Ipv6Addr, Packet)>,
    sent: Mutex<Vec<SentRecord>>,
    drop_filter: Mutex<Option<DropFilter>>,
}

/// Outgoing side of one host: queues packets on the shared network.
struct HostSink {
    addr: Ipv6Addr,
    net: Arc<NetInner>,
}

impl PacketSink for HostSink {
    fn send(&self, dst: Ipv6Addr, pkt: Packet, priority: u8) {
        self.net.sent.lock().unwrap().push(SentRecord {
            src: self.addr,
            dst,
            pkt: pkt.clone(),
            priority,
        });
        let _ = self.net.tx.send((self.addr, dst, pkt));
    }
}

pub(self) struct TestNet {
    inner: Arc<NetInner>,
}

impl TestNet {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        TestNet {
            inner: Arc::new(NetInner {
                hosts: Mutex::new(HashMap::new()),
                tx,
                rx,
                sent: Mutex::new(Vec::new()),
                drop_filter: Mutex::new(None),
            }),
        }
    }

    /// Address of test host `n` (fd00::n).
    pub fn addr(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, n)
    }

    /// Bring up host `n` with the given configuration.
    pub fn host(&self, n: u16, config: HomaConfig) -> Arc<Homa> {
        let addr = Self::addr(n);
        let sink = Arc::new(HostSink {
            addr,
            net: self.inner.clone(),
        });
        let homa = Homa::new(config, sink);
        self.inner.hosts.lock().unwrap().insert(addr, homa.clone());
        homa
    }

    fn route(&self, batch: Vec<(Ipv6Addr, Ipv6Addr, Packet)>) -> usize {
        let mut delivered = 0;
        for (src, dst, pkt) in batch {
            if let Some(filter) = self.inner.drop_filter.lock().unwrap().as_mut() {
                if filter(dst, &pkt) {
                    continue;
                }
            }
            let host = self.inner.hosts.lock().unwrap().get(&dst).cloned();
            if let Some(host) = host {
                host.deliver(IpAddr::V6(src), pkt);
                delivered += 1;
            }
        }
        delivered
    }

    /// Route the packets queued right now (not ones generated while
    /// delivering). Returns the number delivered.
    pub fn deliver_step(&self) -> usize {
        let batch: Vec<(Ipv6Addr, Ipv6Addr, Packet)> = self.inner.rx.try_iter().collect();
        self.route(batch)
    }

    /// Like [`TestNet::deliver_step`], but the batch lands in a random
    /// order (the in-flight packets of a reordering network).
    pub fn deliver_step_shuffled(&self, rng: &mut StdRng) -> usize {
        let mut batch: Vec<(Ipv6Addr, Ipv6Addr, Packet)> = self.inner.rx.try_iter().collect();
        batch.shuffle(rng);
        self.route(batch)
    }

    /// Route packets until the network is quiescent. Returns the number
    /// delivered.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let step = self.deliver_step();
            if step == 0 {
                return delivered;
            }
            delivered += step;
        }
    }

    /// Install a predicate that drops matching packets in transit
    /// (return true to drop).
    pub fn set_drop<F>(&self, filter: F)
    where
        F: FnMut(Ipv6Addr, &Packet) -> bool + Send + 'static,
    {
        *self.inner.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// Snapshot of every packet emitted so far (before drops).
    pub fn sent(&self) -> Vec<SentRecord> {
        self.inner.sent.lock().unwrap().clone()
    }
}

/// A buffer region holding `n` bpages.
pub(self) fn region(n: usize) -> Vec<u8> {
    vec![0u8; n * HOMA_BPAGE_SIZE]
}

/// A socket ready for traffic: buffer region installed, optionally
/// server-enabled and bound.
pub(self) fn ready_socket(homa: &Arc<Homa>, bind_port: Option<Port>) -> Arc<Socket> {
    let sock = homa.socket().expect("socket creation failed");
    sock.set_buffer_region(region(64)).unwrap();
    if let Some(port) = bind_port {
        sock.bind(port).unwrap();
        sock.set_server(true);
    }
    sock
}

/// A payload whose bytes identify their offsets, so reassembly bugs
/// show up as content mismatches.
pub(self) fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
