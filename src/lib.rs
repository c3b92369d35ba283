//! A message-oriented, receiver-driven transport engine for
//! intra-datacenter RPC traffic.
//!
//! The crate implements the in-host protocol machinery: RPC state and
//! lookup, the socket/port namespace, receive-side grant scheduling,
//! the SRPT output pacer, per-message reassembly into receive-buffer
//! pools, and retransmission/timeout handling. Delivery of datagrams to
//! and from the network is left to a [`PacketSink`] implementation plus
//! calls into [`Homa::deliver`].

mod config;
mod error;
mod grant;
mod incoming;
mod interest;
mod net;
mod outgoing;
mod pacer;
mod peer;
mod plumbing;
mod pool;
mod rpc;
mod sock;
mod timer;
mod type_alias;
mod wire;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub use self::config::HomaConfig;
pub use self::error::{HomaError, Result};
pub use self::net::{canonical_addr, PacketSink};
pub use self::plumbing::{
    RecvmsgArgs, SendmsgArgs, HOMA_RECVMSG_NONBLOCKING, HOMA_SENDMSG_NONBLOCKING,
    HOMA_SENDMSG_PRIVATE,
};
pub use self::pool::{HOMA_BPAGE_SIZE, HOMA_MAX_BPAGES};
pub use self::sock::{PollEvents, Socket, HOMA_MIN_DEFAULT_PORT};
pub use self::type_alias::{is_client, Port, RpcId};
pub use self::wire::{
    local_id, CommonHeader, DataHeader, HomaAck, Packet, PacketBody, PacketType,
    HOMA_MAX_ACKS_PER_PKT, HOMA_MAX_MESSAGE_LENGTH, HOMA_MAX_PRIORITIES, IPPROTO_HOMA,
};

/// ICMP error categories relevant to the transport, as delivered by the
/// host's error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpError {
    /// Destination port unreachable: nothing is listening.
    PortUnreachable,

    /// The peer does not speak this protocol.
    ProtocolUnreachable,

    /// Host or address unreachable.
    HostUnreachable,
}

impl IpError {
    fn rpc_error(self) -> HomaError {
        match self {
            IpError::PortUnreachable => HomaError::NotConnected,
            IpError::ProtocolUnreachable => HomaError::ProtoUnsupported,
            IpError::HostUnreachable => HomaError::HostUnreachable,
        }
    }
}

/// One instance of the transport (one per network namespace). Owns the
/// socket table, peer table, grant scheduler, and pacer; sockets are
/// created through [`Homa::socket`].
pub struct Homa {
    pub(crate) config: HomaConfig,
    pub(crate) sink: Arc<dyn PacketSink>,

    clock: quanta::Clock,
    epoch: quanta::Instant,

    /// Id for the next outgoing RPC request; even, monotonic.
    pub(crate) next_outgoing_id: AtomicU64,

    pub(crate) socktab: sock::Socktab,
    pub(crate) peers: peer::PeerTable,
    pub(crate) grant: grant::GrantState,
    pub(crate) pacer: pacer::Pacer,

    /// Number of timer ticks so far (may wrap).
    pub(crate) timer_ticks: AtomicU32,

    destroyed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Homa {
    /// Create a transport instance that transmits through `sink`.
    /// Background threads are not started until [`Homa::start`].
    pub fn new(mut config: HomaConfig, sink: Arc<dyn PacketSink>) -> Arc<Homa> {
        config.validate();
        let clock = quanta::Clock::new();
        let epoch = clock.now();
        Arc::new(Homa {
            grant: grant::GrantState::new(&config),
            pacer: pacer::Pacer::new(),
            config,
            sink,
            clock,
            epoch,
            next_outgoing_id: AtomicU64::new(2),
            socktab: sock::Socktab::new(),
            peers: peer::PeerTable::new(),
            timer_ticks: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Monotonic nanoseconds since this instance was created.
    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.epoch).as_nanos() as u64
    }

    /// Open a socket with an automatically assigned default port.
    pub fn socket(self: &Arc<Self>) -> Result<Arc<Socket>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(HomaError::Shutdown);
        }
        Socket::create(self)
    }

    /// Spawn the pacer and timer threads.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        let pacer_homa = self.clone();
        workers.push(std::thread::spawn(move || {
            pacer::main_loop(&pacer_homa);
        }));
        let timer_homa = self.clone();
        workers.push(std::thread::spawn(move || {
            while !timer_homa.destroyed.load(Ordering::Acquire) {
                timer::tick(&timer_homa);
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }));
    }

    /// Run one timer tick by hand (tests and hosts with their own tick
    /// source).
    pub fn tick(&self) {
        timer::tick(self);
    }

    /// Entry point for packets arriving from the IP layer.
    pub fn deliver(&self, src: IpAddr, pkt: Packet) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        incoming::dispatch(self, canonical_addr(src), pkt);
    }

    /// Map an inbound ICMP error onto the RPCs it affects: every RPC
    /// addressed to `dst` (and `dport`, unless 0) fails with the
    /// corresponding error.
    pub fn ip_error(&self, dst: IpAddr, dport: Port, kind: IpError) {
        rpc::abort_rpcs(self, canonical_addr(dst), dport, kind.rpc_error());
    }

    /// Stop background threads and shut down every socket.
    pub fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pacer.stop();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
        for sock in self.socktab.all() {
            sock.shutdown();
        }
    }
}

#[cfg(test)]
mod tests;
