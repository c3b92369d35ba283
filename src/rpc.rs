//! RPC state: the central entity of the transport.
//!
//! One [`Rpc`] exists for each active request/response pair, managing
//! both the outgoing message (the request on clients, the response on
//! servers) and the incoming one. RPCs are reachable through exactly one
//! hash bucket of exactly one socket; all mutable state sits behind the
//! per-RPC lock. Ending an RPC only makes it unreachable; resources are
//! released later by the reaper.

use std::collections::VecDeque;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HomaError, Result};
use crate::grant;
use crate::interest::{self, Interest};
use crate::pacer;
use crate::peer::Peer;
use crate::sock::Socket;
use crate::type_alias::*;
use crate::wire::{DataHeader, HomaAck};
use crate::Homa;

/* Bits for Rpc::flags. */

/// The RPC has input packets ready to be copied to buffer space.
pub(crate) const RPC_PKTS_READY: u32 = 1;

/// The RPC will be waited on in "private" mode: only a recv naming this
/// id may receive it.
pub(crate) const RPC_PRIVATE: u32 = 8;

/// Lifecycle of an RPC.
///
/// Client RPCs move Outgoing → Incoming → Dead; server RPCs move
/// Incoming → InService → Outgoing → Dead. Any state can reach Dead
/// through abort, shutdown, or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcState {
    /// Waiting for the outgoing message to be transmitted.
    Outgoing,

    /// Waiting for incoming message data; at least one packet has
    /// arrived (clients enter on the first response byte).
    Incoming,

    /// Server only: the request has been read by the application but the
    /// response has not yet been presented.
    InService,

    /// Unreachable from the active tables; waiting for the reaper.
    Dead,
}

/// A contiguous segment of message payload (one DATA packet's worth).
#[derive(Debug, Clone)]
pub(crate) struct DataSegment {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// A range of bytes within an incoming message that has not yet arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Gap {
    /// Offset of the first missing byte.
    pub start: usize,

    /// Offset just after the last missing byte.
    pub end: usize,
}

/// The message this host is receiving for an RPC (the request on
/// servers, the response on clients).
#[derive(Debug)]
pub(crate) struct MsgIn {
    /// Payload size in bytes.
    pub length: usize,

    /// Packets received but not yet copied into buffer space.
    pub packets: VecDeque<DataSegment>,

    /// Offset just after the highest byte received so far.
    pub recv_end: usize,

    /// All missing ranges below `recv_end`, in increasing offset order.
    pub gaps: Vec<Gap>,

    /// Bytes not yet received; determines the message's priority.
    pub bytes_remaining: usize,

    /// Buffer space for the message: offsets into the socket's pool
    /// region, one per bpage. Empty means buffers aren't allocated yet.
    pub bpage_offsets: Vec<u32>,

    /// Bytes (from offset 0) the sender will transmit without further
    /// grants. Monotonic non-decreasing, never beyond `length`.
    pub granted: usize,

    /// Offset carried by the last GRANT sent for this message.
    pub prev_grant: usize,

    /// This message's current contribution to the global
    /// granted-but-not-received total.
    pub rec_incoming: usize,

    /// Time (ns) when the message entered grant management; used for the
    /// FIFO reserve.
    pub birth: u64,

    /// Position in the grant scheduler's active set, or -1.
    pub rank: i32,

    /// True while the message sits on the scheduler's overflow list.
    pub in_grantable: bool,

    /// Ask the sender to retransmit everything in the next grant (set
    /// after recovering from buffer starvation).
    pub resend_all: bool,
}

impl MsgIn {
    pub fn new(length: usize, bpage_offsets: Vec<u32>) -> Self {
        MsgIn {
            length,
            packets: VecDeque::new(),
            recv_end: 0,
            gaps: Vec::new(),
            bytes_remaining: length,
            bpage_offsets,
            granted: 0,
            prev_grant: 0,
            rec_incoming: 0,
            birth: 0,
            rank: -1,
            in_grantable: false,
            resend_all: false,
        }
    }

    /// Bytes of the message received so far.
    #[inline]
    pub fn received(&self) -> usize {
        self.length - self.bytes_remaining
    }
}

/// The message this host is sending for an RPC.
#[derive(Debug)]
pub(crate) struct MsgOut {
    /// Total bytes in the message.
    pub length: usize,

    /// All packets of the message, in offset order.
    pub packets: Vec<DataSegment>,

    /// Index into `packets` of the next packet to transmit.
    pub next_xmit: usize,

    /// All bytes below this offset have been handed to the IP layer.
    pub next_xmit_offset: usize,

    /// Initial bytes sent without waiting for grants.
    pub unscheduled: usize,

    /// Bytes we are currently permitted to send. Never beyond `length`.
    pub granted: usize,

    /// Priority level for future scheduled packets.
    pub sched_priority: u8,

    /// Time (ns) this message was created; used for FIFO pacing.
    pub init_ns: u64,
}

impl MsgOut {
    /// Bytes that remain to be transmitted.
    #[inline]
    pub fn bytes_left(&self) -> usize {
        self.length - self.next_xmit_offset
    }
}

/// Mutable portion of an RPC, guarded by the RPC lock.
pub(crate) struct RpcInner {
    pub state: RpcState,

    /// Client side only: a failed RPC records its error here and the
    /// next matching `recv` reports it.
    pub error: Option<HomaError>,

    /// Client side only: opaque value returned with the response.
    pub completion_cookie: u64,

    pub msgin: Option<MsgIn>,
    pub msgout: Option<MsgOut>,

    /// Timer ticks since the last packet indicating progress arrived.
    pub silent_ticks: u32,

    /// Tick when we first noticed this (server) RPC is fully transmitted
    /// and ready for an ack; 0 means not yet.
    pub done_timer_ticks: u32,

    /// Thread waiting specifically on this RPC, if any.
    pub private_interest: Option<Arc<Interest>>,

    /* List-membership markers (the lists themselves live on the socket
     * and pacer).
     */
    pub in_ready: bool,
    pub in_waiting_bufs: bool,
    pub in_throttled: bool,
}

/// One active RPC.
pub(crate) struct Rpc {
    /// Unique identifier among RPCs from this port. Low bit: 0 if we are
    /// the client, 1 if we are the server.
    pub id: RpcId,

    /// Socket that owns the RPC.
    pub hsk: Arc<Socket>,

    /// The machine on the other end.
    pub peer: Arc<Peer>,

    /// Port on `peer` handling the other end of this RPC.
    pub dport: Port,

    /// RPC_* bits; manipulated atomically since some readers don't hold
    /// the RPC lock.
    pub flags: AtomicU32,

    inner: Mutex<RpcInner>,
}

impl Rpc {
    fn new(
        hsk: &Arc<Socket>,
        peer: Arc<Peer>,
        id: RpcId,
        dport: Port,
        state: RpcState,
    ) -> Arc<Rpc> {
        Arc::new(Rpc {
            id,
            hsk: hsk.clone(),
            peer,
            dport,
            flags: AtomicU32::new(0),
            inner: Mutex::new(RpcInner {
                state,
                error: None,
                completion_cookie: 0,
                msgin: None,
                msgout: None,
                silent_ticks: 0,
                done_timer_ticks: 0,
                private_interest: None,
                in_ready: false,
                in_waiting_bufs: false,
                in_throttled: false,
            }),
        })
    }

    /// Acquire the RPC lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, RpcInner> {
        self.inner.lock().unwrap()
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RPC_PRIVATE != 0
    }
}

/// Allocate and initialize a client RPC (used to issue an outgoing
/// request). Doesn't send any packets.
pub(crate) fn alloc_client(
    homa: &Homa,
    hsk: &Arc<Socket>,
    dest: Ipv6Addr,
    dport: Port,
) -> Result<Arc<Rpc>> {
    let id = homa.next_outgoing_id.fetch_add(2, Ordering::Relaxed);
    let peer = homa.peers.find_or_create(dest, homa.now_ns());
    let rpc = Rpc::new(hsk, peer, id, dport, RpcState::Outgoing);

    let mut state = hsk.state.lock().unwrap();
    if hsk.is_shutdown() {
        return Err(HomaError::Shutdown);
    }
    hsk.client_bucket(id).insert(rpc.clone());
    state.active.push(rpc.clone());
    Ok(rpc)
}

/// Find or create the server-side RPC for an incoming DATA packet.
/// Returns the RPC and whether it was newly created.
pub(crate) fn alloc_server(
    homa: &Homa,
    hsk: &Arc<Socket>,
    source: Ipv6Addr,
    sport: Port,
    id: RpcId,
    _h: &DataHeader,
) -> Result<(Arc<Rpc>, bool)> {
    if !hsk.pool.has_region() {
        return Err(HomaError::NoMemory);
    }
    let bucket = hsk.server_bucket(id);
    if let Some(existing) = bucket.find(|rpc| {
        rpc.id == id && rpc.dport == sport && rpc.peer.addr == source
    }) {
        return Ok((existing, false));
    }

    let peer = homa.peers.find_or_create(source, homa.now_ns());
    let rpc = Rpc::new(hsk, peer, id, sport, RpcState::Incoming);

    let mut state = hsk.state.lock().unwrap();
    if hsk.is_shutdown() {
        return Err(HomaError::Shutdown);
    }
    /* Re-check under the socket lock: another thread may have created
     * the RPC since the lookup above.
     */
    if let Some(existing) = bucket.find(|rpc| {
        rpc.id == id && rpc.dport == sport && rpc.peer.addr == source
    }) {
        return Ok((existing, false));
    }
    bucket.insert(rpc.clone());
    state.active.push(rpc.clone());
    Ok((rpc, true))
}

/// Locate the client-side RPC for an id, if any.
pub(crate) fn find_client(hsk: &Socket, id: RpcId) -> Option<Arc<Rpc>> {
    hsk.client_bucket(id).find(|rpc| rpc.id == id)
}

/// Locate the server-side RPC matching (peer, id), if any.
pub(crate) fn find_server(hsk: &Socket, saddr: Ipv6Addr, id: RpcId) -> Option<Arc<Rpc>> {
    hsk.server_bucket(id)
        .find(|rpc| rpc.id == id && rpc.peer.addr == saddr)
}

/// Stop all activity on an RPC and make it unreachable; resources are
/// released later by [`reap`]. Idempotent. The caller must hold no locks.
pub(crate) fn end(homa: &Homa, rpc: &Arc<Rpc>) {
    {
        let mut inner = rpc.lock();
        if inner.state == RpcState::Dead {
            return;
        }
        inner.state = RpcState::Dead;
    }
    log::trace!("ending RPC id {}", rpc.id);

    /* Grant state must go before the socket lists so the scheduler never
     * sees a half-unlinked RPC.
     */
    grant::end_rpc(homa, rpc);
    pacer::unmanage_rpc(homa, rpc);

    let hsk = &rpc.hsk;
    {
        let mut state = hsk.state.lock().unwrap();
        if is_client(rpc.id) {
            hsk.client_bucket(rpc.id).remove(rpc);
        } else {
            hsk.server_bucket(rpc.id).remove(rpc);
        }
        state.active.retain(|r| !Arc::ptr_eq(r, rpc));
        let mut inner = rpc.lock();
        if inner.in_ready {
            inner.in_ready = false;
            state.ready_rpcs.retain(|r| !Arc::ptr_eq(r, rpc));
        }
        if inner.in_waiting_bufs {
            inner.in_waiting_bufs = false;
            state.waiting_for_bufs.retain(|r| !Arc::ptr_eq(r, rpc));
        }
        let mut dead_skbs = 0;
        if let Some(msgin) = inner.msgin.as_mut() {
            dead_skbs += msgin.packets.len();
            msgin.gaps.clear();
        }
        if let Some(msgout) = inner.msgout.as_ref() {
            dead_skbs += msgout.packets.len();
        }
        state.dead_skbs += dead_skbs;
        state.dead.push_back(rpc.clone());
    }
    interest::notify_private(rpc);
}

/// Terminate an RPC because of an error. Client RPCs surface the error
/// through a future `recv`; server RPCs are silently ended.
pub(crate) fn abort(homa: &Homa, rpc: &Arc<Rpc>, error: HomaError) {
    if !is_client(rpc.id) {
        log::debug!("aborting server RPC id {}: {}", rpc.id, error);
        end(homa, rpc);
        return;
    }
    log::debug!("aborting client RPC id {}: {}", rpc.id, error);
    {
        let mut inner = rpc.lock();
        if inner.state == RpcState::Dead {
            return;
        }
        inner.error = Some(error);
    }
    crate::incoming::handoff(rpc);
}

/// Abort all RPCs to/from a particular peer (and optionally only one
/// destination port); used for ICMP error mapping.
pub(crate) fn abort_rpcs(homa: &Homa, addr: Ipv6Addr, port: Port, error: HomaError) {
    for hsk in homa.socktab.all() {
        let rpcs: Vec<Arc<Rpc>> = hsk.state.lock().unwrap().active.clone();
        for rpc in rpcs {
            if rpc.peer.addr != addr {
                continue;
            }
            if port != 0 && rpc.dport != port {
                continue;
            }
            abort(homa, &rpc, error);
        }
    }
}

/// Abort all client RPCs on one socket. `error` of None means end them
/// outright; otherwise they complete with the error so `recv` returns
/// them.
pub(crate) fn abort_sock_rpcs(homa: &Homa, hsk: &Arc<Socket>, error: Option<HomaError>) {
    let rpcs: Vec<Arc<Rpc>> = hsk.state.lock().unwrap().active.clone();
    for rpc in rpcs {
        if !is_client(rpc.id) {
            continue;
        }
        match error {
            Some(err) => abort(homa, &rpc, err),
            None => end(homa, &rpc),
        }
    }
}

/// Handle an incoming ack: if the named RPC still exists on this host's
/// server side, it can now be freed.
pub(crate) fn acked(homa: &Homa, hsk: &Arc<Socket>, saddr: Ipv6Addr, ack: &HomaAck) {
    if ack.client_id == 0 {
        return;
    }
    let id = crate::wire::local_id(ack.client_id);
    let target = if hsk.port() == ack.server_port {
        Some(hsk.clone())
    } else {
        homa.socktab.get(ack.server_port)
    };
    if let Some(hsk2) = target {
        if let Some(rpc) = find_server(&hsk2, saddr, id) {
            end(homa, &rpc);
        }
    }
}

/// Release resources of dead RPCs on a socket, a bounded amount of work
/// per call (unless `reap_all`). Returns the number of packet buffers
/// freed; 0 means there is nothing more that can be reaped right now.
pub(crate) fn reap(homa: &Homa, hsk: &Arc<Socket>, reap_all: bool) -> usize {
    let mut freed = 0;
    loop {
        let Some(rpc) = hsk.state.lock().unwrap().dead.pop_front() else {
            break;
        };
        let mut wmem_freed = 0;
        let mut buffers: Vec<u32> = Vec::new();
        let count;
        {
            let mut inner = rpc.lock();
            let mut n = 0;
            if let Some(msgin) = inner.msgin.as_mut() {
                n += msgin.packets.len();
                msgin.packets.clear();
                buffers = std::mem::take(&mut msgin.bpage_offsets);
            }
            if let Some(msgout) = inner.msgout.take() {
                n += msgout.packets.len();
                wmem_freed = msgout.length;
            }
            inner.msgin = None;
            inner.private_interest = None;
            count = n;
        }
        freed += count;
        {
            let mut state = hsk.state.lock().unwrap();
            state.dead_skbs = state.dead_skbs.saturating_sub(count);
        }
        if !buffers.is_empty() {
            let _ = hsk.pool.release_buffers(&buffers);
        }
        if wmem_freed > 0 {
            hsk.free_tx_memory(wmem_freed);
        }
        log::trace!("reaped RPC id {}", rpc.id);
        if !reap_all && freed >= homa.config.reap_limit {
            break;
        }
    }
    crate::incoming::check_waiting_for_bufs(homa, hsk);
    freed
}
