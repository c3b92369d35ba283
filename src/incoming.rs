//! The incoming engine: packet dispatch, message reassembly, handoff to
//! waiting threads, and the wait loops behind `recv`.

use std::net::Ipv6Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{HomaError, Result};
use crate::grant;
use crate::interest::{self, Interest};
use crate::outgoing;
use crate::pool::{BufferPool, PoolAlloc};
use crate::rpc::{self, MsgIn, Rpc, RpcInner, RpcState, DataSegment, Gap};
use crate::sock::Socket;
use crate::type_alias::*;
use crate::wire::{
    local_id, CommonHeader, DataHeader, HomaAck, Packet, PacketBody, PacketType,
    HOMA_MAX_ACKS_PER_PKT, HOMA_MAX_MESSAGE_LENGTH,
};
use crate::Homa;

/// Everything `recv` needs to report about one completed (or failed)
/// RPC, captured atomically with the terminal state transition.
pub(crate) struct RecvOutcome {
    pub id: RpcId,
    pub completion_cookie: u64,
    pub result: Result<usize>,
    pub bpage_offsets: Vec<u32>,
    pub sender: (Ipv6Addr, Port),
}

/// Deferred work discovered while holding an RPC lock in the data path;
/// performed once the lock is dropped.
#[derive(Default)]
struct DataActions {
    handoff: bool,
    queue_waiting: bool,
    manage_grant: bool,
    send_cutoffs: bool,
    acks: Vec<HomaAck>,
}

/// Top-level packet entry point (the softirq analog). `src` must be
/// canonical (IPv4-mapped if v4).
pub(crate) fn dispatch(homa: &Homa, src: Ipv6Addr, pkt: Packet) {
    let id = local_id(pkt.common.sender_id);
    let dport = pkt.common.dport;
    let Some(hsk) = homa.socktab.get(dport) else {
        log::debug!(
            "discarding {:?} packet for unknown port {}, id {}",
            pkt.packet_type(),
            dport,
            id
        );
        return;
    };
    if !is_client(id) && !hsk.is_server() {
        log::debug!(
            "discarding {:?} packet: socket on port {} is not a server",
            pkt.packet_type(),
            dport
        );
        return;
    }
    if hsk.is_shutdown() {
        return;
    }

    /* Find (or for server DATA, create) the RPC. */
    let rpc: Option<Arc<Rpc>> = if !is_client(id) {
        if let PacketBody::Data(ref h) = pkt.body {
            match rpc::alloc_server(homa, &hsk, src, pkt.common.sport, id, h) {
                Ok((rpc, _created)) => Some(rpc),
                Err(err) => {
                    log::warn!("couldn't create server RPC for id {}: {}", id, err);
                    None
                }
            }
        } else {
            rpc::find_server(&hsk, src, id)
        }
    } else {
        rpc::find_client(&hsk, id)
    };

    if let Some(ref rpc) = rpc {
        rpc.peer.outstanding_resends.store(0, Ordering::Release);
    } else if !matches!(
        pkt.packet_type(),
        PacketType::Cutoffs | PacketType::NeedAck | PacketType::Ack | PacketType::Resend
    ) {
        log::debug!(
            "discarding {:?} packet for unknown RPC id {} from {}",
            pkt.packet_type(),
            id,
            src
        );
        return;
    }

    match pkt.body {
        PacketBody::Data(h) => {
            let rpc = rpc.expect("DATA for unknown RPCs was dropped above");
            let mut actions = DataActions::default();
            {
                let mut inner = rpc.lock();
                data_pkt(homa, &rpc, &mut inner, h, &mut actions);
            }
            if actions.queue_waiting {
                queue_waiting_for_bufs(&hsk, &rpc);
            }
            if actions.manage_grant {
                grant::manage_rpc(homa, &rpc);
            }
            if actions.handoff {
                handoff(&rpc);
            }
            if actions.send_cutoffs {
                outgoing::xmit_cutoffs(homa, &rpc);
            }
            for ack in actions.acks {
                rpc::acked(homa, &hsk, src, &ack);
            }
            grant::check_rpc(homa, &rpc);
        }
        PacketBody::Grant {
            offset,
            priority,
            resend_all,
        } => {
            if let Some(rpc) = rpc {
                let mut inner = rpc.lock();
                grant_pkt(homa, &rpc, &mut inner, offset as usize, priority, resend_all);
            }
        }
        PacketBody::Resend {
            offset,
            length,
            priority,
        } => {
            resend_pkt(
                homa,
                &pkt.common,
                src,
                rpc.as_ref(),
                offset as usize,
                length,
                priority,
            );
        }
        PacketBody::RpcUnknown => {
            if let Some(rpc) = rpc {
                unknown_pkt(homa, &rpc);
            }
        }
        PacketBody::Busy => {
            if let Some(rpc) = rpc {
                rpc.lock().silent_ticks = 0;
            }
        }
        PacketBody::Cutoffs {
            unsched_cutoffs,
            version,
        } => {
            let peer = homa.peers.find_or_create(src, homa.now_ns());
            peer.set_cutoffs(&unsched_cutoffs, version);
        }
        PacketBody::NeedAck => {
            need_ack_pkt(homa, src, &pkt.common, rpc.as_ref());
        }
        PacketBody::Ack { acks } => {
            if let Some(ref rpc) = rpc {
                rpc::end(homa, rpc);
            }
            for ack in &acks {
                rpc::acked(homa, &hsk, src, ack);
            }
        }
        PacketBody::Freeze => {
            log::debug!("FREEZE received from {}", src);
        }
    }

    /* Last-resort reap if nothing else is keeping up. */
    if hsk.state.lock().unwrap().dead_skbs >= 2 * homa.config.dead_buffs_limit {
        rpc::reap(homa, &hsk, false);
    }
    crate::pacer::check(homa);
}

/// Initialize the incoming-message state for an RPC, allocating buffer
/// space. Grant management and waiting-list insertion are signalled
/// through `actions`.
fn msgin_init(
    homa: &Homa,
    rpc: &Rpc,
    inner: &mut RpcInner,
    length: usize,
    unsched: usize,
    actions: &mut DataActions,
) -> bool {
    if length > HOMA_MAX_MESSAGE_LENGTH {
        return false;
    }
    let alloc = rpc.hsk.pool.alloc_msg(
        length,
        homa.now_ns(),
        homa.config.bpage_lease_usecs * 1000,
    );
    let offsets = match alloc {
        PoolAlloc::Ok(offsets) => offsets,
        PoolAlloc::OutOfSpace => {
            actions.queue_waiting = true;
            Vec::new()
        }
        PoolAlloc::NoRegion => return false,
    };
    let mut msgin = MsgIn::new(length, offsets);
    if !msgin.bpage_offsets.is_empty() {
        if unsched >= length {
            msgin.granted = length;
            msgin.prev_grant = length;
        } else {
            msgin.granted = unsched;
            msgin.prev_grant = unsched;
            actions.manage_grant = true;
        }
    }
    inner.msgin = Some(msgin);
    true
}

/// Handler for an incoming DATA packet. Caller holds the RPC lock.
fn data_pkt(
    homa: &Homa,
    rpc: &Arc<Rpc>,
    inner: &mut RpcInner,
    h: DataHeader,
    actions: &mut DataActions,
) {
    inner.silent_ticks = 0;
    if h.ack.client_id != 0 {
        actions.acks.push(h.ack);
    }

    if inner.state != RpcState::Incoming {
        if is_client(rpc.id) {
            if inner.state != RpcState::Outgoing {
                return;
            }
            /* First byte of the response. */
            inner.state = RpcState::Incoming;
            if !msgin_init(
                homa,
                rpc,
                inner,
                h.message_length as usize,
                h.incoming as usize,
                actions,
            ) {
                return;
            }
        } else {
            /* Server RPC past the request phase; stale packet. */
            return;
        }
    } else if inner.msgin.is_none() {
        /* Server RPC created by this packet. */
        if !msgin_init(
            homa,
            rpc,
            inner,
            h.message_length as usize,
            h.incoming as usize,
            actions,
        ) {
            return;
        }
    }

    let msgin = inner.msgin.as_mut().expect("msgin initialized above");
    if msgin.bpage_offsets.is_empty() {
        /* No buffer space; drop the packet rather than hoarding memory.
         * The sender will retransmit once space frees up.
         */
        log::debug!(
            "dropping packet for id {}: no buffer space (offset {})",
            rpc.id,
            h.offset
        );
        return;
    }

    add_packet(rpc.id, msgin, h.offset as usize, h.payload, h.retransmit);

    if !msgin.packets.is_empty()
        && rpc.flags.fetch_or(rpc::RPC_PKTS_READY, Ordering::AcqRel)
            & rpc::RPC_PKTS_READY
            == 0
    {
        actions.handoff = true;
    }

    if h.cutoff_version != homa.config.cutoff_version {
        /* The sender's view of our cutoffs is stale. Rate-limit the
         * correction to one CUTOFFS per timer tick per peer.
         */
        let tick = homa.timer_ticks.load(Ordering::Acquire);
        if rpc.peer.last_cutoffs_tick.swap(tick, Ordering::AcqRel) != tick {
            actions.send_cutoffs = true;
        }
    }
}

/// Merge one received segment into the reassembly state: sequential
/// fast path, gap bookkeeping for reordering, and duplicate discard.
fn add_packet(
    id: RpcId,
    msgin: &mut MsgIn,
    start: usize,
    data: Vec<u8>,
    retransmit: bool,
) {
    let length = data.len();
    let end = start + length;
    if end > msgin.length {
        log::debug!(
            "packet extends past message end; id {}, offset {}, length {}",
            id,
            start,
            length
        );
        return;
    }

    let keep = 'merge: {
        if start == msgin.recv_end {
            /* Common case: packet is sequential. */
            msgin.recv_end += length;
            break 'merge true;
        }
        if start > msgin.recv_end {
            /* Packet creates a new gap. */
            msgin.gaps.push(Gap {
                start: msgin.recv_end,
                end: start,
            });
            msgin.recv_end = end;
            break 'merge true;
        }
        /* See if the packet fills part or all of an existing gap. */
        for i in 0..msgin.gaps.len() {
            let gap = msgin.gaps[i];
            if start <= gap.start {
                if end <= gap.start {
                    continue;
                }
                if start < gap.start || end > gap.end {
                    log::debug!(
                        "packet overlaps gap boundary: id {}, offset {}, length {}",
                        id,
                        start,
                        length
                    );
                    break 'merge false;
                }
                msgin.gaps[i].start = end;
                if msgin.gaps[i].start >= msgin.gaps[i].end {
                    msgin.gaps.remove(i);
                }
                break 'merge true;
            }
            if end >= gap.end {
                if start >= gap.end {
                    continue;
                }
                if end > gap.end {
                    log::debug!(
                        "packet overlaps gap boundary: id {}, offset {}, length {}",
                        id,
                        start,
                        length
                    );
                    break 'merge false;
                }
                msgin.gaps[i].end = start;
                break 'merge true;
            }
            /* Packet is in the middle of the gap; split it. */
            msgin.gaps.insert(
                i,
                Gap {
                    start: gap.start,
                    end: start,
                },
            );
            msgin.gaps[i + 1].start = end;
            break 'merge true;
        }
        false
    };

    if !keep {
        log::trace!(
            "discarding packet for id {}, offset {}, length {}, retransmit {}",
            id,
            start,
            length,
            retransmit
        );
        return;
    }
    msgin.bytes_remaining -= length;
    msgin.packets.push_back(DataSegment {
        offset: start,
        data,
    });
}

/// Handler for incoming GRANT packets. Caller holds the RPC lock.
fn grant_pkt(
    homa: &Homa,
    rpc: &Arc<Rpc>,
    inner: &mut RpcInner,
    offset: usize,
    priority: u8,
    resend_all: bool,
) {
    inner.silent_ticks = 0;
    if inner.state != RpcState::Outgoing {
        return;
    }
    if resend_all {
        let sent = inner
            .msgout
            .as_ref()
            .map(|m| m.next_xmit_offset)
            .unwrap_or(0);
        outgoing::resend_data(homa, rpc, inner, 0, sent, priority);
    }
    let Some(msgout) = inner.msgout.as_mut() else {
        return;
    };
    /* Regressing grants are ignored; duplicates are absorbed here. */
    if offset > msgout.granted {
        msgout.granted = offset.min(msgout.length);
    }
    msgout.sched_priority = priority;
    outgoing::xmit_data(homa, rpc, inner, false);
}

/// Handler for incoming RESEND packets.
fn resend_pkt(
    homa: &Homa,
    common: &CommonHeader,
    src: Ipv6Addr,
    rpc: Option<&Arc<Rpc>>,
    offset: usize,
    length: u32,
    priority: u8,
) {
    let Some(rpc) = rpc else {
        outgoing::xmit_unknown(homa, src, common);
        return;
    };
    let mut inner = rpc.lock();
    log::trace!(
        "resend request for id {}, offset {}, length {}",
        rpc.id,
        offset,
        length
    );

    if !is_client(rpc.id) && inner.state != RpcState::Outgoing {
        /* We are the server and don't have a response yet; BUSY keeps
         * the client from restarting the RPC.
         */
        outgoing::xmit_control(homa, rpc, PacketBody::Busy);
        return;
    }
    let Some(msgout) = inner.msgout.as_ref() else {
        outgoing::xmit_control(homa, rpc, PacketBody::Busy);
        return;
    };
    let sent = msgout.next_xmit_offset;
    let msg_length = msgout.length;
    let granted = msgout.granted;
    let end = if length == u32::MAX {
        sent
    } else {
        offset + length as usize
    };

    outgoing::resend_data(homa, rpc, &mut inner, offset, end.min(sent), priority);

    if end > granted {
        /* A grant packet was evidently lost; whatever the receiver asks
         * to have resent must have been granted.
         */
        if let Some(msgout) = inner.msgout.as_mut() {
            msgout.granted = end.min(msg_length);
        }
        outgoing::xmit_data(homa, rpc, &mut inner, false);
    }
    if offset >= inner.msgout.as_ref().map(|m| m.next_xmit_offset).unwrap_or(0) {
        /* Nothing was retransmitted; let the receiver know we're alive. */
        outgoing::xmit_control(homa, rpc, PacketBody::Busy);
    }
}

/// Handler for incoming RPC_UNKNOWN packets.
fn unknown_pkt(homa: &Homa, rpc: &Arc<Rpc>) {
    if is_client(rpc.id) {
        let mut inner = rpc.lock();
        if inner.state == RpcState::Outgoing {
            /* Everything transmitted so far has evidently been lost. */
            let sent = inner
                .msgout
                .as_ref()
                .map(|m| m.next_xmit_offset)
                .unwrap_or(0);
            let priority = inner
                .msgout
                .as_ref()
                .map(|m| outgoing::unsched_priority(&rpc.peer, m.length))
                .unwrap_or(0);
            log::debug!("restarting id {}: server lost {} bytes", rpc.id, sent);
            outgoing::resend_data(homa, rpc, &mut inner, 0, sent, priority);
            return;
        }
        log::debug!(
            "discarding RPC_UNKNOWN for id {} in state {:?}",
            rpc.id,
            inner.state
        );
    } else {
        rpc::end(homa, rpc);
    }
}

/// Handler for incoming NEED_ACK packets.
fn need_ack_pkt(
    homa: &Homa,
    src: Ipv6Addr,
    common: &CommonHeader,
    rpc: Option<&Arc<Rpc>>,
) {
    let id = local_id(common.sender_id);

    /* Can't ack until the entire response has arrived; ask for the
     * missing bytes instead.
     */
    if let Some(rpc) = rpc {
        let mut inner = rpc.lock();
        let incomplete = inner.state != RpcState::Incoming
            || inner
                .msgin
                .as_ref()
                .map(|m| m.bytes_remaining > 0)
                .unwrap_or(true);
        if incomplete {
            request_retrans(homa, rpc, &mut inner);
            return;
        }
    }

    let peer = homa.peers.find_or_create(src, homa.now_ns());
    let acks = peer.get_acks(HOMA_MAX_ACKS_PER_PKT);
    outgoing::xmit_control_raw(
        homa,
        src,
        CommonHeader {
            sport: common.dport,
            dport: common.sport,
            sender_id: id,
        },
        PacketBody::Ack { acks },
    );
}

/// Ask the peer to retransmit everything missing from the incoming
/// message: each reassembly gap, plus granted data past the highest
/// byte received. Caller holds the RPC lock.
pub(crate) fn request_retrans(homa: &Homa, rpc: &Arc<Rpc>, inner: &mut RpcInner) {
    let priority = (homa.config.num_priorities - 1) as u8;
    let mut resends: Vec<(u32, u32)> = Vec::new();
    match inner.msgin.as_ref() {
        Some(msgin) => {
            for gap in &msgin.gaps {
                resends.push((gap.start as u32, (gap.end - gap.start) as u32));
            }
            let tail = msgin.granted.saturating_sub(msgin.recv_end);
            if tail > 0 {
                resends.push((msgin.recv_end as u32, tail as u32));
            }
        }
        None => {
            /* No data received at all; ask the sender to resend
             * everything it has sent so far.
             */
            resends.push((0, u32::MAX));
        }
    }
    for (offset, length) in resends {
        log::trace!(
            "sending RESEND for id {}, offset {}, length {}",
            rpc.id,
            offset,
            length
        );
        outgoing::xmit_control(
            homa,
            rpc,
            PacketBody::Resend {
                offset,
                length,
                priority,
            },
        );
    }
}

/// Notify a waiting thread (or queue the RPC) now that its incoming
/// message needs attention. Caller must hold no locks.
pub(crate) fn handoff(rpc: &Arc<Rpc>) {
    if rpc.is_private() {
        interest::notify_private(rpc);
        return;
    }
    let hsk = &rpc.hsk;
    let chosen: Option<Arc<Interest>> = {
        let mut state = hsk.state.lock().unwrap();
        if hsk.is_shutdown() {
            return;
        }
        if let Some(interest) = state.interests.pop() {
            Some(interest)
        } else {
            let mut inner = rpc.lock();
            if !inner.in_ready {
                inner.in_ready = true;
                state.ready_rpcs.push_back(rpc.clone());
            }
            None
        }
    };
    if let Some(interest) = chosen {
        log::trace!("handing off id {} to waiting thread", rpc.id);
        interest.notify(Some(rpc.clone()));
    }
}

/// Copy received packets into the message's buffer space. Caller holds
/// the RPC lock. Fails only if the RPC has died.
fn copy_to_pool(rpc: &Arc<Rpc>, inner: &mut RpcInner) -> Result<()> {
    if inner.state == RpcState::Dead {
        return Err(HomaError::InvalidArg);
    }
    let Some(msgin) = inner.msgin.as_mut() else {
        return Ok(());
    };
    if msgin.bpage_offsets.is_empty() {
        return Ok(());
    }
    while let Some(seg) = msgin.packets.pop_front() {
        let mut copied = 0;
        while copied < seg.data.len() {
            let Some((region_offset, available)) = BufferPool::buffer_for(
                &msgin.bpage_offsets,
                msgin.length,
                seg.offset + copied,
            ) else {
                break;
            };
            let chunk = (seg.data.len() - copied).min(available);
            rpc.hsk
                .pool
                .write(region_offset, &seg.data[copied..copied + chunk]);
            copied += chunk;
        }
    }
    rpc.flags.fetch_and(!rpc::RPC_PKTS_READY, Ordering::AcqRel);
    Ok(())
}

/// Capture the result of a finished (or failed) RPC and perform its
/// terminal transition, all under the RPC lock. Returns the outcome and
/// whether the RPC must be ended once the lock is dropped.
fn collect_outcome(homa: &Homa, rpc: &Arc<Rpc>, inner: &mut RpcInner) -> (RecvOutcome, bool) {
    let result = match inner.error {
        Some(err) => Err(err),
        None => {
            if inner.state == RpcState::Dead {
                Err(HomaError::InvalidArg)
            } else {
                Ok(inner.msgin.as_ref().map(|m| m.length).unwrap_or(0))
            }
        }
    };
    let bpage_offsets = inner
        .msgin
        .as_mut()
        .map(|m| std::mem::take(&mut m.bpage_offsets))
        .unwrap_or_default();
    let outcome = RecvOutcome {
        id: rpc.id,
        completion_cookie: inner.completion_cookie,
        result,
        bpage_offsets,
        sender: (rpc.peer.addr, rpc.dport),
    };

    let end_needed;
    if is_client(rpc.id) {
        /* The response is done with; let the server free its state. */
        if let Some(flush) = rpc.peer.add_ack(rpc.id, rpc.dport) {
            outgoing::xmit_control(homa, rpc, PacketBody::Ack { acks: flush });
        }
        end_needed = true;
    } else if outcome.result.is_err() {
        end_needed = true;
    } else {
        inner.state = RpcState::InService;
        end_needed = false;
    }
    (outcome, end_needed)
}

/// Wait for the completion of any non-private incoming message on a
/// socket, then claim it.
pub(crate) fn wait_shared(
    homa: &Homa,
    hsk: &Arc<Socket>,
    nonblocking: bool,
) -> Result<RecvOutcome> {
    loop {
        let mut claimed: Option<Arc<Rpc>> = None;
        let mut waiter: Option<Arc<Interest>> = None;
        {
            let mut state = hsk.state.lock().unwrap();
            if hsk.is_shutdown() {
                return Err(HomaError::Shutdown);
            }
            if let Some(rpc) = state.ready_rpcs.pop_front() {
                rpc.lock().in_ready = false;
                claimed = Some(rpc);
            } else {
                let interest = Interest::new();
                state.interests.push(interest.clone());
                waiter = Some(interest);
            }
        }

        let rpc = match claimed {
            Some(rpc) => rpc,
            None => {
                let interest = waiter.expect("no RPC claimed, so a waiter exists");
                let wait_result = interest.wait(homa, hsk, nonblocking);
                interest::unlink_shared(hsk, &interest);
                if let Err(err) = wait_result {
                    /* The interest may have become ready in the race
                     * window; if so, ignore the error.
                     */
                    if !interest.is_ready() {
                        return Err(err);
                    }
                }
                match interest.take_rpc() {
                    Some(rpc) => rpc,
                    None => return Err(HomaError::Shutdown),
                }
            }
        };

        let mut inner = rpc.lock();
        if inner.error.is_none() {
            if let Err(err) = copy_to_pool(&rpc, &mut inner) {
                if inner.state != RpcState::Dead {
                    inner.error = Some(err);
                }
            }
        }
        if inner.state == RpcState::Dead {
            /* Claimed a corpse (e.g. aborted while queued); try again. */
            continue;
        }
        let complete = inner
            .msgin
            .as_ref()
            .map(|m| m.bytes_remaining == 0 && m.packets.is_empty())
            .unwrap_or(false);
        if inner.error.is_some() || complete {
            let (outcome, end_needed) = collect_outcome(homa, &rpc, &mut inner);
            drop(inner);
            if end_needed {
                rpc::end(homa, &rpc);
            }
            return Ok(outcome);
        }
        /* More packets are on the way; go around again. */
    }
}

/// Wait for the response of one specific (private) RPC.
pub(crate) fn wait_private(
    homa: &Homa,
    hsk: &Arc<Socket>,
    rpc: &Arc<Rpc>,
    nonblocking: bool,
) -> Result<RecvOutcome> {
    if !rpc.is_private() {
        return Err(HomaError::InvalidArg);
    }
    loop {
        let interest;
        {
            let mut inner = rpc.lock();
            if inner.error.is_none() {
                if let Err(err) = copy_to_pool(rpc, &mut inner) {
                    if inner.state != RpcState::Dead {
                        inner.error = Some(err);
                    }
                }
            }
            let complete = inner
                .msgin
                .as_ref()
                .map(|m| m.bytes_remaining == 0 && m.packets.is_empty())
                .unwrap_or(false);
            if inner.error.is_some() || inner.state == RpcState::Dead || complete {
                let (outcome, end_needed) = collect_outcome(homa, rpc, &mut inner);
                drop(inner);
                if end_needed {
                    rpc::end(homa, rpc);
                }
                return Ok(outcome);
            }
            if inner.private_interest.is_some() {
                return Err(HomaError::InvalidArg);
            }
            interest = Interest::new();
            inner.private_interest = Some(interest.clone());
        }

        let wait_result = interest.wait(homa, hsk, nonblocking);
        {
            let mut inner = rpc.lock();
            inner.private_interest = None;
        }
        if let Err(err) = wait_result {
            if !interest.is_ready() {
                return Err(err);
            }
        }
    }
}

/// Insert an RPC whose incoming message couldn't get buffer space into
/// the socket's waiting list (sorted by message length, shortest first).
fn queue_waiting_for_bufs(hsk: &Arc<Socket>, rpc: &Arc<Rpc>) {
    let mut state = hsk.state.lock().unwrap();
    let length = {
        let mut inner = rpc.lock();
        if inner.in_waiting_bufs || inner.state == RpcState::Dead {
            return;
        }
        inner.in_waiting_bufs = true;
        inner.msgin.as_ref().map(|m| m.length).unwrap_or(0)
    };
    let pos = state
        .waiting_for_bufs
        .iter()
        .position(|other| {
            other
                .lock()
                .msgin
                .as_ref()
                .map(|m| m.length > length)
                .unwrap_or(true)
        })
        .unwrap_or(state.waiting_for_bufs.len());
    state.waiting_for_bufs.insert(pos, rpc.clone());

    let first_len = state.waiting_for_bufs[0]
        .lock()
        .msgin
        .as_ref()
        .map(|m| m.length)
        .unwrap_or(0);
    hsk.pool
        .bpages_needed
        .store(BufferPool::pages_for(first_len), Ordering::Release);
}

/// Retry buffer allocation for RPCs stalled on pool space. Invoked
/// after buffers are released; must be called with no locks held.
pub(crate) fn check_waiting_for_bufs(homa: &Homa, hsk: &Arc<Socket>) {
    loop {
        let needed = hsk.pool.bpages_needed.load(Ordering::Acquire);
        if needed == usize::MAX || (hsk.pool.free_bpages().max(0) as usize) < needed {
            return;
        }
        let rpc = {
            let mut state = hsk.state.lock().unwrap();
            if state.waiting_for_bufs.is_empty() {
                hsk.pool.bpages_needed.store(usize::MAX, Ordering::Release);
                return;
            }
            let rpc = state.waiting_for_bufs.remove(0);
            rpc.lock().in_waiting_bufs = false;
            let next_needed = state
                .waiting_for_bufs
                .first()
                .and_then(|r| r.lock().msgin.as_ref().map(|m| m.length))
                .map(BufferPool::pages_for)
                .unwrap_or(usize::MAX);
            hsk.pool.bpages_needed.store(next_needed, Ordering::Release);
            rpc
        };

        let mut manage = false;
        let mut requeue = false;
        {
            let mut inner = rpc.lock();
            if inner.state == RpcState::Dead {
                continue;
            }
            let length = match inner.msgin.as_ref() {
                Some(m) if m.bpage_offsets.is_empty() => m.length,
                _ => continue,
            };
            match rpc.hsk.pool.alloc_msg(
                length,
                homa.now_ns(),
                homa.config.bpage_lease_usecs * 1000,
            ) {
                PoolAlloc::Ok(offsets) => {
                    let msgin = inner.msgin.as_mut().expect("checked above");
                    msgin.bpage_offsets = offsets;
                    /* Anything sent while we had no buffers was dropped;
                     * make the next grant ask for it all again.
                     */
                    msgin.resend_all = true;
                    msgin.granted = 0;
                    msgin.prev_grant = 0;
                    manage = true;
                }
                PoolAlloc::OutOfSpace => requeue = true,
                PoolAlloc::NoRegion => continue,
            }
        }
        if requeue {
            queue_waiting_for_bufs(hsk, &rpc);
            return;
        }
        if manage {
            grant::manage_rpc(homa, &rpc);
            grant::check_rpc(homa, &rpc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgin(length: usize) -> MsgIn {
        let mut m = MsgIn::new(length, vec![0]);
        m.granted = length;
        m
    }

    fn seg(offset: usize, len: usize) -> (usize, Vec<u8>) {
        (offset, vec![0u8; len])
    }

    #[test]
    fn test_add_packet_sequential() {
        let mut m = msgin(3000);
        let (o, d) = seg(0, 1000);
        add_packet(2, &mut m, o, d, false);
        let (o, d) = seg(1000, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(m.recv_end, 2000);
        assert!(m.gaps.is_empty());
        assert_eq!(m.bytes_remaining, 1000);
        assert_eq!(m.packets.len(), 2);
    }

    #[test]
    fn test_add_packet_reorder_creates_and_fills_gap() {
        let mut m = msgin(3000);
        let (o, d) = seg(2000, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(m.gaps, vec![Gap { start: 0, end: 2000 }]);
        assert_eq!(m.recv_end, 3000);

        /* Fill from the front of the gap... */
        let (o, d) = seg(0, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(m.gaps, vec![Gap { start: 1000, end: 2000 }]);

        /* ...and the rest. */
        let (o, d) = seg(1000, 1000);
        add_packet(2, &mut m, o, d, false);
        assert!(m.gaps.is_empty());
        assert_eq!(m.bytes_remaining, 0);
    }

    #[test]
    fn test_add_packet_splits_gap() {
        let mut m = msgin(5000);
        let (o, d) = seg(4000, 1000);
        add_packet(2, &mut m, o, d, false);
        let (o, d) = seg(2000, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(
            m.gaps,
            vec![Gap { start: 0, end: 2000 }, Gap { start: 3000, end: 4000 }]
        );
        assert_eq!(m.bytes_remaining, 3000);
    }

    #[test]
    fn test_add_packet_discards_duplicates() {
        let mut m = msgin(3000);
        let (o, d) = seg(0, 1000);
        add_packet(2, &mut m, o, d, false);
        /* Same packet again: dropped, accounting unchanged. */
        let (o, d) = seg(0, 1000);
        add_packet(2, &mut m, o, d, true);
        assert_eq!(m.packets.len(), 1);
        assert_eq!(m.bytes_remaining, 2000);

        /* A packet past the message end is dropped too. */
        let (o, d) = seg(2500, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(m.packets.len(), 1);
    }

    #[test]
    fn test_add_packet_tail_of_gap() {
        let mut m = msgin(4000);
        let (o, d) = seg(3000, 1000);
        add_packet(2, &mut m, o, d, false);
        let (o, d) = seg(2000, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(m.gaps, vec![Gap { start: 0, end: 2000 }]);
        let (o, d) = seg(1000, 1000);
        add_packet(2, &mut m, o, d, false);
        assert_eq!(m.gaps, vec![Gap { start: 0, end: 1000 }]);
        assert_eq!(m.bytes_remaining, 1000);
    }
}
