//! The sender side of message transmission: segmentation, the transmit
//! loop, retransmission, and control-packet output.

use std::net::Ipv6Addr;
use std::sync::Arc;

use crate::error::{HomaError, Result};
use crate::pacer;
use crate::peer::Peer;
use crate::rpc::{DataSegment, MsgOut, Rpc, RpcInner};
use crate::type_alias::*;
use crate::wire::{
    CommonHeader, DataHeader, HomaAck, Packet, PacketBody, DATA_HEADER_BYTES,
    ETH_OVERHEAD_BYTES, IP_HEADER_BYTES,
};
use crate::Homa;
use crate::HomaConfig;

/// Build the outgoing message for an RPC: copy the caller's bytes into
/// packet segments of at most `max_gso_size`, with a boundary at the
/// unscheduled limit so no packet straddles it. Transmission is started
/// separately by [`xmit_data`].
pub(crate) fn fill(
    homa: &Homa,
    rpc: &Arc<Rpc>,
    inner: &mut RpcInner,
    data: &[u8],
) -> Result<()> {
    if inner.msgout.is_some() {
        return Err(HomaError::InvalidArg);
    }
    let length = data.len();
    let unscheduled = homa.config.unsched_bytes.min(length);

    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < length {
        let mut size = homa.config.max_gso_size;
        if offset < unscheduled && offset + size > unscheduled {
            size = unscheduled - offset;
        }
        size = size.min(length - offset);
        packets.push(DataSegment {
            offset,
            data: data[offset..offset + size].to_vec(),
        });
        offset += size;
    }

    inner.msgout = Some(MsgOut {
        length,
        packets,
        next_xmit: 0,
        next_xmit_offset: 0,
        unscheduled,
        granted: unscheduled,
        sched_priority: 0,
        init_ns: homa.now_ns(),
    });
    rpc.hsk.reserve_tx_memory(length);
    Ok(())
}

/// Priority for unscheduled bytes of a `length`-byte message sent to
/// `peer`, from the cutoffs the peer has advertised.
pub(crate) fn unsched_priority(peer: &Peer, length: usize) -> u8 {
    let cutoffs = peer.unsched_cutoffs.lock().unwrap();
    HomaConfig::pick_unsched_priority(&cutoffs, length)
}

fn wire_bytes_for(payload: usize) -> usize {
    payload + DATA_HEADER_BYTES + IP_HEADER_BYTES + ETH_OVERHEAD_BYTES
}

/// Build a DATA packet for one segment of an RPC's outgoing message.
fn data_packet(
    rpc: &Rpc,
    msgout: &MsgOut,
    seg: &DataSegment,
    incoming: usize,
    retransmit: bool,
) -> Packet {
    /* Piggyback one pending ack for this peer, if any. */
    let ack = rpc
        .peer
        .get_acks(1)
        .pop()
        .unwrap_or(HomaAck::default());
    Packet {
        common: CommonHeader {
            sport: rpc.hsk.port(),
            dport: rpc.dport,
            sender_id: rpc.id,
        },
        body: PacketBody::Data(DataHeader {
            message_length: msgout.length as u32,
            incoming: incoming as u32,
            cutoff_version: rpc.peer.cutoff_version.load(std::sync::atomic::Ordering::Acquire)
                as u16,
            retransmit,
            ack,
            offset: seg.offset as u32,
            payload: seg.data.clone(),
        }),
    }
}

/// Transmit whatever packets of an RPC's outgoing message are currently
/// permitted by grants and the NIC queue. The caller holds the RPC lock;
/// packets that can't be sent now are left for the pacer (`force` sends
/// at least one packet regardless of queue length).
pub(crate) fn xmit_data(homa: &Homa, rpc: &Arc<Rpc>, inner: &mut RpcInner, force: bool) {
    let mut force = force;
    loop {
        let Some(msgout) = inner.msgout.as_ref() else {
            return;
        };
        if msgout.next_xmit >= msgout.packets.len() {
            break;
        }
        if msgout.next_xmit_offset >= msgout.granted {
            log::trace!(
                "xmit_data stopping at offset {} for id {}: granted is {}",
                msgout.next_xmit_offset,
                rpc.id,
                msgout.granted
            );
            break;
        }
        let seg_len = msgout.packets[msgout.next_xmit].data.len();
        if msgout.bytes_left() >= homa.config.throttle_min_bytes
            && !pacer::check_nic_queue(homa, wire_bytes_for(seg_len), force)
        {
            pacer::manage_rpc(homa, rpc, inner);
            break;
        }

        let msgout = inner.msgout.as_mut().expect("msgout just checked");
        let seg_index = msgout.next_xmit;
        msgout.next_xmit += 1;
        msgout.next_xmit_offset += seg_len;
        let seg = &msgout.packets[seg_index];
        let priority = if seg.offset < msgout.unscheduled {
            unsched_priority(&rpc.peer, msgout.length)
        } else {
            msgout.sched_priority
        };
        let pkt = data_packet(rpc, msgout, seg, msgout.unscheduled, false);
        homa.sink.send(rpc.peer.addr, pkt, priority);
        force = false;
    }
}

/// Retransmit the packets covering `[start, end)` of the outgoing
/// message at the given priority (whole-segment granularity).
pub(crate) fn resend_data(
    homa: &Homa,
    rpc: &Arc<Rpc>,
    inner: &mut RpcInner,
    start: usize,
    end: usize,
    priority: u8,
) {
    if end <= start {
        return;
    }
    let Some(msgout) = inner.msgout.as_ref() else {
        return;
    };
    let mut to_send: Vec<(usize, usize)> = Vec::new();
    for (i, seg) in msgout.packets.iter().enumerate() {
        if seg.offset >= end {
            break;
        }
        if start >= seg.offset + seg.data.len() {
            continue;
        }
        to_send.push((i, seg.data.len()));
    }
    for (i, len) in to_send {
        let msgout = inner.msgout.as_ref().expect("msgout just checked");
        let seg = &msgout.packets[i];
        let seg_end = seg.offset + len;
        /* The receiver may infer lost grants from `incoming`; advertise
         * at least what has actually been granted.
         */
        let incoming = if seg_end <= msgout.granted {
            msgout.granted
        } else {
            seg_end.min(msgout.length)
        };
        let pkt = data_packet(rpc, msgout, seg, incoming, true);
        pacer::check_nic_queue(homa, wire_bytes_for(len), true);
        log::trace!(
            "retransmitting offset {}, length {}, id {}",
            seg.offset,
            len,
            rpc.id
        );
        homa.sink.send(rpc.peer.addr, pkt, priority);
    }
}

/// Send a control packet to the other end of an RPC. Control packets go
/// out at the highest priority level.
pub(crate) fn xmit_control(homa: &Homa, rpc: &Arc<Rpc>, body: PacketBody) {
    let common = CommonHeader {
        sport: rpc.hsk.port(),
        dport: rpc.dport,
        sender_id: rpc.id,
    };
    xmit_control_raw(homa, rpc.peer.addr, common, body);
}

/// Lower-level control send for paths with no RPC (RPC_UNKNOWN replies,
/// acks for already-forgotten RPCs).
pub(crate) fn xmit_control_raw(
    homa: &Homa,
    dst: Ipv6Addr,
    common: CommonHeader,
    body: PacketBody,
) {
    let priority = (homa.config.num_priorities - 1) as u8;
    homa.sink.send(dst, Packet { common, body }, priority);
}

/// Send an RPC_UNKNOWN response for a packet that doesn't match any
/// local RPC.
pub(crate) fn xmit_unknown(homa: &Homa, src: Ipv6Addr, common: &CommonHeader) {
    log::debug!(
        "sending RPC_UNKNOWN to {}:{} for id {}",
        src,
        common.sport,
        crate::wire::local_id(common.sender_id)
    );
    xmit_control_raw(
        homa,
        src,
        CommonHeader {
            sport: common.dport,
            dport: common.sport,
            sender_id: crate::wire::local_id(common.sender_id),
        },
        PacketBody::RpcUnknown,
    );
}

/// Push a CUTOFFS packet describing our unscheduled-priority thresholds
/// to the peer of this RPC.
pub(crate) fn xmit_cutoffs(homa: &Homa, rpc: &Arc<Rpc>) {
    let mut cutoffs = [0u32; crate::wire::HOMA_MAX_PRIORITIES];
    cutoffs.copy_from_slice(&homa.config.unsched_cutoffs);
    xmit_control(
        homa,
        rpc,
        PacketBody::Cutoffs {
            unsched_cutoffs: cutoffs,
            version: homa.config.cutoff_version,
        },
    );
}
