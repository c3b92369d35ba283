//! The timer: a 1 ms tick that drives retries, timeouts, ack requests,
//! reaping, and peer garbage collection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::HomaError;
use crate::incoming;
use crate::outgoing;
use crate::rpc::{self, Rpc, RpcState};
use crate::type_alias::*;
use crate::wire::PacketBody;
use crate::Homa;

/// Per-RPC part of the tick. Returns true if the RPC should be aborted
/// with a timeout (done by the caller once the lock is dropped).
fn check_rpc(homa: &Homa, rpc: &Arc<Rpc>, ticks: u32) -> bool {
    let mut inner = rpc.lock();
    if inner.state == RpcState::Dead {
        return false;
    }
    if inner.state == RpcState::InService {
        inner.silent_ticks = 0;
        return false;
    }
    inner.silent_ticks += 1;

    /* A server RPC whose response is fully transmitted wants an ack so
     * it can free its state.
     */
    if !is_client(rpc.id) && inner.state == RpcState::Outgoing {
        let done = inner
            .msgout
            .as_ref()
            .map(|m| m.next_xmit_offset >= m.length)
            .unwrap_or(false);
        if done {
            if inner.done_timer_ticks == 0 {
                inner.done_timer_ticks = ticks;
            } else if ticks.wrapping_sub(inner.done_timer_ticks)
                >= homa.config.request_ack_ticks
            {
                log::trace!("sending NEED_ACK for id {}", rpc.id);
                outgoing::xmit_control(homa, rpc, PacketBody::NeedAck);
            }
        }
    }

    match inner.state {
        RpcState::Incoming => {
            if let Some(msgin) = inner.msgin.as_ref() {
                if msgin.received() >= msgin.granted {
                    /* Everything granted so far has arrived; nothing to
                     * expect until we grant more.
                     */
                    inner.silent_ticks = 0;
                    return false;
                }
                if msgin.bpage_offsets.is_empty() {
                    /* Waiting for buffer space, not for the peer. */
                    inner.silent_ticks = 0;
                    return false;
                }
            }
        }
        RpcState::Outgoing => {
            if is_client(rpc.id) {
                let pending_tx = inner
                    .msgout
                    .as_ref()
                    .map(|m| m.next_xmit_offset < m.granted)
                    .unwrap_or(false);
                if pending_tx {
                    /* Granted bytes we haven't sent: the ball is in our
                     * court.
                     */
                    inner.silent_ticks = 0;
                    return false;
                }
            } else {
                inner.silent_ticks = 0;
                return false;
            }
        }
        _ => {}
    }
    if !is_client(rpc.id) && inner.state != RpcState::Incoming {
        inner.silent_ticks = 0;
        return false;
    }

    if inner.silent_ticks < homa.config.resend_ticks {
        return false;
    }
    if inner.silent_ticks >= homa.config.timeout_ticks {
        log::warn!(
            "RPC id {} to peer {} aborted because of timeout",
            rpc.id,
            rpc.peer.addr
        );
        return true;
    }
    if (inner.silent_ticks - homa.config.resend_ticks) % homa.config.resend_interval != 0 {
        return false;
    }

    incoming::request_retrans(homa, rpc, &mut inner);
    rpc.peer.outstanding_resends.fetch_add(1, Ordering::AcqRel);
    false
}

/// One timer tick: walk every RPC of every socket.
pub(crate) fn tick(homa: &Homa) {
    let ticks = homa.timer_ticks.fetch_add(1, Ordering::AcqRel) + 1;

    for hsk in homa.socktab.all() {
        /* Help out with reaping if dead buffers have piled up. */
        while hsk.state.lock().unwrap().dead_skbs >= homa.config.dead_buffs_limit {
            if rpc::reap(homa, &hsk, false) == 0 {
                break;
            }
        }
        if hsk.is_shutdown() {
            continue;
        }

        let rpcs: Vec<Arc<Rpc>> = hsk.state.lock().unwrap().active.clone();
        for rpc in rpcs {
            if check_rpc(homa, &rpc, ticks) {
                rpc::abort(homa, &rpc, HomaError::TimedOut);
            }
        }
    }

    homa.peers.gc(
        homa.now_ns(),
        homa.config.peer_gc_threshold,
        homa.config.peer_idle_secs_max * 1_000_000_000,
    );
    crate::pacer::check(homa);
}
