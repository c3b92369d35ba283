//! Thin adapters between the application-facing calls and the protocol
//! engine: argument validation, the request/response send paths, and
//! result marshaling for `recv`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use crate::error::{HomaError, Result};
use crate::incoming;
use crate::net::canonical_dest;
use crate::pool::HOMA_MAX_BPAGES;
use crate::rpc::{self, RpcState};
use crate::sock::Socket;
use crate::type_alias::*;
use crate::wire::HOMA_MAX_MESSAGE_LENGTH;
use crate::{outgoing, Homa};

/// Mark the new request as private: its response may only be claimed by
/// a `recv` naming its id.
pub const HOMA_SENDMSG_PRIVATE: u32 = 0x01;

/// Fail with `WouldBlock` instead of waiting for send memory.
pub const HOMA_SENDMSG_NONBLOCKING: u32 = 0x02;

const HOMA_SENDMSG_VALID_FLAGS: u32 = 0x03;

/// Fail with `WouldBlock` instead of waiting for a message.
pub const HOMA_RECVMSG_NONBLOCKING: u32 = 0x04;

const HOMA_RECVMSG_VALID_FLAGS: u32 = 0x04;

/// Control block for [`Socket::send`] (the `sendmsg` msg_control).
#[derive(Debug, Default, Clone)]
pub struct SendmsgArgs {
    /// 0 means send a new request (the new RPC's id is written back
    /// here); nonzero means send the response for that server-side id.
    pub id: RpcId,

    /// Requests only: opaque value returned by the `recv` that completes
    /// this RPC.
    pub completion_cookie: u64,

    /// HOMA_SENDMSG_* bits.
    pub flags: u32,
}

/// Control block for [`Socket::recv`] (the `recvmsg` msg_control).
#[derive(Debug, Default, Clone)]
pub struct RecvmsgArgs {
    /// On entry: the id of a specific (private) RPC to wait for, or 0
    /// for any. On success: the id of the received message.
    pub id: RpcId,

    /// The cookie supplied when the request was sent (responses only).
    pub completion_cookie: u64,

    /// HOMA_RECVMSG_* bits.
    pub flags: u32,

    /// On entry: bpages being returned to the pool. On success: the
    /// bpages holding the new message (owned by the application until
    /// returned through a later `recv`).
    pub bpage_offsets: Vec<u32>,

    /// Address and port of the message's sender.
    pub sender: Option<(std::net::Ipv6Addr, Port)>,
}

impl Socket {
    /// Send a message. With `args.id == 0` a new client RPC is created
    /// (its id is stored back into `args.id`); otherwise the message is
    /// the response for the named server RPC. Responding to an RPC that
    /// no longer exists succeeds as a no-op (the client may have
    /// abandoned it).
    pub fn send(&self, dest: SocketAddr, message: &[u8], args: &mut SendmsgArgs) -> Result<()> {
        if args.flags & !HOMA_SENDMSG_VALID_FLAGS != 0 {
            return Err(HomaError::InvalidArg);
        }
        if message.is_empty() || message.len() > HOMA_MAX_MESSAGE_LENGTH {
            return Err(HomaError::InvalidArg);
        }
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        let (daddr, dport) = canonical_dest(dest);
        if dport == 0 {
            return Err(HomaError::InvalidArg);
        }
        let nonblocking = args.flags & HOMA_SENDMSG_NONBLOCKING != 0;
        self.wait_tx_memory(nonblocking)?;

        let homa: &Homa = &self.homa;
        if args.id == 0 {
            /* Request. */
            let rpc = rpc::alloc_client(homa, &self.arc(), daddr, dport)?;
            if args.flags & HOMA_SENDMSG_PRIVATE != 0 {
                rpc.flags.fetch_or(rpc::RPC_PRIVATE, Ordering::AcqRel);
            }
            let filled = {
                let mut inner = rpc.lock();
                inner.completion_cookie = args.completion_cookie;
                outgoing::fill(homa, &rpc, &mut inner, message).map(|_| {
                    outgoing::xmit_data(homa, &rpc, &mut inner, false);
                })
            };
            match filled {
                Ok(()) => {
                    args.id = rpc.id;
                    log::trace!(
                        "sent request id {} to {}:{}, length {}",
                        rpc.id,
                        daddr,
                        dport,
                        message.len()
                    );
                    Ok(())
                }
                Err(err) => {
                    rpc::end(homa, &rpc);
                    Err(err)
                }
            }
        } else {
            /* Response. */
            if args.completion_cookie != 0 {
                return Err(HomaError::InvalidArg);
            }
            let Some(rpc) = rpc::find_server(self, daddr, args.id) else {
                return Ok(());
            };
            let filled = {
                let mut inner = rpc.lock();
                if let Some(err) = inner.error {
                    Err(err)
                } else if inner.state != RpcState::InService {
                    return Err(HomaError::InvalidArg);
                } else {
                    inner.state = RpcState::Outgoing;
                    outgoing::fill(homa, &rpc, &mut inner, message).map(|_| {
                        outgoing::xmit_data(homa, &rpc, &mut inner, false);
                    })
                }
            };
            match filled {
                Ok(()) => {
                    log::trace!("sent response for id {}, length {}", rpc.id, message.len());
                    Ok(())
                }
                Err(err) => {
                    rpc::end(homa, &rpc);
                    Err(err)
                }
            }
        }
    }

    /// Receive a message. Returns the message length; `args` carries the
    /// id, cookie, sender, and the bpages holding the message. An RPC
    /// that failed reports its error here, with `args.id` identifying
    /// the failed RPC.
    pub fn recv(&self, args: &mut RecvmsgArgs) -> Result<usize> {
        if args.flags & !HOMA_RECVMSG_VALID_FLAGS != 0 {
            return Err(HomaError::InvalidArg);
        }
        if args.bpage_offsets.len() > HOMA_MAX_BPAGES {
            return Err(HomaError::InvalidArg);
        }
        if !self.pool.has_region() {
            return Err(HomaError::InvalidArg);
        }
        args.completion_cookie = 0;
        let homa: &Homa = &self.homa;
        let hsk = self.arc();

        /* Consume returned buffers first, and retry anyone stalled on
         * pool space.
         */
        let returned = std::mem::take(&mut args.bpage_offsets);
        if !returned.is_empty() {
            self.pool
                .release_buffers(&returned)
                .map_err(|_| HomaError::InvalidArg)?;
            incoming::check_waiting_for_bufs(homa, &hsk);
        }

        let nonblocking = args.flags & HOMA_RECVMSG_NONBLOCKING != 0;
        let outcome = if args.id != 0 {
            let Some(rpc) = rpc::find_client(self, args.id) else {
                args.id = 0;
                return Err(HomaError::InvalidArg);
            };
            match incoming::wait_private(homa, &hsk, &rpc, nonblocking) {
                Ok(outcome) => outcome,
                Err(err) => {
                    args.id = 0;
                    return Err(err);
                }
            }
        } else {
            incoming::wait_shared(homa, &hsk, nonblocking)?
        };

        args.id = outcome.id;
        args.completion_cookie = outcome.completion_cookie;
        args.bpage_offsets = outcome.bpage_offsets;
        args.sender = Some(outcome.sender);

        if !self.tx_memory_available() {
            /* Threads are blocked on send memory; reap right away. */
            rpc::reap(homa, &hsk, true);
        }
        outcome.result
    }

    /// Abort client RPCs (the HOMAIOCABORT operation). With `id == 0`,
    /// every client RPC on the socket is aborted. `error` of None frees
    /// the RPCs outright; otherwise they complete with the error so a
    /// later `recv` returns them.
    pub fn abort(&self, id: RpcId, error: Option<HomaError>) -> Result<()> {
        let homa: &Homa = &self.homa;
        if id == 0 {
            rpc::abort_sock_rpcs(homa, &self.arc(), error);
            return Ok(());
        }
        let Some(rpc) = rpc::find_client(self, id) else {
            return Err(HomaError::InvalidArg);
        };
        match error {
            None => rpc::end(homa, &rpc),
            Some(err) => rpc::abort(homa, &rpc, err),
        }
        Ok(())
    }

    /// Convenience: assemble a received message (described by the bpage
    /// offsets from `recv`) into a contiguous buffer.
    pub fn gather(&self, bpage_offsets: &[u32], length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        let mut offset = 0;
        while offset < length {
            let (region_offset, available) =
                crate::pool::BufferPool::buffer_for(bpage_offsets, length, offset)
                    .expect("bpage offsets too short for message");
            let chunk = available.min(length - offset);
            self.pool
                .read(region_offset, &mut out[offset..offset + chunk]);
            offset += chunk;
        }
        out
    }
}
