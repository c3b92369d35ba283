//! Wait primitive binding an application thread to an incoming message.
//!
//! An interest is either *shared* (linked into the socket's interest
//! list, catches the next non-private ready RPC) or *private* (pointed
//! to by one RPC's `private_interest`, matched only by that RPC).
//!
//! The `ready` flag is the single source of truth for completion; it is
//! always written under the interest's mutex with release semantics so
//! the handoff path cannot race a waiter that is unlinking itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::{HomaError, Result};
use crate::rpc::{self, Rpc};
use crate::sock::Socket;
use crate::Homa;

pub(crate) struct Interest {
    /// True once the interest needs attention: an RPC has been handed to
    /// it, or the socket has been shut down.
    ready: AtomicBool,

    /// The handed-off RPC. None after a shutdown wake (or for private
    /// interests, which already know their RPC).
    rpc: Mutex<Option<Arc<Rpc>>>,

    cv: Condvar,
}

impl Interest {
    pub fn new() -> Arc<Interest> {
        Arc::new(Interest {
            ready: AtomicBool::new(false),
            rpc: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Hand an RPC (or a shutdown signal, `None`) to the waiting thread.
    pub fn notify(&self, rpc: Option<Arc<Rpc>>) {
        let mut slot = self.rpc.lock().unwrap();
        *slot = rpc;
        self.ready.store(true, Ordering::Release);
        self.cv.notify_one();
    }

    /// Claim the handed-off RPC, if any.
    pub fn take_rpc(&self) -> Option<Arc<Rpc>> {
        self.rpc.lock().unwrap().take()
    }

    /// Wait until the interest is ready. Busy-polls for `poll_usecs`
    /// first (reaping dead RPCs while spinning), then sleeps.
    pub fn wait(&self, homa: &Homa, hsk: &Arc<Socket>, nonblocking: bool) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.is_ready() {
                return Ok(());
            }
            /* Waiting time is free; use it to clean up dead RPCs. */
            if rpc::reap(homa, hsk, false) != 0 {
                continue;
            }
            if nonblocking {
                return Err(HomaError::WouldBlock);
            }
            if start.elapsed().as_micros() as u64 >= homa.config.poll_usecs {
                break;
            }
            std::thread::yield_now();
        }

        let mut slot = self.rpc.lock().unwrap();
        while !self.is_ready() {
            slot = self.cv.wait(slot).unwrap();
        }
        Ok(())
    }
}

/// Remove a shared interest from its socket's list. May race a handoff;
/// the caller must still check `is_ready` afterwards.
pub(crate) fn unlink_shared(hsk: &Socket, interest: &Arc<Interest>) {
    let mut state = hsk.state.lock().unwrap();
    state.interests.retain(|i| !Arc::ptr_eq(i, interest));
}

/// Wake the thread (if any) waiting privately on this RPC.
pub(crate) fn notify_private(rpc: &Arc<Rpc>) {
    let interest = {
        let inner = rpc.lock();
        inner.private_interest.clone()
    };
    if let Some(interest) = interest {
        interest.notify(None);
    }
}
