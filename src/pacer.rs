//! The pacer: approximates SRPT on egress by keeping the NIC transmit
//! queue short.
//!
//! An estimate of the NIC queue (in nanoseconds of transmit time) is
//! kept in `link_idle_ns`: the time at which everything already queued
//! will have left the host. Packets are queued immediately while the
//! estimate is below `max_nic_queue_ns`; otherwise their RPCs park on a
//! throttled list ordered by remaining bytes, drained by the pacer
//! thread (with backstop calls from the data path, since the thread can
//! be descheduled arbitrarily long).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::outgoing;
use crate::rpc::{Rpc, RpcInner, RpcState};
use crate::Homa;

/// An RPC on the throttled list, with ordering keys snapshotted at
/// insertion (stale keys cost only mild unfairness, never correctness).
struct Throttled {
    rpc: Arc<Rpc>,
    bytes_left: usize,
    init_ns: u64,
}

pub(crate) struct Pacer {
    /// Estimated time (ns since transport start) at which the NIC queue
    /// drains. May be in the past.
    link_idle_ns: AtomicU64,

    /// RPCs with transmittable bytes that the queue limit is holding
    /// back, shortest remaining first.
    throttled: Mutex<Vec<Throttled>>,

    /// When this drops to zero it is the oldest message's turn.
    fifo_count: AtomicI64,

    /// Ensures a single instance of [`xmit`] runs at a time; contenders
    /// just leave.
    xmit_lock: Mutex<()>,

    exit: AtomicBool,
    sleep_mutex: Mutex<()>,
    sleep_cv: Condvar,
}

impl Pacer {
    pub fn new() -> Self {
        Pacer {
            link_idle_ns: AtomicU64::new(0),
            throttled: Mutex::new(Vec::new()),
            fifo_count: AtomicI64::new(1000),
            xmit_lock: Mutex::new(()),
            exit: AtomicBool::new(false),
            sleep_mutex: Mutex::new(()),
            sleep_cv: Condvar::new(),
        }
    }

    pub fn stop(&self) {
        self.exit.store(true, Ordering::Release);
        let _guard = self.sleep_mutex.lock().unwrap();
        self.sleep_cv.notify_all();
    }

    fn wake(&self) {
        let _guard = self.sleep_mutex.lock().unwrap();
        self.sleep_cv.notify_all();
    }
}

/// Update the NIC queue estimate for a packet about to be transmitted,
/// and say whether transmission may proceed now. `force` (or a packet
/// below the throttle threshold at the call sites) always proceeds.
pub(crate) fn check_nic_queue(homa: &Homa, wire_bytes: usize, force: bool) -> bool {
    let pacer = &homa.pacer;
    let ns_for_packet = homa.config.ns_per_mbyte() * wire_bytes as u64 / 1_000_000;
    loop {
        let clock = homa.now_ns();
        let idle = pacer.link_idle_ns.load(Ordering::Acquire);
        if clock + homa.config.max_nic_queue_ns < idle
            && !force
            && !homa.config.dont_throttle
        {
            return false;
        }
        let new_idle = if idle < clock {
            clock + ns_for_packet
        } else {
            idle + ns_for_packet
        };
        if pacer
            .link_idle_ns
            .compare_exchange_weak(idle, new_idle, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
    }
}

/// Put an RPC on the throttled list (caller holds its lock) and wake the
/// pacer thread.
pub(crate) fn manage_rpc(homa: &Homa, rpc: &Arc<Rpc>, inner: &mut RpcInner) {
    if inner.in_throttled {
        return;
    }
    let Some(msgout) = inner.msgout.as_ref() else {
        return;
    };
    inner.in_throttled = true;
    let entry = Throttled {
        rpc: rpc.clone(),
        bytes_left: msgout.bytes_left(),
        init_ns: msgout.init_ns,
    };
    {
        let mut throttled = homa.pacer.throttled.lock().unwrap();
        let pos = throttled
            .iter()
            .position(|t| t.bytes_left > entry.bytes_left)
            .unwrap_or(throttled.len());
        throttled.insert(pos, entry);
    }
    homa.pacer.wake();
}

/// Remove an RPC from the throttled list if present. Caller holds the
/// RPC lock.
pub(crate) fn unmanage_rpc_locked(homa: &Homa, rpc: &Arc<Rpc>, inner: &mut RpcInner) {
    if !inner.in_throttled {
        return;
    }
    inner.in_throttled = false;
    let mut throttled = homa.pacer.throttled.lock().unwrap();
    throttled.retain(|t| !Arc::ptr_eq(&t.rpc, rpc));
}

/// Remove an RPC from the throttled list, acquiring its lock.
pub(crate) fn unmanage_rpc(homa: &Homa, rpc: &Arc<Rpc>) {
    let mut inner = rpc.lock();
    unmanage_rpc_locked(homa, rpc, &mut inner);
}

/// Transmit from the throttled list until it empties or the NIC queue
/// refills. Called from the pacer thread and, as a backstop, from the
/// data path.
pub(crate) fn xmit(homa: &Homa) {
    let pacer = &homa.pacer;
    let Ok(_xmit_guard) = pacer.xmit_lock.try_lock() else {
        return;
    };
    loop {
        let idle = pacer.link_idle_ns.load(Ordering::Acquire) as i64;
        if idle - homa.now_ns() as i64 >= homa.config.max_nic_queue_ns as i64 {
            break;
        }

        let rpc = {
            let throttled = pacer.throttled.lock().unwrap();
            if throttled.is_empty() {
                break;
            }
            let fifo = pacer
                .fifo_count
                .fetch_sub(homa.config.pacer_fifo_fraction, Ordering::AcqRel)
                <= homa.config.pacer_fifo_fraction;
            if fifo {
                pacer.fifo_count.fetch_add(1000, Ordering::AcqRel);
                throttled
                    .iter()
                    .min_by_key(|t| t.init_ns)
                    .map(|t| t.rpc.clone())
            } else {
                throttled.first().map(|t| t.rpc.clone())
            }
        };
        let Some(rpc) = rpc else {
            break;
        };

        let done = {
            let mut inner = rpc.lock();
            if !inner.in_throttled {
                /* Lost a race with unmanage; pick again. */
                continue;
            }
            outgoing::xmit_data(homa, &rpc, &mut inner, true);
            let done = match inner.msgout.as_ref() {
                Some(msgout) => {
                    msgout.next_xmit >= msgout.packets.len()
                        || msgout.next_xmit_offset >= msgout.granted
                }
                None => true,
            } || inner.state == RpcState::Dead;
            if done {
                unmanage_rpc_locked(homa, &rpc, &mut inner);
            }
            done
        };
        if done {
            continue;
        }
    }
}

/// Backstop check from the data path: if the pacer thread has fallen
/// behind and the NIC queue is more than half empty, help out.
pub(crate) fn check(homa: &Homa) {
    let pacer = &homa.pacer;
    if pacer.throttled.lock().unwrap().is_empty() {
        return;
    }
    if homa.now_ns() + homa.config.max_nic_queue_ns / 2
        < pacer.link_idle_ns.load(Ordering::Acquire)
    {
        return;
    }
    xmit(homa);
}

/// Body of the pacer thread.
pub(crate) fn main_loop(homa: &Homa) {
    let pacer = &homa.pacer;
    while !pacer.exit.load(Ordering::Acquire) {
        xmit(homa);
        let throttled_nonempty = !pacer.throttled.lock().unwrap().is_empty();
        if throttled_nonempty {
            /* NIC queue is full; yield so packet processing isn't locked
             * out, then try again.
             */
            std::thread::yield_now();
            continue;
        }
        let guard = pacer.sleep_mutex.lock().unwrap();
        if pacer.exit.load(Ordering::Acquire) {
            break;
        }
        if pacer.throttled.lock().unwrap().is_empty() {
            let _unused = pacer
                .sleep_cv
                .wait_timeout(guard, std::time::Duration::from_millis(10))
                .unwrap();
        }
    }
}
