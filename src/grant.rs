//! The grant scheduler: decides which incoming messages may receive more
//! data, and at which priority.
//!
//! At any instant the messages being granted to are (approximately) the
//! ones with the fewest remaining bytes, subject to two caps: at most
//! `max_overcommit` messages at once, and at most `max_rpcs_per_peer`
//! from any single peer. Ranked messages live in the `active` array
//! (index = rank); the rest wait on the `grantable` overflow list. A
//! small FIFO reserve keeps the oldest message from starving.
//!
//! The grant lock is held only for structural changes. Grant offsets are
//! computed and grant packets sent with at most the RPC's own lock, so
//! under races grants can arrive duplicated or slightly out of priority
//! order; both are absorbed idempotently by the receiver of the grant.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::outgoing;
use crate::rpc::{Rpc, RpcInner, RpcState};
use crate::wire::PacketBody;
use crate::Homa;

/// Ranking key for a message: fewest ungranted bytes first, ties broken
/// by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GrantKey {
    ungranted: i64,
    birth: u64,
}

impl GrantKey {
    /// True if `self` should receive grants in preference to `other`.
    #[inline]
    fn outranks(&self, other: &GrantKey) -> bool {
        self.ungranted < other.ungranted
            || (self.ungranted == other.ungranted && self.birth < other.birth)
    }
}

fn key_of(rpc: &Rpc) -> GrantKey {
    let inner = rpc.lock();
    match inner.msgin.as_ref() {
        Some(msgin) => GrantKey {
            ungranted: msgin.length as i64 - msgin.granted as i64,
            birth: msgin.birth,
        },
        /* Shouldn't happen for a managed RPC; rank it last. */
        None => GrantKey {
            ungranted: i64::MAX,
            birth: u64::MAX,
        },
    }
}

struct GrantInner {
    /// Messages currently receiving grants, highest priority first.
    /// Entry i's RPC has `msgin.rank == i`.
    active: Vec<Arc<Rpc>>,

    /// Grantable messages that didn't fit in `active`, in rank order.
    grantable: Vec<Arc<Rpc>>,

    /// Total messages under grant management (active + grantable).
    num_grantable: usize,
}

/// Process-wide grant state for one transport instance.
pub(crate) struct GrantState {
    inner: Mutex<GrantInner>,

    /// Bytes all senders may still transmit to this host (granted or
    /// unscheduled, not yet received). Can go slightly negative under
    /// races; that is tolerated rather than locked away.
    pub total_incoming: AtomicI64,

    /// Set when a grant had to be clamped because `total_incoming` hit
    /// `max_incoming`; forces the next grant check onto the slow path so
    /// stalled messages pick up the freed headroom.
    incoming_hit_limit: AtomicBool,

    /// Current per-message grant window (bytes granted beyond what has
    /// been received).
    pub window: AtomicUsize,

    /// Number of entries in `active` (mirrored out of the lock for
    /// priority computation).
    num_active: AtomicUsize,

    /// Next time (ns) the active set's ordering should be rechecked.
    next_recalc_ns: AtomicU64,

    /// Counts down bytes granted through the SRPT path; at zero it is
    /// time for a FIFO grant to the oldest message.
    nonfifo_left: AtomicI64,
}

impl GrantState {
    pub fn new(homa_config: &crate::HomaConfig) -> Self {
        let window = if homa_config.window != 0 {
            homa_config.window
        } else {
            homa_config.max_incoming
        };
        GrantState {
            inner: Mutex::new(GrantInner {
                active: Vec::new(),
                grantable: Vec::new(),
                num_grantable: 0,
            }),
            total_incoming: AtomicI64::new(0),
            incoming_hit_limit: AtomicBool::new(false),
            window: AtomicUsize::new(window),
            num_active: AtomicUsize::new(0),
            next_recalc_ns: AtomicU64::new(0),
            nonfifo_left: AtomicI64::new(homa_config.grant_nonfifo()),
        }
    }

    /// Number of messages currently being granted to (for tests and
    /// introspection).
    pub fn active_count(&self) -> usize {
        self.num_active.load(Ordering::Acquire)
    }
}

/// Recompute the grant window after a change in the number of managed
/// messages. With `window == 0` the rule keeps unused incoming capacity
/// equal to each message's share ("dynamic queue length thresholds").
fn update_window(homa: &Homa, num_active: usize) {
    let window = if homa.config.window != 0 {
        homa.config.window
    } else {
        homa.config.max_incoming / (num_active + 1)
    };
    homa.grant.window.store(window, Ordering::Release);
}

fn set_rank(rpc: &Rpc, rank: i32) {
    let mut inner = rpc.lock();
    if let Some(msgin) = inner.msgin.as_mut() {
        msgin.rank = rank;
    }
}

/// Renumber every active entry after a structural change.
fn refresh_ranks(g: &GrantInner, grant: &GrantState) {
    for (i, rpc) in g.active.iter().enumerate() {
        set_rank(rpc, i as i32);
    }
    grant.num_active.store(g.active.len(), Ordering::Release);
}

/// Try to insert an RPC into the active set. Returns an RPC that must be
/// moved to the overflow list instead: either `rpc` itself (no room) or
/// a lower-priority entry it displaced.
fn insert_active(g: &mut GrantInner, homa: &Homa, rpc: &Arc<Rpc>) -> Option<Arc<Rpc>> {
    let grant = &homa.grant;
    let key = key_of(rpc);

    /* Scan backwards for the lowest-priority entry that still outranks
     * the newcomer, and for the lowest-priority entry from the same
     * peer.
     */
    let mut insert_after: i64 = -1;
    let mut peer_index: i64 = -1;
    for i in (0..g.active.len()).rev() {
        let other = &g.active[i];
        if !key.outranks(&key_of(other)) {
            insert_after = i as i64;
            break;
        }
        if peer_index < 0 && Arc::ptr_eq(&other.peer, &rpc.peer) {
            peer_index = i as i64;
        }
    }

    let bumped;
    if rpc.peer.active_rpcs.load(Ordering::Acquire) >= homa.config.max_rpcs_per_peer {
        if peer_index <= insert_after {
            /* Every same-peer entry outranks the newcomer and the peer
             * is at its cap, so the newcomer waits.
             */
            return Some(rpc.clone());
        }
        let victim = g.active.remove(peer_index as usize);
        set_rank(&victim, -1);
        victim.peer.active_rpcs.fetch_sub(1, Ordering::AcqRel);
        bumped = Some(victim);
    } else if insert_after >= homa.config.max_overcommit as i64 - 1 {
        /* Active set is full and the newcomer is too low priority. */
        return Some(rpc.clone());
    } else if g.active.len() >= homa.config.max_overcommit {
        let victim = g.active.pop().expect("active set should be non-empty");
        set_rank(&victim, -1);
        victim.peer.active_rpcs.fetch_sub(1, Ordering::AcqRel);
        bumped = Some(victim);
    } else {
        bumped = None;
    }

    g.active.insert((insert_after + 1) as usize, rpc.clone());
    rpc.peer.active_rpcs.fetch_add(1, Ordering::AcqRel);
    refresh_ranks(g, grant);
    bumped
}

/// Insert an RPC into the overflow list at its rank position.
fn insert_grantable(g: &mut GrantInner, rpc: Arc<Rpc>) {
    let key = key_of(&rpc);
    let pos = g
        .grantable
        .iter()
        .position(|other| key.outranks(&key_of(other)))
        .unwrap_or(g.grantable.len());
    {
        let mut inner = rpc.lock();
        if let Some(msgin) = inner.msgin.as_mut() {
            msgin.in_grantable = true;
        }
    }
    g.grantable.insert(pos, rpc);
}

fn remove_grantable(g: &mut GrantInner, rpc: &Arc<Rpc>) {
    g.grantable.retain(|r| !Arc::ptr_eq(r, rpc));
    let mut inner = rpc.lock();
    if let Some(msgin) = inner.msgin.as_mut() {
        msgin.in_grantable = false;
    }
}

/// Remove an RPC from the active set, promoting the best overflow entry
/// whose peer has room. The promoted RPC is appended to `cand` so the
/// caller can issue its first grants once locks are dropped.
fn remove_active(
    g: &mut GrantInner,
    homa: &Homa,
    rpc: &Arc<Rpc>,
    cand: &mut Vec<Arc<Rpc>>,
) {
    let grant = &homa.grant;
    if let Some(pos) = g.active.iter().position(|r| Arc::ptr_eq(r, rpc)) {
        g.active.remove(pos);
        rpc.peer.active_rpcs.fetch_sub(1, Ordering::AcqRel);
    }
    set_rank(rpc, -1);

    let promote = g.grantable.iter().position(|r| {
        r.peer.active_rpcs.load(Ordering::Acquire) < homa.config.max_rpcs_per_peer
    });
    if let Some(pos) = promote {
        let promoted = g.grantable.remove(pos);
        {
            let mut inner = promoted.lock();
            if let Some(msgin) = inner.msgin.as_mut() {
                msgin.in_grantable = false;
            }
        }
        promoted.peer.active_rpcs.fetch_add(1, Ordering::AcqRel);
        g.active.push(promoted.clone());
        cand.push(promoted);
    }
    refresh_ranks(g, grant);
}

/// Put an incoming message under grant management. The caller must not
/// hold the RPC's lock.
pub(crate) fn manage_rpc(homa: &Homa, rpc: &Arc<Rpc>) {
    let mut g = homa.grant.inner.lock().unwrap();
    {
        let mut inner = rpc.lock();
        let Some(msgin) = inner.msgin.as_mut() else {
            return;
        };
        if msgin.rank >= 0 || msgin.in_grantable {
            return;
        }
        msgin.birth = homa.now_ns();
    }
    g.num_grantable += 1;
    log::trace!(
        "grant: managing id {}, {} messages now grantable",
        rpc.id,
        g.num_grantable
    );
    if let Some(bumped) = insert_active(&mut g, homa, rpc) {
        insert_grantable(&mut g, bumped);
    }
    update_window(homa, g.active.len());
}

/// Remove an RPC from grant management (fully granted, or ending).
/// Promoted replacements land in `cand`; the caller must process them
/// with [`check_candidates`] after releasing all locks.
pub(crate) fn unmanage_rpc(homa: &Homa, rpc: &Arc<Rpc>, cand: &mut Vec<Arc<Rpc>>) {
    let mut g = homa.grant.inner.lock().unwrap();
    let (rank, in_grantable) = {
        let inner = rpc.lock();
        match inner.msgin.as_ref() {
            Some(msgin) => (msgin.rank, msgin.in_grantable),
            None => return,
        }
    };
    if rank < 0 && !in_grantable {
        return;
    }
    g.num_grantable -= 1;
    if rank >= 0 {
        remove_active(&mut g, homa, rpc, cand);
    }
    if in_grantable {
        remove_grantable(&mut g, rpc);
    }
    update_window(homa, g.active.len());
}

/// Grant-related cleanup when an RPC ends.
pub(crate) fn end_rpc(homa: &Homa, rpc: &Arc<Rpc>) {
    let mut cand = Vec::new();
    unmanage_rpc(homa, rpc, &mut cand);
    if !cand.is_empty() {
        check_candidates(homa, cand);
    }
    let mut inner = rpc.lock();
    if let Some(msgin) = inner.msgin.as_mut() {
        if msgin.rec_incoming != 0 {
            homa.grant
                .total_incoming
                .fetch_sub(msgin.rec_incoming as i64, Ordering::AcqRel);
            msgin.rec_incoming = 0;
        }
    }
}

/// Reconcile the message's granted-but-not-received contribution with
/// the global total. Call whenever received or granted bytes change.
pub(crate) fn update_incoming(inner: &mut RpcInner, homa: &Homa) {
    let Some(msgin) = inner.msgin.as_mut() else {
        return;
    };
    let incoming = msgin.granted.saturating_sub(msgin.received());
    let delta = incoming as i64 - msgin.rec_incoming as i64;
    if delta != 0 {
        homa.grant.total_incoming.fetch_add(delta, Ordering::AcqRel);
    }
    msgin.rec_incoming = incoming;
}

/// Compute a new grant offset for a message. Returns true if the offset
/// advanced and a GRANT packet should be sent.
fn update_granted(inner: &mut RpcInner, homa: &Homa) -> bool {
    /* A sender that is slow using grants it already has gets no more. */
    if inner.silent_ticks > 1 {
        return false;
    }
    let Some(msgin) = inner.msgin.as_mut() else {
        return false;
    };
    let received = msgin.received();
    let mut new_offset = (received + homa.grant.window.load(Ordering::Acquire))
        .min(msgin.length);
    let incoming_delta =
        new_offset as i64 - received as i64 - msgin.rec_incoming as i64;
    let headroom = homa.config.max_incoming as i64
        - homa.grant.total_incoming.load(Ordering::Acquire);
    if incoming_delta > 0 && headroom < incoming_delta {
        homa.grant.incoming_hit_limit.store(true, Ordering::Release);
        new_offset -= (incoming_delta - headroom.max(0)) as usize;
    }
    if new_offset <= msgin.granted {
        return false;
    }
    msgin.granted = new_offset;
    true
}

/// The priority to carry in a grant for a message at `rank`. When the
/// active set doesn't consume every scheduled level, the lower levels
/// are used so a new short message can preempt instantly.
fn grant_priority(homa: &Homa, rank: i32) -> u8 {
    let max_sched = homa.config.max_sched_prio as i32;
    let mut priority = max_sched - rank.max(0);
    let extra = max_sched + 1 - homa.grant.num_active.load(Ordering::Acquire) as i32;
    if extra > 0 {
        priority -= extra;
    }
    priority.max(0) as u8
}

/// Issue a GRANT packet for the message's current grant offset. Takes
/// the RPC lock briefly; the caller must not hold it.
fn send_grant(homa: &Homa, rpc: &Arc<Rpc>) {
    let (offset, priority, resend_all, delta) = {
        let mut inner = rpc.lock();
        let Some(msgin) = inner.msgin.as_mut() else {
            return;
        };
        let delta = msgin.granted - msgin.prev_grant;
        msgin.prev_grant = msgin.granted;
        let resend_all = std::mem::take(&mut msgin.resend_all);
        (
            msgin.granted as u32,
            grant_priority(homa, msgin.rank),
            resend_all,
            delta,
        )
    };
    log::trace!(
        "sending grant for id {}, offset {}, priority {}",
        rpc.id,
        offset,
        priority
    );
    outgoing::xmit_control(
        homa,
        rpc,
        PacketBody::Grant {
            offset,
            priority,
            resend_all,
        },
    );

    /* Account the bytes against the FIFO reserve. */
    if homa.config.grant_fifo_fraction > 0
        && homa
            .grant
            .nonfifo_left
            .fetch_sub(delta as i64, Ordering::AcqRel)
            <= delta as i64
    {
        homa.grant
            .nonfifo_left
            .fetch_add(homa.config.grant_nonfifo(), Ordering::AcqRel);
        send_fifo_grant(homa);
    }
}

/// Give the oldest waiting message a "pity" grant of
/// `fifo_grant_increment` bytes, regardless of its rank. The FIFO grant
/// always wins: it goes to the oldest message even when that message's
/// peer is saturated, and it doesn't occupy an active slot.
fn send_fifo_grant(homa: &Homa) {
    let target = {
        let mut g = homa.grant.inner.lock().unwrap();
        let limit = homa.grant.window.load(Ordering::Acquire)
            + 2 * homa.config.fifo_grant_increment;
        let mut oldest: Option<Arc<Rpc>> = None;
        let mut oldest_birth = u64::MAX;
        for rpc in g.grantable.iter() {
            let inner = rpc.lock();
            let Some(msgin) = inner.msgin.as_ref() else {
                continue;
            };
            if msgin.birth >= oldest_birth {
                continue;
            }
            if msgin.granted.saturating_sub(msgin.received()) >= limit {
                /* A previous pity grant hasn't been used up; the peer
                 * isn't responding, so pick someone else.
                 */
                continue;
            }
            oldest_birth = msgin.birth;
            oldest = Some(rpc.clone());
        }
        let Some(rpc) = oldest else {
            return;
        };
        let fully_granted = {
            let mut inner = rpc.lock();
            inner.silent_ticks = 0;
            let Some(msgin) = inner.msgin.as_mut() else {
                return;
            };
            msgin.granted = (msgin.granted + homa.config.fifo_grant_increment)
                .min(msgin.length);
            msgin.granted >= msgin.length
        };
        if fully_granted {
            g.num_grantable -= 1;
            remove_grantable(&mut g, &rpc);
            update_window(homa, g.active.len());
        }
        rpc
    };
    {
        let mut inner = target.lock();
        update_incoming(&mut inner, homa);
    }
    send_grant_fifo_packet(homa, &target);
}

fn send_grant_fifo_packet(homa: &Homa, rpc: &Arc<Rpc>) {
    let (offset, resend_all) = {
        let mut inner = rpc.lock();
        let Some(msgin) = inner.msgin.as_mut() else {
            return;
        };
        msgin.prev_grant = msgin.granted;
        (msgin.granted as u32, std::mem::take(&mut msgin.resend_all))
    };
    outgoing::xmit_control(
        homa,
        rpc,
        PacketBody::Grant {
            offset,
            priority: homa.config.max_sched_prio,
            resend_all,
        },
    );
}

/// Repair any priority inversions that have developed in the active set
/// (grants are issued without the grant lock, so order decays).
fn fix_order(g: &mut GrantInner, grant: &GrantState) {
    let mut keyed: Vec<(GrantKey, Arc<Rpc>)> = g
        .active
        .drain(..)
        .map(|rpc| (key_of(&rpc), rpc))
        .collect();
    keyed.sort_by(|a, b| {
        if a.0.outranks(&b.0) {
            std::cmp::Ordering::Less
        } else if b.0.outranks(&a.0) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    g.active.extend(keyed.into_iter().map(|(_, rpc)| rpc));
    refresh_ranks(g, grant);
}

/// Issue grants to a batch of RPCs (typically ones just promoted into
/// the active set, or found stalled). Caller must hold no locks.
pub(crate) fn check_candidates(homa: &Homa, cand: Vec<Arc<Rpc>>) {
    let mut queue: Vec<Arc<Rpc>> = cand;
    while let Some(rpc) = queue.pop() {
        let (send, fully) = {
            let mut inner = rpc.lock();
            if inner.state == RpcState::Dead {
                continue;
            }
            let send = update_granted(&mut inner, homa);
            if send {
                update_incoming(&mut inner, homa);
            }
            let fully = inner
                .msgin
                .as_ref()
                .map(|m| m.granted >= m.length)
                .unwrap_or(false);
            (send, fully)
        };
        if !send {
            continue;
        }
        if fully {
            unmanage_rpc(homa, &rpc, &mut queue);
        }
        send_grant(homa, &rpc);
    }
}

/// The main entry point: invoked after packets arrive for an RPC (and on
/// a few recovery paths). Updates incoming accounting, sends new grants
/// for the RPC on the fast path, and periodically takes the slow path to
/// fix ordering and unstick messages stalled on the incoming limit.
/// The caller must hold no locks.
pub(crate) fn check_rpc(homa: &Homa, rpc: &Arc<Rpc>) {
    enum Path {
        Done,
        Fast { fully: bool },
        Slow { recalc: bool },
    }

    let path = {
        let mut inner = rpc.lock();
        let ok = inner.state != RpcState::Dead
            && inner
                .msgin
                .as_ref()
                .map(|m| !m.bpage_offsets.is_empty())
                .unwrap_or(false);
        if !ok {
            Path::Done
        } else {
            let limit = homa.grant.incoming_hit_limit.swap(false, Ordering::AcqRel);
            let rank = inner.msgin.as_ref().map(|m| m.rank).unwrap_or(-1);
            if rank < 0 && !limit {
                /* Not being granted to and nothing is stalled: only the
                 * accounting needs refreshing.
                 */
                update_incoming(&mut inner, homa);
                Path::Done
            } else {
                let now = homa.now_ns();
                let recalc = now >= homa.grant.next_recalc_ns.load(Ordering::Acquire);
                if !recalc && !limit {
                    let send = update_granted(&mut inner, homa);
                    update_incoming(&mut inner, homa);
                    if !send {
                        Path::Done
                    } else {
                        let fully = inner
                            .msgin
                            .as_ref()
                            .map(|m| m.granted >= m.length)
                            .unwrap_or(false);
                        Path::Fast { fully }
                    }
                } else {
                    update_incoming(&mut inner, homa);
                    Path::Slow { recalc }
                }
            }
        }
    };

    match path {
        Path::Done => {}
        Path::Fast { fully } => {
            let mut cand = Vec::new();
            if fully {
                unmanage_rpc(homa, rpc, &mut cand);
            }
            send_grant(homa, rpc);
            if !cand.is_empty() {
                check_candidates(homa, cand);
            }
        }
        Path::Slow { recalc } => {
            let cand = {
                let mut g = homa.grant.inner.lock().unwrap();
                if recalc {
                    homa.grant.next_recalc_ns.store(
                        homa.now_ns() + homa.config.grant_recalc_usecs * 1000,
                        Ordering::Release,
                    );
                    fix_order(&mut g, &homa.grant);
                }
                /* Find every active message missing part of its window;
                 * grants go out after the lock drops.
                 */
                let window = homa.grant.window.load(Ordering::Acquire);
                let mut cand = Vec::new();
                for other in g.active.iter() {
                    let inner = other.lock();
                    if inner.state == RpcState::Dead {
                        continue;
                    }
                    if let Some(msgin) = inner.msgin.as_ref() {
                        if msgin.rec_incoming < window {
                            cand.push(other.clone());
                        }
                    }
                }
                cand
            };
            if !cand.is_empty() {
                check_candidates(homa, cand);
            }
        }
    }
}
