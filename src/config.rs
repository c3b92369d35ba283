//! Configuration knobs for a Homa transport instance.

use crate::wire::{HOMA_MAX_MESSAGE_LENGTH, HOMA_MAX_PRIORITIES};

/// Hard upper bound on `max_overcommit`; sizes the grant scheduler's
/// active array.
pub const HOMA_MAX_GRANTS: usize = 10;

/// Tunable parameters for a [`crate::Homa`] instance. All values have
/// defaults matching a 25 Gbps datacenter deployment; construct with
/// `HomaConfig::default()` and override fields as needed. Call
/// [`HomaConfig::validate`] (done by `Homa::new`) to clamp out-of-range
/// settings and recompute derived values.
#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// Bytes a new message may send without receiving any grants.
    pub unsched_bytes: usize,

    /// Policy for the grant window (maximum granted-but-not-received bytes
    /// per message). 0 means size the window dynamically from
    /// `max_incoming` and the number of messages being granted to;
    /// nonzero is a static window.
    pub window: usize,

    /// Bound on the total granted-but-not-received bytes across all
    /// incoming messages.
    pub max_incoming: usize,

    /// Maximum number of messages that may be receiving grants at once.
    pub max_overcommit: usize,

    /// Bound on simultaneously granted messages from a single peer.
    pub max_rpcs_per_peer: usize,

    /// Minimum microseconds between grant-priority reorder scans.
    pub grant_recalc_usecs: u64,

    /// Bytes added by a FIFO ("pity") grant to the oldest message.
    pub fifo_grant_increment: usize,

    /// Fraction (in thousandths, max 500) of granted bytes reserved for
    /// the oldest grantable message rather than the shortest.
    pub grant_fifo_fraction: usize,

    /// Total number of priority levels available (scheduled + unscheduled).
    pub num_priorities: usize,

    /// Highest priority level used for scheduled packets; levels above
    /// this are reserved for unscheduled packets.
    pub max_sched_prio: u8,

    /// Entry i holds the largest message size that uses priority i for
    /// unscheduled packets. At least one entry must cover
    /// `HOMA_MAX_MESSAGE_LENGTH`.
    pub unsched_cutoffs: [u32; HOMA_MAX_PRIORITIES],

    /// Version number advertised with `unsched_cutoffs`.
    pub cutoff_version: u16,

    /// Raw uplink bandwidth in units of 1e6 bits per second.
    pub link_mbps: u64,

    /// Maximum allowed NIC queue estimate, in nanoseconds; packets that
    /// would push the estimate past this are throttled.
    pub max_nic_queue_ns: u64,

    /// Packets smaller than this bypass the throttle mechanism.
    pub throttle_min_bytes: usize,

    /// Out of every 1000 packets sent by the pacer, this many come from
    /// the oldest throttled message rather than the shortest.
    pub pacer_fifo_fraction: i64,

    /// Ticks of silence before RESEND requests start.
    pub resend_ticks: u32,

    /// Minimum ticks between RESENDs for the same RPC.
    pub resend_interval: u32,

    /// Abort an RPC when its silent-tick count reaches this value.
    pub timeout_ticks: u32,

    /// Number of unanswered RESENDs after which a peer is presumed dead.
    pub timeout_resends: u32,

    /// Ticks to wait for a client ack before sending NEED_ACK.
    pub request_ack_ticks: u32,

    /// Maximum packet buffers freed by one reaper invocation.
    pub reap_limit: usize,

    /// Dead-buffer count above which reaping is escalated.
    pub dead_buffs_limit: usize,

    /// Microseconds a thread busy-polls for a message before sleeping.
    pub poll_usecs: u64,

    /// Microseconds a core may own a bpage before the lease can be revoked.
    pub bpage_lease_usecs: u64,

    /// Largest number of message bytes placed in a single output packet.
    pub max_gso_size: usize,

    /// Limit on send-buffer memory per socket.
    pub wmem_max: usize,

    /// Don't garbage-collect peers unless the table is larger than this.
    pub peer_gc_threshold: usize,

    /// A peer idle longer than this many seconds is eligible for GC.
    pub peer_idle_secs_max: u64,

    /// Disable the output throttling mechanism entirely (send all packets
    /// immediately). For testing.
    pub dont_throttle: bool,
}

impl Default for HomaConfig {
    fn default() -> Self {
        let mut unsched_cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        unsched_cutoffs[HOMA_MAX_PRIORITIES - 1] = 200;
        unsched_cutoffs[HOMA_MAX_PRIORITIES - 2] = 2800;
        unsched_cutoffs[HOMA_MAX_PRIORITIES - 3] = 15000;
        unsched_cutoffs[HOMA_MAX_PRIORITIES - 4] = HOMA_MAX_MESSAGE_LENGTH as u32;
        Self {
            unsched_bytes: 40000,
            window: 0,
            max_incoming: 400_000,
            max_overcommit: 8,
            max_rpcs_per_peer: 1,
            grant_recalc_usecs: 20,
            fifo_grant_increment: 10000,
            grant_fifo_fraction: 50,
            num_priorities: HOMA_MAX_PRIORITIES,
            max_sched_prio: (HOMA_MAX_PRIORITIES - 5) as u8,
            unsched_cutoffs,
            cutoff_version: 1,
            link_mbps: 25000,
            max_nic_queue_ns: 5000,
            throttle_min_bytes: 1000,
            pacer_fifo_fraction: 50,
            resend_ticks: 5,
            resend_interval: 5,
            timeout_ticks: 100,
            timeout_resends: 5,
            request_ack_ticks: 2,
            reap_limit: 10,
            dead_buffs_limit: 5000,
            poll_usecs: 50,
            bpage_lease_usecs: 10000,
            max_gso_size: 10000,
            wmem_max: 100_000_000,
            peer_gc_threshold: 100,
            peer_idle_secs_max: 120,
            dont_throttle: false,
        }
    }
}

impl HomaConfig {
    /// Clamp out-of-range settings and repair the cutoff table so that
    /// unscheduled priorities are always resolvable.
    pub(crate) fn validate(&mut self) {
        if self.max_overcommit > HOMA_MAX_GRANTS {
            self.max_overcommit = HOMA_MAX_GRANTS;
        }
        if self.max_overcommit == 0 {
            self.max_overcommit = 1;
        }
        if self.grant_fifo_fraction > 500 {
            self.grant_fifo_fraction = 500;
        }
        if self.num_priorities > HOMA_MAX_PRIORITIES {
            self.num_priorities = HOMA_MAX_PRIORITIES;
        }
        if self.num_priorities == 0 {
            self.num_priorities = 1;
        }

        /* Guarantee that priority 0 is chosen if nothing else in the
         * cutoff array matches.
         */
        self.unsched_cutoffs[0] = u32::MAX;
        for i in (0..HOMA_MAX_PRIORITIES).rev() {
            if i >= self.num_priorities {
                self.unsched_cutoffs[i] = 0;
                continue;
            }
            if i == 0 {
                self.max_sched_prio = 0;
                break;
            }
            if self.unsched_cutoffs[i] >= HOMA_MAX_MESSAGE_LENGTH as u32 {
                self.max_sched_prio = (i - 1) as u8;
                break;
            }
        }
        if self.max_gso_size == 0 {
            self.max_gso_size = 1400;
        }
    }

    /// Nanoseconds to transmit 1e6 bytes on the uplink. Overestimates by
    /// 1% so the NIC queue estimate never runs short.
    #[inline]
    pub(crate) fn ns_per_mbyte(&self) -> u64 {
        8 * 1000 * 1000 * 1000 * 101 / 100 / self.link_mbps
    }

    /// Bytes to grant through the SRPT path between FIFO grants, derived
    /// from `grant_fifo_fraction`. Zero disables FIFO grants.
    #[inline]
    pub(crate) fn grant_nonfifo(&self) -> i64 {
        if self.grant_fifo_fraction == 0 {
            return 0;
        }
        (1000 * self.fifo_grant_increment / self.grant_fifo_fraction
            - self.fifo_grant_increment) as i64
    }

    /// Priority level for unscheduled bytes of a message of the given
    /// length, per a cutoff table (ours or a peer's).
    pub(crate) fn pick_unsched_priority(
        cutoffs: &[u32; HOMA_MAX_PRIORITIES],
        length: usize,
    ) -> u8 {
        for i in (1..HOMA_MAX_PRIORITIES).rev() {
            if cutoffs[i] as usize >= length && cutoffs[i] != 0 {
                return i as u8;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_clamps_overcommit() {
        let mut cfg = HomaConfig {
            max_overcommit: 50,
            ..Default::default()
        };
        cfg.validate();
        assert_eq!(cfg.max_overcommit, HOMA_MAX_GRANTS);
    }

    #[test]
    fn test_unsched_priority_uses_smallest_covering_level() {
        let mut cfg = HomaConfig::default();
        cfg.validate();
        assert_eq!(
            HomaConfig::pick_unsched_priority(&cfg.unsched_cutoffs, 100),
            7
        );
        assert_eq!(
            HomaConfig::pick_unsched_priority(&cfg.unsched_cutoffs, 3000),
            5
        );
        assert_eq!(
            HomaConfig::pick_unsched_priority(&cfg.unsched_cutoffs, 500_000),
            4
        );
    }

    #[test]
    fn test_grant_nonfifo_matches_fraction() {
        let cfg = HomaConfig::default();
        /* 50/1000 of granted bytes are FIFO: 10000 FIFO bytes for every
         * 190000 SRPT bytes.
         */
        assert_eq!(cfg.grant_nonfifo(), 190_000);
        let none = HomaConfig {
            grant_fifo_fraction: 0,
            ..Default::default()
        };
        assert_eq!(none.grant_nonfifo(), 0);
    }
}
