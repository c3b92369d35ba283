//! Receive-buffer pools.
//!
//! Each socket owns a pool backed by an application-supplied region,
//! divided into fixed-size "bpages". Incoming messages are reassembled
//! directly into bpages; `recv` transfers bpage ownership to the
//! application, which returns the pages through a later `recv`.
//!
//! Allocation prefers the lowest-numbered free bpages (to keep the cache
//! footprint small) and leases one partial bpage per core so that small
//! messages on different cores don't contend.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::wire::HOMA_MAX_MESSAGE_LENGTH;

pub(crate) const HOMA_BPAGE_SHIFT: usize = 16;

/// Bytes per receive-buffer page. Must be a power of two.
pub const HOMA_BPAGE_SIZE: usize = 1 << HOMA_BPAGE_SHIFT;

/// The largest number of bpages a single incoming message can occupy.
pub const HOMA_MAX_BPAGES: usize =
    (HOMA_MAX_MESSAGE_LENGTH + HOMA_BPAGE_SIZE - 1) >> HOMA_BPAGE_SHIFT;

/* Pools must always have at least this many bpages. */
const MIN_POOL_SIZE: usize = 2;

/* Used when determining how many bpages to consider for allocation. */
const MIN_EXTRA: usize = 4;

/// Allocation state for one bpage.
struct Bpage {
    /// Claim lock for the available-check-then-take sequence.
    lock: Mutex<()>,

    /// Distinct uses of this page: one per message occupying it, plus one
    /// if a core currently owns it.
    refs: AtomicI32,

    /// Core that owns this page for partial allocations, or -1.
    owner: AtomicI32,

    /// Time (ns) after which the page may be stolen from its owner.
    expiration: AtomicU64,
}

/// Core-local allocation state (the partial bpage this core is carving
/// small message tails out of).
#[derive(Default)]
struct PoolCore {
    /// Index of a bpage that may be owned by this core.
    page_hint: usize,

    /// Bytes already allocated from the owned page.
    allocated: usize,

    /// Where the next free-page search resumes.
    next_candidate: usize,
}

/// The application-supplied memory plus the descriptors that manage it.
struct Region {
    base: *mut u8,
    len: usize,
    num_bpages: usize,
    descriptors: Vec<Bpage>,
    cores: Vec<Mutex<PoolCore>>,
    /* Keeps the allocation alive; never read directly. */
    _backing: Box<[u8]>,
}

/* The raw pointer aliases _backing, which is never touched through the
 * Box; all access goes through base with offsets handed out exclusively
 * by the allocator below.
 */
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Outcome of a message-buffer allocation attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PoolAlloc {
    /// Buffers allocated; offsets (from region start) for each bpage.
    Ok(Vec<u32>),

    /// Not enough free bpages right now; retry when pages are released.
    OutOfSpace,

    /// No buffer region has been configured for the socket.
    NoRegion,
}

/// One socket's receive-buffer pool.
pub(crate) struct BufferPool {
    region: OnceLock<Region>,

    /// Pages available for allocation: pages with zero refs, minus pages
    /// claimed but not yet located by an in-progress allocation.
    free_bpages: AtomicI64,

    /// Free pages required to satisfy the first RPC waiting for buffer
    /// space; `usize::MAX` when nothing is waiting.
    pub bpages_needed: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            region: OnceLock::new(),
            free_bpages: AtomicI64::new(0),
            bpages_needed: AtomicUsize::new(usize::MAX),
        }
    }

    /// Install the buffer region. May be called at most once per pool;
    /// the region must hold at least two bpages.
    pub fn set_region(&self, mut backing: Vec<u8>) -> Result<(), ()> {
        let num_bpages = backing.len() >> HOMA_BPAGE_SHIFT;
        if num_bpages < MIN_POOL_SIZE {
            return Err(());
        }
        backing.resize(num_bpages << HOMA_BPAGE_SHIFT, 0);
        let mut backing = backing.into_boxed_slice();
        let base = backing.as_mut_ptr();
        let len = backing.len();
        let descriptors = (0..num_bpages)
            .map(|_| Bpage {
                lock: Mutex::new(()),
                refs: AtomicI32::new(0),
                owner: AtomicI32::new(-1),
                expiration: AtomicU64::new(0),
            })
            .collect();
        let num_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cores = (0..num_cores).map(|_| Mutex::new(PoolCore::default())).collect();
        let region = Region {
            base,
            len,
            num_bpages,
            descriptors,
            cores,
            _backing: backing,
        };
        self.region.set(region).map_err(|_| ())?;
        self.free_bpages.store(num_bpages as i64, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn has_region(&self) -> bool {
        self.region.get().is_some()
    }

    /// Total bytes in the region (0 if unset).
    pub fn region_len(&self) -> usize {
        self.region.get().map(|r| r.len).unwrap_or(0)
    }

    #[inline]
    pub fn free_bpages(&self) -> i64 {
        self.free_bpages.load(Ordering::Acquire)
    }

    /// Pages needed to hold a message of `length` bytes.
    #[inline]
    pub fn pages_for(length: usize) -> usize {
        (length + HOMA_BPAGE_SIZE - 1) >> HOMA_BPAGE_SHIFT
    }

    fn available(bpage: &Bpage, now_ns: u64) -> bool {
        let refs = bpage.refs.load(Ordering::Acquire);
        refs == 0
            || (refs == 1
                && bpage.owner.load(Ordering::Acquire) >= 0
                && bpage.expiration.load(Ordering::Acquire) <= now_ns)
    }

    /// Allocate `num_pages` full bpages, writing their indices into
    /// `pages`. With `set_owner`, the pages are leased to `core_id` until
    /// `now_ns + lease_ns`. Returns false if the pool is too empty.
    fn get_pages(
        &self,
        region: &Region,
        num_pages: usize,
        pages: &mut Vec<u32>,
        core_id: usize,
        set_owner: bool,
        now_ns: u64,
        lease_ns: u64,
    ) -> bool {
        if self.free_bpages.fetch_sub(num_pages as i64, Ordering::AcqRel)
            < num_pages as i64
        {
            self.free_bpages.fetch_add(num_pages as i64, Ordering::AcqRel);
            return false;
        }

        /* Enough free pages exist somewhere; find them. Consider only
         * low-index pages (up to a moving limit) so a mostly-empty pool
         * keeps reusing the same few pages.
         */
        let mut core = region.cores[core_id].lock().unwrap();
        let mut alloced = 0;
        let mut limit = 0;
        while alloced < num_pages {
            if limit == 0 {
                limit = region.num_bpages
                    - self.free_bpages.load(Ordering::Acquire).max(0) as usize;
                let extra = (limit >> 2).max(MIN_EXTRA);
                limit = (limit + extra).min(region.num_bpages);
            }

            let cur = core.next_candidate;
            core.next_candidate += 1;
            if cur >= limit {
                core.next_candidate = 0;
                /* Concurrent allocations may have grown the in-use set;
                 * recompute the limit each pass.
                 */
                limit = 0;
                continue;
            }
            let bpage = &region.descriptors[cur];

            /* Quick unlocked check, then lock and check again. */
            if !Self::available(bpage, now_ns) {
                continue;
            }
            let Ok(_guard) = bpage.lock.try_lock() else {
                continue;
            };
            if !Self::available(bpage, now_ns) {
                continue;
            }
            if bpage.owner.load(Ordering::Acquire) >= 0 {
                /* Stealing a leased page: it wasn't in the free count. */
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
            }
            if set_owner {
                bpage.refs.store(2, Ordering::Release);
                bpage.owner.store(core_id as i32, Ordering::Release);
                bpage.expiration.store(now_ns + lease_ns, Ordering::Release);
            } else {
                bpage.refs.store(1, Ordering::Release);
                bpage.owner.store(-1, Ordering::Release);
            }
            pages.push(cur as u32);
            alloced += 1;
        }
        true
    }

    /// Allocate buffer space for an incoming message of `length` bytes.
    pub fn alloc_msg(&self, length: usize, now_ns: u64, lease_ns: u64) -> PoolAlloc {
        let Some(region) = self.region.get() else {
            return PoolAlloc::NoRegion;
        };
        let core_id = current_core() % region.cores.len();
        let mut offsets: Vec<u32> = Vec::with_capacity(Self::pages_for(length));

        /* Full bpages first. */
        let full_pages = length >> HOMA_BPAGE_SHIFT;
        if full_pages > 0 {
            let mut pages = Vec::with_capacity(full_pages);
            if !self.get_pages(region, full_pages, &mut pages, core_id, false, now_ns, lease_ns)
            {
                return PoolAlloc::OutOfSpace;
            }
            offsets.extend(pages.iter().map(|p| p << HOMA_BPAGE_SHIFT));
        }

        /* The tail may be less than a full bpage; carve it out of the
         * page this core owns, taking a fresh page if the lease is gone
         * or the page is full.
         */
        let partial = length & (HOMA_BPAGE_SIZE - 1);
        if partial == 0 {
            return PoolAlloc::Ok(offsets);
        }
        let mut core = region.cores[core_id].lock().unwrap();
        let mut need_new_page = true;
        {
            let bpage = &region.descriptors[core.page_hint];
            let _guard = bpage.lock.lock().unwrap();
            if bpage.owner.load(Ordering::Acquire) == core_id as i32 {
                if core.allocated + partial > HOMA_BPAGE_SIZE {
                    if bpage.refs.load(Ordering::Acquire) == 1 {
                        /* Page is otherwise free; restart from the top. */
                        core.allocated = 0;
                        need_new_page = false;
                    } else {
                        bpage.owner.store(-1, Ordering::Release);
                        bpage.refs.fetch_sub(1, Ordering::AcqRel);
                    }
                } else {
                    need_new_page = false;
                }
                if !need_new_page {
                    bpage.expiration.store(now_ns + lease_ns, Ordering::Release);
                    bpage.refs.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        if need_new_page {
            let mut pages = Vec::with_capacity(1);
            drop(core);
            if !self.get_pages(region, 1, &mut pages, core_id, true, now_ns, lease_ns) {
                self.release_buffers(&offsets);
                return PoolAlloc::OutOfSpace;
            }
            core = region.cores[core_id].lock().unwrap();
            core.page_hint = pages[0] as usize;
            core.allocated = 0;
        }
        offsets.push((core.allocated + (core.page_hint << HOMA_BPAGE_SHIFT)) as u32);
        core.allocated += partial;
        PoolAlloc::Ok(offsets)
    }

    /// Return buffer space to the pool. Each entry in `offsets` is an
    /// offset from the start of the region, as previously produced by
    /// [`BufferPool::alloc_msg`].
    pub fn release_buffers(&self, offsets: &[u32]) -> Result<(), ()> {
        let Some(region) = self.region.get() else {
            return Ok(());
        };
        let mut result = Ok(());
        for &offset in offsets {
            let index = (offset as usize) >> HOMA_BPAGE_SHIFT;
            if index >= region.num_bpages {
                result = Err(());
                continue;
            }
            let bpage = &region.descriptors[index];
            if bpage.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
            }
        }
        result
    }

    /// Copy message bytes into the region at a raw offset.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let region = self.region.get().expect("pool region not set");
        assert!(offset + data.len() <= region.len, "pool write out of range");
        // SAFETY: in range per the assert; the allocator hands each byte
        // range to at most one message at a time.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), region.base.add(offset), data.len());
        }
    }

    /// Copy message bytes out of the region (the application-side read).
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        let region = self.region.get().expect("pool region not set");
        assert!(offset + out.len() <= region.len, "pool read out of range");
        // SAFETY: in range per the assert; the caller owns these bpages.
        unsafe {
            std::ptr::copy_nonoverlapping(region.base.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Translate a message offset into a region offset plus the bytes
    /// contiguously available there, given the message's bpage offsets.
    pub fn buffer_for(
        bpage_offsets: &[u32],
        msg_length: usize,
        offset: usize,
    ) -> Option<(usize, usize)> {
        let index = offset >> HOMA_BPAGE_SHIFT;
        if offset >= msg_length || index >= bpage_offsets.len() {
            return None;
        }
        let page_offset = offset & (HOMA_BPAGE_SIZE - 1);
        let available = if index < bpage_offsets.len() - 1 {
            HOMA_BPAGE_SIZE - page_offset
        } else {
            msg_length - offset
        };
        Some((bpage_offsets[index] as usize + page_offset, available))
    }
}

/// Identify the calling thread as a small stable core index.
fn current_core() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static CORE: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    CORE.with(|c| *c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_pages(n: usize) -> BufferPool {
        let pool = BufferPool::new();
        pool.set_region(vec![0u8; n * HOMA_BPAGE_SIZE]).unwrap();
        pool
    }

    #[test]
    fn test_region_must_hold_two_bpages() {
        let pool = BufferPool::new();
        assert!(pool.set_region(vec![0u8; HOMA_BPAGE_SIZE]).is_err());
        assert!(pool.set_region(vec![0u8; 2 * HOMA_BPAGE_SIZE]).is_ok());
    }

    #[test]
    fn test_alloc_full_and_partial_pages() {
        let pool = pool_with_pages(8);
        let PoolAlloc::Ok(offsets) =
            pool.alloc_msg(2 * HOMA_BPAGE_SIZE + 100, 0, 10_000_000)
        else {
            panic!("allocation failed");
        };
        assert_eq!(offsets.len(), 3);
        /* Full pages are bpage-aligned; the tail need not be. */
        assert_eq!(offsets[0] as usize & (HOMA_BPAGE_SIZE - 1), 0);
        assert_eq!(offsets[1] as usize & (HOMA_BPAGE_SIZE - 1), 0);
    }

    #[test]
    fn test_partial_allocations_share_a_leased_page() {
        let pool = pool_with_pages(8);
        let PoolAlloc::Ok(a) = pool.alloc_msg(1000, 0, 10_000_000) else {
            panic!();
        };
        let PoolAlloc::Ok(b) = pool.alloc_msg(1000, 0, 10_000_000) else {
            panic!();
        };
        assert_eq!(
            a[0] as usize >> HOMA_BPAGE_SHIFT,
            b[0] as usize >> HOMA_BPAGE_SHIFT
        );
        assert_eq!(b[0], a[0] + 1000);
    }

    #[test]
    fn test_out_of_space_then_release_recovers() {
        let pool = pool_with_pages(4);
        let PoolAlloc::Ok(offsets) = pool.alloc_msg(4 * HOMA_BPAGE_SIZE, 0, 10_000_000)
        else {
            panic!();
        };
        assert_eq!(
            pool.alloc_msg(HOMA_BPAGE_SIZE, 0, 10_000_000),
            PoolAlloc::OutOfSpace
        );
        pool.release_buffers(&offsets).unwrap();
        assert!(matches!(
            pool.alloc_msg(HOMA_BPAGE_SIZE, 0, 10_000_000),
            PoolAlloc::Ok(_)
        ));
    }

    #[test]
    fn test_expired_lease_can_be_stolen() {
        let pool = pool_with_pages(4);
        /* Lease page 0 for a message tail, then cycle the other pages so
         * the candidate scan wraps back to index 0. Once the lease has
         * expired, the low-index preference should steal page 0 rather
         * than take a higher page.
         */
        let PoolAlloc::Ok(a) = pool.alloc_msg(100, 0, 1000) else {
            panic!();
        };
        pool.release_buffers(&a).unwrap();
        let PoolAlloc::Ok(rest) = pool.alloc_msg(3 * HOMA_BPAGE_SIZE, 0, 1000) else {
            panic!();
        };
        pool.release_buffers(&rest).unwrap();
        let PoolAlloc::Ok(stolen) = pool.alloc_msg(HOMA_BPAGE_SIZE, 2000, 1000) else {
            panic!();
        };
        assert_eq!(stolen, vec![0]);
    }

    #[test]
    fn test_buffer_for_spans_pages() {
        let offsets = vec![0, HOMA_BPAGE_SIZE as u32, 5 * HOMA_BPAGE_SIZE as u32];
        let len = 2 * HOMA_BPAGE_SIZE + 100;
        let (off, avail) = BufferPool::buffer_for(&offsets, len, 10).unwrap();
        assert_eq!((off, avail), (10, HOMA_BPAGE_SIZE - 10));
        let (off, avail) =
            BufferPool::buffer_for(&offsets, len, 2 * HOMA_BPAGE_SIZE + 40).unwrap();
        assert_eq!((off, avail), (5 * HOMA_BPAGE_SIZE + 40, 60));
        assert!(BufferPool::buffer_for(&offsets, len, len).is_none());
    }
}
