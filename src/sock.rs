//! Sockets and the per-namespace port table.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use ahash::RandomState;
use dashmap::DashMap;

use crate::error::{HomaError, Result};
use crate::interest::Interest;
use crate::pool::BufferPool;
use crate::rpc::{self, Rpc};
use crate::type_alias::*;
use crate::Homa;

/// The 16-bit port space is split in two: ports below this value are
/// reserved for explicitly bound server ports; the rest are default
/// ports handed out automatically at socket creation. Port 0 is invalid.
pub const HOMA_MIN_DEFAULT_PORT: Port = 0x8000;

/// Buckets per RPC hash table (one table for each role). Power of two.
const RPC_BUCKETS: usize = 1024;

bitflags::bitflags! {
    /// Readiness bits reported by [`Socket::poll`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        /// A message is ready for `recv` (or the socket is shut down).
        const IN = 0x1;
        /// Send memory is available.
        const OUT = 0x4;
    }
}

/// One bucket of an RPC hash table. The bucket lock guards only
/// membership; RPC fields are guarded by each RPC's own lock.
pub(crate) struct RpcBucket {
    rpcs: Mutex<Vec<Arc<Rpc>>>,
}

impl RpcBucket {
    fn new() -> Self {
        RpcBucket {
            rpcs: Mutex::new(Vec::new()),
        }
    }

    pub fn find<F: Fn(&Arc<Rpc>) -> bool>(&self, pred: F) -> Option<Arc<Rpc>> {
        self.rpcs.lock().unwrap().iter().find(|r| pred(*r)).cloned()
    }

    pub fn insert(&self, rpc: Arc<Rpc>) {
        self.rpcs.lock().unwrap().push(rpc);
    }

    pub fn remove(&self, rpc: &Arc<Rpc>) {
        self.rpcs.lock().unwrap().retain(|r| !Arc::ptr_eq(r, rpc));
    }
}

/// Frequently modified socket state, behind the socket lock.
pub(crate) struct SockState {
    /// Every live RPC on the socket, oldest first. Redundant with the
    /// hash tables but cheap for the timer to scan.
    pub active: Vec<Arc<Rpc>>,

    /// Ended RPCs whose buffers haven't yet been freed.
    pub dead: VecDeque<Arc<Rpc>>,

    /// Packet buffers held by RPCs on `dead`.
    pub dead_skbs: usize,

    /// RPCs blocked because the buffer pool had no space for their
    /// incoming messages; sorted by message length (shortest first).
    pub waiting_for_bufs: Vec<Arc<Rpc>>,

    /// RPCs ready for attention from an application thread.
    pub ready_rpcs: VecDeque<Arc<Rpc>>,

    /// Threads waiting in shared mode for an incoming message.
    pub interests: Vec<Arc<Interest>>,
}

/// An open Homa socket.
pub struct Socket {
    pub(crate) homa: Arc<Homa>,
    weak_self: Weak<Socket>,

    port: AtomicU16,
    is_server: AtomicBool,
    shutdown: AtomicBool,

    /// Buffer pool for incoming messages.
    pub(crate) pool: BufferPool,

    pub(crate) state: Mutex<SockState>,

    /// Bytes of message data held by unreaped outgoing messages.
    tx_memory: AtomicUsize,
    wmem_mutex: Mutex<()>,
    wmem_cv: Condvar,

    client_buckets: Box<[RpcBucket]>,
    server_buckets: Box<[RpcBucket]>,
}

impl Socket {
    pub(crate) fn create(homa: &Arc<Homa>) -> Result<Arc<Socket>> {
        let sock = Arc::new_cyclic(|weak| Socket {
            homa: homa.clone(),
            weak_self: weak.clone(),
            port: AtomicU16::new(0),
            is_server: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            pool: BufferPool::new(),
            state: Mutex::new(SockState {
                active: Vec::new(),
                dead: VecDeque::new(),
                dead_skbs: 0,
                waiting_for_bufs: Vec::new(),
                ready_rpcs: VecDeque::new(),
                interests: Vec::new(),
            }),
            tx_memory: AtomicUsize::new(0),
            wmem_mutex: Mutex::new(()),
            wmem_cv: Condvar::new(),
            client_buckets: (0..RPC_BUCKETS).map(|_| RpcBucket::new()).collect(),
            server_buckets: (0..RPC_BUCKETS).map(|_| RpcBucket::new()).collect(),
        });
        homa.socktab.assign_default_port(&sock)?;
        Ok(sock)
    }

    #[inline]
    pub(crate) fn arc(&self) -> Arc<Socket> {
        self.weak_self.upgrade().expect("socket already dropped")
    }

    /// The socket's current port.
    #[inline]
    pub fn port(&self) -> Port {
        self.port.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_port(&self, port: Port) {
        self.port.store(port, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_server(&self) -> bool {
        self.is_server.load(Ordering::Acquire)
    }

    /// Allow (or stop allowing) this socket to receive requests.
    pub fn set_server(&self, on: bool) {
        self.is_server.store(on, Ordering::Release);
    }

    /// Install the receive-buffer region. May be called once per socket.
    pub fn set_buffer_region(&self, region: Vec<u8>) -> Result<()> {
        self.pool.set_region(region).map_err(|_| HomaError::InvalidArg)
    }

    /// Application-side read of received message bytes (`offset` comes
    /// from the bpage offsets returned by `recv`).
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) {
        self.pool.read(offset, out);
    }

    /// Total bytes in the installed buffer region (0 if none yet).
    pub fn buffer_region_len(&self) -> usize {
        self.pool.region_len()
    }

    /// Reassign the socket's port. Ports at or above
    /// [`HOMA_MIN_DEFAULT_PORT`] are reserved and rejected; port 0 is a
    /// no-op (the socket keeps its default port).
    pub fn bind(&self, port: Port) -> Result<()> {
        if port == 0 {
            return Ok(());
        }
        if port >= HOMA_MIN_DEFAULT_PORT {
            return Err(HomaError::InvalidArg);
        }
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        self.homa.socktab.rebind(&self.arc(), port)
    }

    /// Disable the socket: end every RPC, wake every waiter. Idempotent;
    /// a second shutdown succeeds as a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("shutting down socket on port {}", self.port());
        self.homa.socktab.unlink(self);

        let rpcs: Vec<Arc<Rpc>> = self.state.lock().unwrap().active.clone();
        for r in rpcs {
            rpc::end(&self.homa, &r);
        }

        let interests: Vec<Arc<Interest>> = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.interests)
        };
        for interest in interests {
            interest.notify(None);
        }
        self.wake_tx_waiters();

        let hsk = self.arc();
        while !self.state.lock().unwrap().dead.is_empty() {
            rpc::reap(&self.homa, &hsk, true);
        }
    }

    /// Readiness for poll/epoll-style multiplexing.
    pub fn poll(&self) -> PollEvents {
        let mut events = PollEvents::empty();
        if self.is_shutdown() || !self.state.lock().unwrap().ready_rpcs.is_empty() {
            events |= PollEvents::IN;
        }
        if self.tx_memory_available() {
            events |= PollEvents::OUT;
        }
        events
    }

    #[inline]
    pub(crate) fn client_bucket(&self, id: RpcId) -> &RpcBucket {
        &self.client_buckets[((id >> 1) as usize) & (RPC_BUCKETS - 1)]
    }

    #[inline]
    pub(crate) fn server_bucket(&self, id: RpcId) -> &RpcBucket {
        /* Clients allocate ids sequentially, so the id distributes
         * across the space on its own.
         */
        &self.server_buckets[((id >> 1) as usize) & (RPC_BUCKETS - 1)]
    }

    /* Send-memory accounting. */

    #[inline]
    pub(crate) fn tx_memory_available(&self) -> bool {
        self.tx_memory.load(Ordering::Acquire) < self.homa.config.wmem_max
    }

    pub(crate) fn reserve_tx_memory(&self, bytes: usize) {
        self.tx_memory.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn free_tx_memory(&self, bytes: usize) {
        self.tx_memory.fetch_sub(bytes, Ordering::AcqRel);
        if self.tx_memory_available() {
            self.wake_tx_waiters();
        }
    }

    fn wake_tx_waiters(&self) {
        let _guard = self.wmem_mutex.lock().unwrap();
        self.wmem_cv.notify_all();
    }

    /// Block until send memory is available (or fail with `WouldBlock`
    /// when nonblocking, `Shutdown` if the socket goes away).
    pub(crate) fn wait_tx_memory(&self, nonblocking: bool) -> Result<()> {
        if self.tx_memory_available() {
            return Ok(());
        }
        if nonblocking {
            return Err(HomaError::WouldBlock);
        }
        let mut guard = self.wmem_mutex.lock().unwrap();
        while !self.tx_memory_available() && !self.is_shutdown() {
            guard = self.wmem_cv.wait(guard).unwrap();
        }
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        Ok(())
    }
}

/// Port→socket table for one transport instance. Lookups are lock-free;
/// all modifications serialize on the allocation lock.
pub(crate) struct Socktab {
    ports: DashMap<Port, Arc<Socket>, RandomState>,

    /// Guards port assignment; holds the most recent default port
    /// handed out.
    alloc: Mutex<Port>,
}

impl Socktab {
    pub fn new() -> Self {
        Socktab {
            ports: DashMap::with_hasher(RandomState::new()),
            alloc: Mutex::new(HOMA_MIN_DEFAULT_PORT - 1),
        }
    }

    pub fn get(&self, port: Port) -> Option<Arc<Socket>> {
        self.ports.get(&port).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<Arc<Socket>> {
        self.ports.iter().map(|e| e.value().clone()).collect()
    }

    /// Pick an unused default port for a new socket and publish it.
    /// Fails with `AddrNotAvail` after a full sweep of the range.
    pub fn assign_default_port(&self, sock: &Arc<Socket>) -> Result<()> {
        let mut prev = self.alloc.lock().unwrap();
        let starting = *prev;
        loop {
            *prev = prev.wrapping_add(1);
            if *prev < HOMA_MIN_DEFAULT_PORT {
                *prev = HOMA_MIN_DEFAULT_PORT;
            }
            if !self.ports.contains_key(&*prev) {
                break;
            }
            if *prev == starting {
                return Err(HomaError::AddrNotAvail);
            }
        }
        sock.set_port(*prev);
        self.ports.insert(*prev, sock.clone());
        Ok(())
    }

    /// Move a socket to an explicitly requested server port.
    pub fn rebind(&self, sock: &Arc<Socket>, port: Port) -> Result<()> {
        let _alloc = self.alloc.lock().unwrap();
        if let Some(owner) = self.ports.get(&port) {
            if Arc::ptr_eq(&owner, sock) {
                return Ok(());
            }
            return Err(HomaError::AddrInUse);
        }
        let old = sock.port();
        if let Some(cur) = self.ports.get(&old).map(|s| s.clone()) {
            if Arc::ptr_eq(&cur, sock) {
                self.ports.remove(&old);
            }
        }
        sock.set_port(port);
        self.ports.insert(port, sock.clone());
        Ok(())
    }

    /// Remove a socket from the table (shutdown path); incoming packets
    /// for its port are dropped from now on.
    pub fn unlink(&self, sock: &Socket) {
        let _alloc = self.alloc.lock().unwrap();
        let port = sock.port();
        if let Some(cur) = self.ports.get(&port).map(|s| s.clone()) {
            if std::ptr::eq(cur.as_ref(), sock) {
                self.ports.remove(&port);
            }
        }
    }
}
