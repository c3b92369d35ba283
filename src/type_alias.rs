//! Type aliases used in this library.

/// [`u64`]: RPC identifier. The low-order bit is 0 on the client side of
/// an RPC and 1 on the server side; both refer to the same RPC.
pub type RpcId = u64;

/// [`u16`]: Homa port number.
pub type Port = u16;

/// Return `true` if this host is the client for the RPC with the given id.
#[inline(always)]
pub fn is_client(id: RpcId) -> bool {
    id & 1 == 0
}
