//! Error type surfaced by the public API.
//!
//! Packet-level problems are never reported here; they are absorbed into
//! RPC state and surface later as the error of a specific RPC.

use thiserror::Error;

/// Errors returned by Homa operations. Each variant corresponds to a
/// classic errno so that the crate can sit directly behind a syscall shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HomaError {
    /// Malformed arguments, wrong address family, oversize message, or an
    /// operation that doesn't fit the RPC's current state.
    #[error("invalid argument")]
    InvalidArg,

    /// A nonblocking operation would have had to block.
    #[error("operation would block")]
    WouldBlock,

    /// Buffer pool or allocation exhaustion (possibly on the peer).
    #[error("out of buffer space")]
    NoMemory,

    /// The requested port is owned by another socket.
    #[error("address already in use")]
    AddrInUse,

    /// The default-port range has been exhausted.
    #[error("no ports available")]
    AddrNotAvail,

    /// The socket has been shut down.
    #[error("socket has been shut down")]
    Shutdown,

    /// A blocking wait was cancelled before completion.
    #[error("interrupted")]
    Interrupted,

    /// The peer stopped responding to RESEND requests.
    #[error("peer timed out")]
    TimedOut,

    /// ICMP host/address unreachable.
    #[error("host unreachable")]
    HostUnreachable,

    /// ICMP port unreachable: no Homa server on the destination port.
    #[error("destination refused connection")]
    NotConnected,

    /// ICMP protocol unreachable: the peer does not speak Homa.
    #[error("protocol not supported by peer")]
    ProtoUnsupported,
}

impl HomaError {
    /// The errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            HomaError::InvalidArg => libc::EINVAL,
            HomaError::WouldBlock => libc::EAGAIN,
            HomaError::NoMemory => libc::ENOMEM,
            HomaError::AddrInUse => libc::EADDRINUSE,
            HomaError::AddrNotAvail => libc::EADDRNOTAVAIL,
            HomaError::Shutdown => libc::ESHUTDOWN,
            HomaError::Interrupted => libc::EINTR,
            HomaError::TimedOut => libc::ETIMEDOUT,
            HomaError::HostUnreachable => libc::EHOSTUNREACH,
            HomaError::NotConnected => libc::ENOTCONN,
            HomaError::ProtoUnsupported => libc::EPROTONOSUPPORT,
        }
    }
}

pub type Result<T> = std::result::Result<T, HomaError>;
