use thiserror::Error;

/// Everything that can terminate a connection or reject an operation.
///
/// `UnknownFecCmd` is a signal, not a failure: the receive pipeline uses
/// it to fall back to parsing a datagram as a plain (non-FEC) packet.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection closed")]
    ConnClosed,

    #[error("datagram from unexpected peer address")]
    DifferentAddr,

    #[error("no traffic within the liveness window")]
    HeartbeatTimeout,

    #[error("no handshake reply within the handshake window")]
    HandshakeTimeout,

    #[error("message authentication failed")]
    MessageAuthFailed,

    #[error("invalid nonce size {0}, need at least {1}")]
    InvalidNonceSize(usize, usize),

    #[error("send window full, try again")]
    TryAgain,

    #[error("message of {0} bytes exceeds data length limit {1}")]
    WriteDataTooLong(usize, usize),

    #[error("unknown protocol type {0:#06x}")]
    UnknownProtocolType(u16),

    #[error("handshake received on an established connection")]
    ExistConnection,

    #[error("datagram is not a fec shard")]
    UnknownFecCmd,

    #[error("fec group expired before reconstruction")]
    FecDataTimeout,

    #[error("datagram of {0} bytes is shorter than the packet header")]
    PacketTooShort(usize),

    #[error("mtu {0} exceeds limit {1}")]
    InvalidMtu(usize, usize),

    #[error("{0} must be configured before start")]
    AlreadyStarted(&'static str),

    #[error("server shut down")]
    ServerClosed,

    #[error("arq: {0}")]
    Arq(#[from] kcp::Error),

    #[error("fec: {0}")]
    Fec(#[from] reed_solomon_erasure::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Signals are recovered locally by the receive pipeline and never
    /// close a connection.
    pub fn is_signal(&self) -> bool {
        matches!(self, Error::UnknownFecCmd | Error::TryAgain)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
