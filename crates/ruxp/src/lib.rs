//! ruxp — reliable, ordered, encrypted message transport over UDP.
//!
//! Each client/server connection multiplexes on a 32-bit conversation
//! id, negotiates a per-connection key with a DH64 handshake, and turns
//! best-effort datagrams into in-order application messages through a
//! KCP-style ARQ engine. Optional Reed-Solomon FEC recovers lost
//! datagrams without waiting for retransmission; 2-second heartbeats
//! keep liveness.
//!
//! Outbound, a message flows application → ARQ → protocol stamp →
//! AEAD encrypt → (FEC encode) → socket. Inbound is the mirror image,
//! ending in [`ConnHandler::on_new_data_coming`].

mod buffer;
mod client;
mod conn;
mod crypto;
mod dh64;
mod error;
mod fec;
mod protocol;
mod server;
mod timer;

pub use client::{ClientConn, ClientFactory};
pub use conn::ConnHandler;
pub use crypto::{CryptoType, NonceMode};
pub use error::{Error, Result};
pub use fec::{FEC_DATA_SHARDS, FEC_PARITY_SHARDS};
pub use protocol::{
    ProtoType, HANDSHAKE_PACKET_SIZE, HANDSHAKE_REPLY_SIZE, KCP_MTU_DEFAULT, MAC_SIZE,
    MAX_MTU_LIMIT, PACKET_HEADER_SIZE,
};
pub use server::{Server, ServerConn, ServerHandler};
