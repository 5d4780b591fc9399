use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::conn::{egress_loop, ConnHandler, RawConn};
use crate::crypto::{CryptoType, NonceMode};
use crate::dh64;
use crate::error::{Error, Result};
use crate::protocol::{
    peek_proto_type, put_proto_type, Clock, ProtoType, CONV_ID_ORIGIN, HANDSHAKE_PACKET_SIZE,
    HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_MTU_LIMIT, PACKET_HEADER_SIZE, PROTO_SIZE,
};

const HANDSHAKE_RETRY_BASE_MS: u64 = 500;
const HANDSHAKE_RETRY_MAX_MS: u64 = 4_000;
const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Allocates conversation ids for outgoing connections. One factory per
/// process (or per test) keeps ids unique across its clients.
pub struct ClientFactory {
    next_conv: AtomicU32,
}

impl ClientFactory {
    pub fn new() -> ClientFactory {
        ClientFactory {
            next_conv: AtomicU32::new(CONV_ID_ORIGIN),
        }
    }

    /// Allocate a client connection. Nothing is sent until `start`.
    pub fn new_client_conn(
        &self,
        socket: UdpSocket,
        peer: SocketAddr,
        handler: Arc<dyn ConnHandler>,
        buffer_len: usize,
    ) -> ClientConn {
        let conv = self.next_conv.fetch_add(1, Ordering::Relaxed) + 1;
        ClientConn::with_conv(conv, socket, peer, handler, buffer_len)
    }
}

impl Default for ClientFactory {
    fn default() -> ClientFactory {
        ClientFactory::new()
    }
}

struct ClientInner {
    raw: RawConn,
    socket: Arc<UdpSocket>,
    buffer_len: usize,
    keys: Mutex<Option<(u64, u64)>>,
    ready: AtomicBool,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    me: Weak<ClientInner>,
}

/// Active-open endpoint of a conversation. Owns its socket, its receive
/// loop and its update/heartbeat loop.
pub struct ClientConn {
    inner: Arc<ClientInner>,
}

impl ClientConn {
    fn with_conv(
        conv: u32,
        socket: UdpSocket,
        peer: SocketAddr,
        handler: Arc<dyn ConnHandler>,
        buffer_len: usize,
    ) -> ClientConn {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(MAX_MTU_LIMIT));
        let raw = RawConn::new(
            conv,
            peer,
            Clock::new(),
            CancellationToken::new(),
            out_tx,
            pool,
            None,
        );
        raw.set_handler(handler);

        ClientConn {
            inner: Arc::new_cyclic(|me| ClientInner {
                raw,
                socket: Arc::new(socket),
                buffer_len: if buffer_len == 0 { MAX_MTU_LIMIT } else { buffer_len },
                keys: Mutex::new(None),
                ready: AtomicBool::new(false),
                out_rx: Mutex::new(Some(out_rx)),
                me: me.clone(),
            }),
        }
    }

    pub fn conv_id(&self) -> u32 {
        self.inner.raw.conv_id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.raw.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.raw.is_closed()
    }

    /// Select the crypto variant with the legacy (fixed-nonce) session
    /// discipline. Must precede `start`.
    pub fn use_crypto_codec(&self, ty: CryptoType) -> Result<()> {
        self.inner.raw.use_crypto_codec(ty, NonceMode::LegacyReuse)
    }

    /// Like [`use_crypto_codec`](Self::use_crypto_codec) with an explicit
    /// nonce mode. Both peers must be configured identically.
    pub fn use_crypto_codec_with_mode(&self, ty: CryptoType, mode: NonceMode) -> Result<()> {
        self.inner.raw.use_crypto_codec(ty, mode)
    }

    /// Enable FEC with the default shard layout. Must precede `start`.
    pub fn enable_fec(&self) -> Result<()> {
        self.inner.raw.enable_fec()
    }

    pub fn set_mtu(&self, mtu: usize) -> Result<()> {
        self.inner.raw.set_mtu(mtu)
    }

    pub fn set_window(&self, send_window: u16, recv_window: u16) -> Result<()> {
        self.inner.raw.set_window(send_window, recv_window)
    }

    pub fn set_update_interval(&self, interval_ms: u32) -> Result<()> {
        self.inner.raw.set_update_interval(interval_ms.max(1))
    }

    pub fn set_conn_handler(&self, handler: Arc<dyn ConnHandler>) {
        self.inner.raw.set_handler(handler);
    }

    /// Send the handshake and spawn the receive machinery. The
    /// handshake is re-sent with exponential backoff until the server
    /// replies; if nothing arrives within the handshake window the
    /// connection closes with `HandshakeTimeout`.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.raw.is_closed() {
            return Err(Error::ConnClosed);
        }
        let Some(out_rx) = inner.out_rx.lock().unwrap().take() else {
            return Err(Error::AlreadyStarted("start"));
        };
        inner.raw.mark_started();

        if inner.raw.has_codec() {
            let mut rng = rand::thread_rng();
            *inner.keys.lock().unwrap() = Some(dh64::key_pair(&mut rng));
        }
        inner.send_handshake()?;

        tracing::debug!(conv = inner.raw.conv_id(), peer = %inner.raw.peer(), "client started");

        let egress_inner = inner.clone();
        let egress_cancel = inner.raw.cancel_token().child_token();
        tokio::spawn(async move {
            let result = egress_loop(
                egress_inner.socket.clone(),
                egress_inner.raw.peer(),
                out_rx,
                egress_cancel,
                egress_inner.raw.pool().clone(),
            )
            .await;
            if let Err(err) = result {
                egress_inner.close_with(Some(err));
            }
        });

        tokio::spawn(read_loop(inner.clone()));
        tokio::spawn(handshake_retry_loop(inner.clone()));
        Ok(())
    }

    /// Enqueue one application message. `TryAgain` under backpressure,
    /// `WriteDataTooLong` over the size limit, `ConnClosed` after close.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.raw.write(data)
    }

    /// Idempotent; fires `on_closed(None)` on the first call only.
    pub fn close(&self) {
        self.inner.close_with(None);
    }
}

impl ClientInner {
    fn send_handshake(&self) -> Result<()> {
        let mut packet = self.raw.pool().get();
        packet.resize(HANDSHAKE_PACKET_SIZE, 0);
        put_proto_type(&mut packet, ProtoType::Handshake);
        packet[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + 4]
            .copy_from_slice(&self.raw.conv_id().to_le_bytes());
        if let Some((_, public)) = *self.keys.lock().unwrap() {
            packet[PACKET_HEADER_SIZE + 4..].copy_from_slice(&public.to_le_bytes());
        }
        self.raw.send_control_packet(packet)
    }

    fn close_with(&self, err: Option<Error>) {
        if !self.raw.begin_close() {
            return;
        }
        self.raw.cancel_token().cancel();
        tracing::debug!(conv = self.raw.conv_id(), error = ?err, "client connection closed");
        if let Some(handler) = self.raw.handler() {
            handler.on_closed(err.as_ref());
        }
    }

    fn on_raw_datagram(&self, data: &mut [u8]) -> Result<()> {
        let packets = self.raw.ingest_datagram(data)?;
        for packet in packets {
            let result = self.dispatch(&packet);
            self.raw.recycle(packet);
            result?;
        }
        Ok(())
    }

    fn dispatch(&self, packet: &[u8]) -> Result<()> {
        if packet.len() < PROTO_SIZE {
            return Err(Error::PacketTooShort(packet.len()));
        }
        let raw_type = peek_proto_type(packet);
        let payload = &packet[PROTO_SIZE..];
        match ProtoType::from_wire(raw_type) {
            Some(ProtoType::Handshake) => self.on_handshake(payload),
            // Liveness was refreshed by the receive loop already.
            Some(ProtoType::Heartbeat) => Ok(()),
            Some(ProtoType::Data) => self.raw.input_segment(payload),
            None => Err(Error::UnknownProtocolType(raw_type)),
        }
    }

    fn on_handshake(&self, payload: &[u8]) -> Result<()> {
        if self.ready.swap(true, Ordering::AcqRel) {
            // Duplicate reply, e.g. the server answered a retry.
            return Ok(());
        }

        if self.raw.has_codec() {
            if payload.len() < 8 {
                return Err(Error::PacketTooShort(payload.len()));
            }
            let server_public = u64::from_le_bytes(payload[..8].try_into().expect("8-byte slice"));
            let keys = *self.keys.lock().unwrap();
            if let Some((private, _)) = keys {
                let secret = dh64::secret(private, server_public);
                self.raw.install_session_nonce(secret)?;
            }
        }

        self.raw.send_heartbeat()?;
        tracing::debug!(conv = self.raw.conv_id(), "handshake complete");
        if let Some(handler) = self.raw.handler() {
            handler.on_ready();
        }
        if let Some(me) = self.me.upgrade() {
            tokio::spawn(update_loop(me));
        }
        Ok(())
    }
}

async fn read_loop(inner: Arc<ClientInner>) {
    let cancel = inner.raw.cancel_token().child_token();
    let mut buf = vec![0u8; inner.buffer_len];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = inner.socket.recv_from(&mut buf) => {
                match received {
                    Err(err) => {
                        inner.close_with(Some(Error::Io(err)));
                        return;
                    }
                    Ok((n, addr)) => {
                        if addr != inner.raw.peer() {
                            inner.close_with(Some(Error::DifferentAddr));
                            return;
                        }
                        inner.raw.touch();
                        if n == 0 {
                            continue;
                        }
                        if let Err(err) = inner.on_raw_datagram(&mut buf[..n]) {
                            inner.close_with(Some(err));
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Re-send the handshake with exponential backoff until the connection
/// becomes ready, the handshake window expires, or the connection dies.
async fn handshake_retry_loop(inner: Arc<ClientInner>) {
    let cancel = inner.raw.cancel_token().child_token();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
    let mut delay = Duration::from_millis(HANDSHAKE_RETRY_BASE_MS);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if inner.ready.load(Ordering::Acquire) || inner.raw.is_closed() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            inner.close_with(Some(Error::HandshakeTimeout));
            return;
        }

        tracing::debug!(conv = inner.raw.conv_id(), "re-sending handshake");
        if let Err(err) = inner.send_handshake() {
            inner.close_with(Some(err));
            return;
        }
        delay = (delay * 2).min(Duration::from_millis(HANDSHAKE_RETRY_MAX_MS));
    }
}

/// Post-handshake driver: ARQ update ticks plus the 2-second heartbeat
/// and liveness check.
async fn update_loop(inner: Arc<ClientInner>) {
    let cancel = inner.raw.cancel_token().child_token();

    let mut update_tick =
        tokio::time::interval(Duration::from_millis(inner.raw.interval_ms().max(1) as u64));
    update_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut heartbeat_tick =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = update_tick.tick() => {
                if let Err(err) = inner.raw.update() {
                    inner.close_with(Some(err));
                    return;
                }
            }
            _ = heartbeat_tick.tick() => {
                if inner.raw.idle_ms() > HEARTBEAT_TIMEOUT_MS {
                    inner.close_with(Some(Error::HeartbeatTimeout));
                    return;
                }
                if let Err(err) = inner.raw.send_heartbeat() {
                    inner.close_with(Some(err));
                    return;
                }
            }
        }
    }
}
