use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kcp::Kcp;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::crypto::{create_crypto_codec, session_nonce, CryptoCodec, CryptoType, NonceMode};
use crate::error::{Error, Result};
use crate::fec::{FecDecoder, FecEncoder, FEC_DATA_SHARDS, FEC_PARITY_SHARDS};
use crate::protocol::{
    put_proto_type, Clock, ProtoType, HEARTBEAT_PACKET_SIZE, KCP_MTU_DEFAULT, KCP_OVERHEAD,
    MAC_SIZE, MAX_MTU_LIMIT, PACKET_HEADER_SIZE,
};

pub(crate) const DEFAULT_SEND_WINDOW: u32 = 32;
pub(crate) const DEFAULT_RECV_WINDOW: u32 = 128;

/// Per-connection application callbacks. Invoked synchronously from
/// internal tasks; implementations must not block.
pub trait ConnHandler: Send + Sync {
    /// Client side only: the handshake completed and the connection
    /// accepts writes.
    fn on_ready(&self) {}

    /// One reassembled application message, in the order the peer wrote
    /// them. The slice is only valid for the duration of the call.
    fn on_new_data_coming(&self, data: &[u8]);

    /// The connection terminated. `None` for a local, user-initiated
    /// close. Fires exactly once.
    fn on_closed(&self, err: Option<&Error>);
}

/// Everything a datagram passes through between the ARQ engine and the
/// socket: protocol stamp, encryption, FEC. Guarded by one mutex; all
/// operations are non-blocking.
pub(crate) struct Pipeline {
    codec: Option<Box<dyn CryptoCodec>>,
    fec_encoder: Option<FecEncoder>,
    fec_decoder: Option<FecDecoder>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    pool: Arc<BufferPool>,
    clock: Clock,
}

impl Pipeline {
    /// Encrypt and enqueue a handshake or heartbeat datagram. Control
    /// datagrams never enter the FEC encoder; a FEC-enabled receiver
    /// recognizes them through the `UnknownFecCmd` fallback.
    pub(crate) fn send_control(&mut self, mut packet: Vec<u8>) -> Result<()> {
        if let Some(codec) = self.codec.as_mut() {
            codec.encrypt(&mut packet)?;
        }
        self.out_tx.send(packet).map_err(|_| Error::ConnClosed)
    }

    /// Encrypt a data datagram and either enqueue it directly or hand it
    /// to the FEC encoder. Every shard the encoder emits goes out.
    pub(crate) fn send_data(&mut self, mut packet: Vec<u8>) -> Result<()> {
        if let Some(codec) = self.codec.as_mut() {
            codec.encrypt(&mut packet)?;
        }

        let Some(encoder) = self.fec_encoder.as_mut() else {
            return self.out_tx.send(packet).map_err(|_| Error::ConnClosed);
        };

        let now = self.clock.now_ms();
        if let Some(shards) = encoder.encode(&packet, now)? {
            for shard in shards {
                let mut buf = self.pool.get();
                buf.extend_from_slice(shard);
                self.out_tx.send(buf).map_err(|_| Error::ConnClosed)?;
            }
        }
        self.pool.put(packet);
        Ok(())
    }

    /// Force out a partial FEC group that has outlived the flush window.
    pub(crate) fn flush_fec(&mut self, now_ms: u32) -> Result<()> {
        let Some(encoder) = self.fec_encoder.as_mut() else {
            return Ok(());
        };
        if !encoder.should_flush(now_ms) {
            return Ok(());
        }
        if let Some(shards) = encoder.flush(now_ms)? {
            for shard in shards {
                let mut buf = self.pool.get();
                buf.extend_from_slice(shard);
                self.out_tx.send(buf).map_err(|_| Error::ConnClosed)?;
            }
        }
        Ok(())
    }

    fn decrypt_owned(&mut self, data: &mut [u8]) -> Result<Vec<u8>> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(Error::PacketTooShort(data.len()));
        }
        let plain = match self.codec.as_mut() {
            Some(codec) => codec.decrypt(data)?,
            None => &data[MAC_SIZE..],
        };
        let mut buf = self.pool.get();
        buf.extend_from_slice(plain);
        Ok(buf)
    }

    /// Run one raw datagram through FEC decode (when enabled) and
    /// decryption. Yields zero or more plaintext `|TYPE|PAYLOAD|`
    /// packets: a FEC ingest can release several reconstructed
    /// datagrams at once, or none at all.
    pub(crate) fn ingest(&mut self, data: &mut [u8]) -> Result<Vec<Vec<u8>>> {
        let now = self.clock.now_ms();
        let decoded = match self.fec_decoder.as_mut() {
            Some(decoder) => decoder.decode(data, now),
            None => return Ok(vec![self.decrypt_owned(data)?]),
        };

        match decoded {
            Ok(ciphers) => {
                let mut packets = Vec::with_capacity(ciphers.len());
                for mut cipher in ciphers {
                    packets.push(self.decrypt_owned(&mut cipher)?);
                    self.pool.put(cipher);
                }
                Ok(packets)
            }
            // Not a shard: a control datagram on a FEC-enabled link.
            Err(Error::UnknownFecCmd) => Ok(vec![self.decrypt_owned(data)?]),
            Err(err) => Err(err),
        }
    }

    fn install_session_nonce(&mut self, secret: u64) -> Result<()> {
        if let Some(codec) = self.codec.as_mut() {
            let nonce = session_nonce(secret);
            codec.set_read_nonce(&nonce)?;
            codec.set_write_nonce(&nonce)?;
        }
        Ok(())
    }
}

/// The ARQ engine's outbound callback: every segment it produces is
/// stamped, encrypted and queued as a data datagram. Runs while the
/// connection core lock is held, so it may take the pipeline lock but
/// nothing else.
pub(crate) struct SegmentSink {
    pipeline: Arc<Mutex<Pipeline>>,
    pool: Arc<BufferPool>,
}

impl Write for SegmentSink {
    fn write(&mut self, segment: &[u8]) -> io::Result<usize> {
        let mut packet = self.pool.get();
        packet.resize(PACKET_HEADER_SIZE, 0);
        packet.extend_from_slice(segment);
        put_proto_type(&mut packet, ProtoType::Data);

        let mut pipeline = self.pipeline.lock().unwrap();
        pipeline
            .send_data(packet)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(segment.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ConnCore {
    kcp: Kcp<SegmentSink>,
}

/// Role-independent half of a connection: the ARQ instance, the packet
/// pipeline, liveness bookkeeping and the close latch. Client and
/// server connections wrap this and add their own loops.
pub(crate) struct RawConn {
    conv: u32,
    peer: SocketAddr,
    clock: Clock,
    core: Mutex<ConnCore>,
    pipeline: Arc<Mutex<Pipeline>>,
    handler: Mutex<Option<Arc<dyn ConnHandler>>>,
    closed: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    last_active_ms: AtomicU32,
    mtu: AtomicUsize,
    max_data_len: AtomicUsize,
    send_window: AtomicU32,
    interval_ms: AtomicU32,
    pool: Arc<BufferPool>,
}

impl RawConn {
    pub(crate) fn new(
        conv: u32,
        peer: SocketAddr,
        clock: Clock,
        cancel: CancellationToken,
        out_tx: mpsc::UnboundedSender<Vec<u8>>,
        pool: Arc<BufferPool>,
        codec: Option<Box<dyn CryptoCodec>>,
    ) -> RawConn {
        let pipeline = Arc::new(Mutex::new(Pipeline {
            codec,
            fec_encoder: None,
            fec_decoder: None,
            out_tx,
            pool: pool.clone(),
            clock,
        }));

        let sink = SegmentSink {
            pipeline: pipeline.clone(),
            pool: pool.clone(),
        };
        let mut arq = Kcp::new(conv, sink);
        arq.set_nodelay(true, crate::protocol::DEFAULT_UPDATE_INTERVAL_MS as i32, 2, true);
        arq.set_mtu(KCP_MTU_DEFAULT - PACKET_HEADER_SIZE)
            .expect("default mtu is valid");
        arq.set_wndsize(DEFAULT_SEND_WINDOW as u16, DEFAULT_RECV_WINDOW as u16);

        RawConn {
            conv,
            peer,
            clock,
            core: Mutex::new(ConnCore { kcp: arq }),
            pipeline,
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel,
            last_active_ms: AtomicU32::new(clock.now_ms()),
            mtu: AtomicUsize::new(KCP_MTU_DEFAULT),
            max_data_len: AtomicUsize::new(KCP_MTU_DEFAULT - PACKET_HEADER_SIZE - KCP_OVERHEAD),
            send_window: AtomicU32::new(DEFAULT_SEND_WINDOW),
            interval_ms: AtomicU32::new(crate::protocol::DEFAULT_UPDATE_INTERVAL_MS),
            pool,
        }
    }

    pub(crate) fn conv_id(&self) -> u32 {
        self.conv
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn clock(&self) -> Clock {
        self.clock
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the close latch. Returns true for the caller that actually
    /// performs the close; everyone else backs off.
    pub(crate) fn begin_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn ConnHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ConnHandler>> {
        self.handler.lock().unwrap().clone()
    }

    pub(crate) fn touch(&self) {
        self.last_active_ms
            .store(self.clock.now_ms(), Ordering::Release);
    }

    pub(crate) fn idle_ms(&self) -> u32 {
        self.clock
            .now_ms()
            .wrapping_sub(self.last_active_ms.load(Ordering::Acquire))
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    fn ensure_not_started(&self, what: &'static str) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyStarted(what));
        }
        Ok(())
    }

    pub(crate) fn use_crypto_codec(&self, ty: CryptoType, mode: NonceMode) -> Result<()> {
        self.ensure_not_started("crypto codec")?;
        self.pipeline.lock().unwrap().codec = Some(create_crypto_codec(ty, mode));
        Ok(())
    }

    pub(crate) fn has_codec(&self) -> bool {
        self.pipeline.lock().unwrap().codec.is_some()
    }

    pub(crate) fn enable_fec(&self) -> Result<()> {
        self.ensure_not_started("fec")?;
        let mtu = self.mtu.load(Ordering::Acquire);
        let mut pipeline = self.pipeline.lock().unwrap();
        if pipeline.fec_encoder.is_none() {
            pipeline.fec_encoder = Some(FecEncoder::new(FEC_DATA_SHARDS, FEC_PARITY_SHARDS, mtu));
            pipeline.fec_decoder = Some(FecDecoder::new(FEC_DATA_SHARDS, FEC_PARITY_SHARDS));
        }
        Ok(())
    }

    pub(crate) fn set_mtu(&self, mtu: usize) -> Result<()> {
        self.ensure_not_started("mtu")?;
        if mtu >= MAX_MTU_LIMIT || mtu <= PACKET_HEADER_SIZE + KCP_OVERHEAD {
            return Err(Error::InvalidMtu(mtu, MAX_MTU_LIMIT));
        }
        let mut core = self.core.lock().unwrap();
        core.kcp.set_mtu(mtu - PACKET_HEADER_SIZE)?;
        self.mtu.store(mtu, Ordering::Release);
        self.max_data_len
            .store(mtu - PACKET_HEADER_SIZE - KCP_OVERHEAD, Ordering::Release);
        Ok(())
    }

    pub(crate) fn set_window(&self, send_window: u16, recv_window: u16) -> Result<()> {
        self.ensure_not_started("window")?;
        let mut core = self.core.lock().unwrap();
        core.kcp.set_wndsize(send_window, recv_window);
        self.send_window
            .store(send_window as u32, Ordering::Release);
        Ok(())
    }

    pub(crate) fn set_update_interval(&self, interval_ms: u32) -> Result<()> {
        self.ensure_not_started("update interval")?;
        let mut core = self.core.lock().unwrap();
        core.kcp.set_nodelay(true, interval_ms as i32, 2, true);
        self.interval_ms.store(interval_ms, Ordering::Release);
        Ok(())
    }

    pub(crate) fn interval_ms(&self) -> u32 {
        self.interval_ms.load(Ordering::Acquire)
    }

    /// Enqueue one application message for reliable delivery.
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ConnClosed);
        }
        let limit = self.max_data_len.load(Ordering::Acquire);
        if data.len() > limit {
            return Err(Error::WriteDataTooLong(data.len(), limit));
        }

        let mut core = self.core.lock().unwrap();
        let window = self.send_window.load(Ordering::Acquire) as usize;
        if core.kcp.wait_snd() >= window {
            return Err(Error::TryAgain);
        }
        core.kcp.send(data)?;
        Ok(data.len())
    }

    /// Feed one received ARQ segment.
    pub(crate) fn input_segment(&self, segment: &[u8]) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.kcp.input(segment)?;
        Ok(())
    }

    /// Drain reassembled messages, advance the ARQ clock and flush any
    /// stale partial FEC group. Returns how many milliseconds until the
    /// engine wants the next update.
    pub(crate) fn update(&self) -> Result<u32> {
        self.drain_received()?;

        let now = self.clock.now_ms();
        let next = {
            let mut core = self.core.lock().unwrap();
            core.kcp.update(now)?;
            core.kcp.check(now)
        };

        self.pipeline.lock().unwrap().flush_fec(now)?;
        Ok(next.max(1))
    }

    /// Deliver every fully reassembled message to the handler. The core
    /// lock is released around the callback so a handler may call
    /// `write` (for instance to echo).
    fn drain_received(&self) -> Result<()> {
        loop {
            let mut buf = self.pool.get();
            let taken = {
                let mut core = self.core.lock().unwrap();
                match core.kcp.peeksize() {
                    Ok(size) if size > 0 => {
                        buf.resize(size, 0);
                        let n = core.kcp.recv(&mut buf)?;
                        buf.truncate(n);
                        true
                    }
                    _ => false,
                }
            };

            if !taken {
                self.pool.put(buf);
                return Ok(());
            }
            if let Some(handler) = self.handler() {
                handler.on_new_data_coming(&buf);
            }
            self.pool.put(buf);
        }
    }

    /// FEC decode + decrypt one raw datagram into plaintext packets. A
    /// failed FEC reconstruction costs the datagram, not the connection.
    pub(crate) fn ingest_datagram(&self, data: &mut [u8]) -> Result<Vec<Vec<u8>>> {
        match self.pipeline.lock().unwrap().ingest(data) {
            Err(Error::Fec(err)) => {
                tracing::warn!(conv = self.conv, error = %err, "fec reconstruction failed");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    pub(crate) fn send_control_packet(&self, packet: Vec<u8>) -> Result<()> {
        self.pipeline.lock().unwrap().send_control(packet)
    }

    pub(crate) fn send_heartbeat(&self) -> Result<()> {
        let mut packet = self.pool.get();
        packet.resize(HEARTBEAT_PACKET_SIZE, 0);
        put_proto_type(&mut packet, ProtoType::Heartbeat);
        packet[PACKET_HEADER_SIZE..]
            .copy_from_slice(&self.clock.now_ms().to_le_bytes());
        self.send_control_packet(packet)
    }

    pub(crate) fn install_session_nonce(&self, secret: u64) -> Result<()> {
        self.pipeline.lock().unwrap().install_session_nonce(secret)
    }

    /// Recycle a plaintext packet produced by `ingest_datagram`.
    pub(crate) fn recycle(&self, buf: Vec<u8>) {
        self.pool.put(buf);
    }
}

/// Drains a connection's outbound datagram queue onto the shared socket.
/// One task per connection keeps that peer's datagrams serialized. A
/// send failure is fatal for the connection; the caller maps the error.
pub(crate) async fn egress_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    pool: Arc<BufferPool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            datagram = out_rx.recv() => {
                let Some(datagram) = datagram else { return Ok(()) };
                socket.send_to(&datagram, peer).await?;
                pool.put(datagram);
            }
        }
    }
}
