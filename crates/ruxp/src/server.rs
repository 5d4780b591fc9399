use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::conn::{egress_loop, ConnHandler, RawConn};
use crate::crypto::{create_crypto_codec, session_nonce, CryptoType, NonceMode};
use crate::dh64;
use crate::error::{Error, Result};
use crate::protocol::{
    peek_proto_type, put_proto_type, Clock, ProtoType, HANDSHAKE_REPLY_SIZE,
    HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAC_SIZE, MAX_MTU_LIMIT, PACKET_HEADER_SIZE,
    PROTO_SIZE,
};
use crate::timer::TimerScheduler;

/// Server-level application callbacks. Invoked synchronously from
/// internal tasks; implementations must not block.
pub trait ServerHandler: Send + Sync {
    /// A handshake completed and the connection is registered. Install
    /// the per-connection handler here, before any data flows.
    fn on_new_conn_coming(&self, conn: &Arc<ServerConn>);

    /// A connection left the registry. Fires after the removal, once.
    fn on_conn_closed(&self, conn: &Arc<ServerConn>, err: Option<&Error>);

    /// The server itself shut down.
    fn on_closed(&self, err: Option<&Error>);
}

type GoneEvent = (SocketAddr, Arc<ServerConn>, Option<Error>);

/// Passive-open endpoint of a conversation, created by the demux. Does
/// not own a receive loop; the server feeds it, and its update ticks run
/// on the shared timer scheduler.
pub struct ServerConn {
    raw: RawConn,
    gone_tx: mpsc::UnboundedSender<GoneEvent>,
    scheduler: TimerScheduler,
    me: Weak<ServerConn>,
}

impl ServerConn {
    pub fn conv_id(&self) -> u32 {
        self.raw.conv_id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.raw.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    /// Install the per-connection handler; call from
    /// [`ServerHandler::on_new_conn_coming`].
    pub fn set_conn_handler(&self, handler: Arc<dyn ConnHandler>) {
        self.raw.set_handler(handler);
    }

    /// Enable FEC for this connection. Only valid from
    /// `on_new_conn_coming`, before any data datagram arrives; the
    /// client must enable FEC too.
    pub fn enable_fec(&self) -> Result<()> {
        self.raw.enable_fec()
    }

    pub fn set_mtu(&self, mtu: usize) -> Result<()> {
        self.raw.set_mtu(mtu)
    }

    pub fn set_window(&self, send_window: u16, recv_window: u16) -> Result<()> {
        self.raw.set_window(send_window, recv_window)
    }

    pub fn set_update_interval(&self, interval_ms: u32) -> Result<()> {
        self.raw.set_update_interval(interval_ms.max(1))
    }

    /// Enqueue one application message toward this client.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.raw.write(data)
    }

    /// Idempotent; removal from the server and handler callbacks happen
    /// on the server's reaper task.
    pub fn close(&self) {
        self.close_with(None);
    }

    fn close_with(&self, err: Option<Error>) {
        if !self.raw.begin_close() {
            return;
        }
        self.raw.cancel_token().cancel();
        tracing::debug!(conv = self.raw.conv_id(), peer = %self.raw.peer(), error = ?err, "server connection closed");
        if let Some(me) = self.me.upgrade() {
            let _ = self.gone_tx.send((self.raw.peer(), me, err));
        }
    }

    fn dispatch(&self, packet: &[u8]) -> Result<()> {
        if packet.len() < PROTO_SIZE {
            return Err(Error::PacketTooShort(packet.len()));
        }
        let raw_type = peek_proto_type(packet);
        let payload = &packet[PROTO_SIZE..];
        match ProtoType::from_wire(raw_type) {
            Some(ProtoType::Handshake) => Err(Error::ExistConnection),
            Some(ProtoType::Heartbeat) => self.raw.send_heartbeat(),
            Some(ProtoType::Data) => self.raw.input_segment(payload),
            None => Err(Error::UnknownProtocolType(raw_type)),
        }
    }

    fn ingest(&self, data: &mut [u8]) -> Result<()> {
        let packets = self.raw.ingest_datagram(data)?;
        for packet in packets {
            let result = self.dispatch(&packet);
            self.raw.recycle(packet);
            result?;
        }
        Ok(())
    }
}

/// Re-arm the connection's update tick at the deadline the ARQ engine
/// asks for. At most one update task per connection is in flight.
fn schedule_update(conn: Arc<ServerConn>, due_ms: u32) {
    let scheduler = conn.scheduler.clone();
    scheduler.push(due_ms, move || {
        if conn.raw.is_closed() {
            return;
        }
        match conn.raw.update() {
            Ok(next) => {
                let due = conn.raw.clock().now_ms().saturating_add(next);
                schedule_update(conn.clone(), due);
            }
            Err(err) => conn.close_with(Some(err)),
        }
    });
}

/// Liveness tick: every heartbeat interval, close the connection if the
/// client has been silent past the timeout.
fn schedule_liveness(conn: Arc<ServerConn>) {
    let scheduler = conn.scheduler.clone();
    let due = conn
        .raw
        .clock()
        .now_ms()
        .saturating_add(HEARTBEAT_INTERVAL_MS as u32);
    scheduler.push(due, move || {
        if conn.raw.is_closed() {
            return;
        }
        if conn.raw.idle_ms() > HEARTBEAT_TIMEOUT_MS {
            conn.close_with(Some(Error::HeartbeatTimeout));
            return;
        }
        schedule_liveness(conn.clone());
    });
}

struct ServerInner {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn ServerHandler>,
    conns: Mutex<HashMap<SocketAddr, Arc<ServerConn>>>,
    scheduler: TimerScheduler,
    crypto: Mutex<Option<(CryptoType, NonceMode)>>,
    started: AtomicBool,
    start_notify: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
    clock: Clock,
    pool: Arc<BufferPool>,
    gone_tx: mpsc::UnboundedSender<GoneEvent>,
    buffer_len: usize,
}

/// Owns the shared datagram socket and routes each datagram to the
/// connection registered for its source address, creating connections on
/// first contact.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Allocate the server and spawn its (gated) read loop. Traffic is
    /// not consumed until `start`, so handlers and the crypto default
    /// can be configured first.
    pub fn new(
        socket: UdpSocket,
        handler: Arc<dyn ServerHandler>,
        parallelism: u32,
        buffer_len: usize,
    ) -> Server {
        let clock = Clock::new();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            socket: Arc::new(socket),
            handler,
            conns: Mutex::new(HashMap::new()),
            scheduler: TimerScheduler::new(parallelism, clock),
            crypto: Mutex::new(None),
            started: AtomicBool::new(false),
            start_notify: Notify::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            clock,
            pool: Arc::new(BufferPool::new(MAX_MTU_LIMIT)),
            gone_tx,
            buffer_len: if buffer_len == 0 { MAX_MTU_LIMIT } else { buffer_len },
        });

        tokio::spawn(read_loop(inner.clone()));
        tokio::spawn(reaper_loop(inner.clone(), gone_rx));

        Server { inner }
    }

    /// Default crypto variant applied to new connections, with the
    /// legacy nonce discipline.
    pub fn use_crypto_codec(&self, ty: CryptoType) {
        *self.inner.crypto.lock().unwrap() = Some((ty, NonceMode::LegacyReuse));
    }

    pub fn use_crypto_codec_with_mode(&self, ty: CryptoType, mode: NonceMode) {
        *self.inner.crypto.lock().unwrap() = Some((ty, mode));
    }

    /// Begin consuming datagrams.
    pub fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ServerClosed);
        }
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            self.inner.start_notify.notify_one();
            tracing::info!("server started");
        }
        Ok(())
    }

    /// Tear down the scheduler and close every connection. Idempotent.
    pub fn close(&self) {
        shutdown(&self.inner, None);
    }
}

fn shutdown(inner: &Arc<ServerInner>, err: Option<&Error>) {
    if inner
        .closed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    inner.scheduler.close();
    inner.cancel.cancel();

    let drained: Vec<Arc<ServerConn>> = {
        let mut conns = inner.conns.lock().unwrap();
        conns.drain().map(|(_, conn)| conn).collect()
    };
    tracing::info!(conns = drained.len(), "server shutting down");

    for conn in drained {
        if conn.raw.begin_close() {
            conn.raw.cancel_token().cancel();
            if let Some(handler) = conn.raw.handler() {
                handler.on_closed(err);
            }
            inner.handler.on_conn_closed(&conn, err);
        }
    }

    inner.handler.on_closed(err);
}

async fn read_loop(inner: Arc<ServerInner>) {
    // Hold off until start() so the user can finish configuration.
    tokio::select! {
        _ = inner.cancel.cancelled() => return,
        _ = inner.start_notify.notified() => {}
    }

    let mut buf = vec![0u8; inner.buffer_len];
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            received = inner.socket.recv_from(&mut buf) => {
                match received {
                    Err(err) => {
                        shutdown(&inner, Some(&Error::Io(err)));
                        return;
                    }
                    Ok((n, addr)) => {
                        if n > 0 {
                            handle_datagram(&inner, addr, &mut buf[..n]).await;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_datagram(inner: &Arc<ServerInner>, addr: SocketAddr, data: &mut [u8]) {
    let existing = inner.conns.lock().unwrap().get(&addr).cloned();
    match existing {
        Some(conn) => {
            conn.raw.touch();
            if let Err(err) = conn.ingest(data) {
                conn.close_with(Some(err));
            }
        }
        None => on_new_connection(inner, addr, data).await,
    }
}

/// First contact from an address: require a well-formed handshake,
/// answer it, derive the session nonce and register the connection. Any
/// failure drops the datagram without registering anything.
async fn on_new_connection(inner: &Arc<ServerInner>, addr: SocketAddr, data: &mut [u8]) {
    let crypto = *inner.crypto.lock().unwrap();
    let mut codec = crypto.map(|(ty, mode)| create_crypto_codec(ty, mode));

    let plain: Vec<u8> = match codec.as_mut() {
        Some(codec) => match codec.decrypt(data) {
            Ok(plain) => plain.to_vec(),
            Err(err) => {
                tracing::trace!(%addr, error = %err, "dropping undecryptable first datagram");
                return;
            }
        },
        None => {
            if data.len() < PACKET_HEADER_SIZE {
                return;
            }
            data[MAC_SIZE..].to_vec()
        }
    };

    if plain.len() < PROTO_SIZE + 4 + 8 {
        return;
    }
    if ProtoType::from_wire(peek_proto_type(&plain)) != Some(ProtoType::Handshake) {
        tracing::trace!(%addr, "first datagram is not a handshake");
        return;
    }

    let conv = u32::from_le_bytes(plain[2..6].try_into().expect("4-byte slice"));
    if conv == 0 {
        return;
    }
    let client_public = u64::from_le_bytes(plain[6..14].try_into().expect("8-byte slice"));

    let session = if codec.is_some() {
        if client_public == 0 {
            return;
        }
        let mut rng = rand::thread_rng();
        let (server_private, server_public) = dh64::key_pair(&mut rng);
        Some((dh64::secret(server_private, client_public), server_public))
    } else {
        None
    };

    // Answer under the initial nonce; rotate only after the reply is on
    // the wire. The client mirrors this order.
    let mut reply = inner.pool.get();
    reply.resize(HANDSHAKE_REPLY_SIZE, 0);
    put_proto_type(&mut reply, ProtoType::Handshake);
    if let Some((_, server_public)) = session {
        reply[PACKET_HEADER_SIZE..].copy_from_slice(&server_public.to_le_bytes());
    }
    if let Some(codec) = codec.as_mut() {
        if codec.encrypt(&mut reply).is_err() {
            return;
        }
    }
    if let Err(err) = inner.socket.send_to(&reply, addr).await {
        tracing::debug!(%addr, error = %err, "handshake reply failed");
        return;
    }
    inner.pool.put(reply);

    if let (Some(codec), Some((secret, _))) = (codec.as_mut(), session) {
        let nonce = session_nonce(secret);
        if codec.set_read_nonce(&nonce).is_err() || codec.set_write_nonce(&nonce).is_err() {
            return;
        }
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let raw = RawConn::new(
        conv,
        addr,
        inner.clock,
        inner.cancel.child_token(),
        out_tx,
        inner.pool.clone(),
        codec,
    );
    let conn = Arc::new_cyclic(|me| ServerConn {
        raw,
        gone_tx: inner.gone_tx.clone(),
        scheduler: inner.scheduler.clone(),
        me: me.clone(),
    });

    let egress_conn = conn.clone();
    let egress_socket = inner.socket.clone();
    let egress_cancel = conn.raw.cancel_token().child_token();
    tokio::spawn(async move {
        let result = egress_loop(
            egress_socket,
            addr,
            out_rx,
            egress_cancel,
            egress_conn.raw.pool().clone(),
        )
        .await;
        if let Err(err) = result {
            egress_conn.close_with(Some(err));
        }
    });

    inner.conns.lock().unwrap().insert(addr, conn.clone());
    tracing::debug!(conv, %addr, "connection established");

    inner.handler.on_new_conn_coming(&conn);
    conn.raw.mark_started();

    schedule_update(conn.clone(), conn.raw.clock().now_ms());
    schedule_liveness(conn);
}

/// Removes closing connections from the registry, then fires their
/// callbacks. The removal happens before `on_closed`, and never while
/// the registry lock is held around a callback.
async fn reaper_loop(inner: Arc<ServerInner>, mut gone_rx: mpsc::UnboundedReceiver<GoneEvent>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                // Don't lose callbacks for closes already in flight.
                while let Ok(event) = gone_rx.try_recv() {
                    reap(&inner, event);
                }
                return;
            }
            event = gone_rx.recv() => {
                let Some(event) = event else { return };
                reap(&inner, event);
            }
        }
    }
}

fn reap(inner: &Arc<ServerInner>, (addr, conn, err): GoneEvent) {
    {
        let mut conns = inner.conns.lock().unwrap();
        if let Some(current) = conns.get(&addr) {
            if Arc::ptr_eq(current, &conn) {
                conns.remove(&addr);
            }
        }
    }
    if let Some(handler) = conn.raw.handler() {
        handler.on_closed(err.as_ref());
    }
    inner.handler.on_conn_closed(&conn, err.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientFactory;
    use crate::protocol::HANDSHAKE_PACKET_SIZE;
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;

    #[derive(Debug)]
    enum ServerEvent {
        NewConn(u32),
        ConnClosed(u32, Option<String>),
        Closed(Option<String>),
    }

    struct RecordingServerHandler {
        events: tokio_mpsc::UnboundedSender<ServerEvent>,
        data: tokio_mpsc::UnboundedSender<(u32, Vec<u8>)>,
        echo: bool,
        fec: bool,
    }

    impl RecordingServerHandler {
        fn new(
            echo: bool,
            fec: bool,
        ) -> (
            Arc<RecordingServerHandler>,
            tokio_mpsc::UnboundedReceiver<ServerEvent>,
            tokio_mpsc::UnboundedReceiver<(u32, Vec<u8>)>,
        ) {
            let (event_tx, event_rx) = tokio_mpsc::unbounded_channel();
            let (data_tx, data_rx) = tokio_mpsc::unbounded_channel();
            (
                Arc::new(RecordingServerHandler {
                    events: event_tx,
                    data: data_tx,
                    echo,
                    fec,
                }),
                event_rx,
                data_rx,
            )
        }
    }

    impl ServerHandler for RecordingServerHandler {
        fn on_new_conn_coming(&self, conn: &Arc<ServerConn>) {
            if self.fec {
                conn.enable_fec().unwrap();
            }
            conn.set_conn_handler(Arc::new(RecordingConnHandler {
                conv: conn.conv_id(),
                conn: Arc::downgrade(conn),
                data: self.data.clone(),
                echo: self.echo,
            }));
            let _ = self.events.send(ServerEvent::NewConn(conn.conv_id()));
        }

        fn on_conn_closed(&self, conn: &Arc<ServerConn>, err: Option<&Error>) {
            let _ = self.events.send(ServerEvent::ConnClosed(
                conn.conv_id(),
                err.map(|e| format!("{e:?}")),
            ));
        }

        fn on_closed(&self, err: Option<&Error>) {
            let _ = self
                .events
                .send(ServerEvent::Closed(err.map(|e| format!("{e:?}"))));
        }
    }

    struct RecordingConnHandler {
        conv: u32,
        conn: Weak<ServerConn>,
        data: tokio_mpsc::UnboundedSender<(u32, Vec<u8>)>,
        echo: bool,
    }

    impl ConnHandler for RecordingConnHandler {
        fn on_new_data_coming(&self, data: &[u8]) {
            let _ = self.data.send((self.conv, data.to_vec()));
            if self.echo {
                if let Some(conn) = self.conn.upgrade() {
                    let _ = conn.write(data);
                }
            }
        }

        fn on_closed(&self, _err: Option<&Error>) {}
    }

    #[derive(Debug)]
    enum ClientEvent {
        Ready,
        Data(Vec<u8>),
        Closed(Option<String>),
    }

    struct RecordingConnClientHandler {
        events: tokio_mpsc::UnboundedSender<ClientEvent>,
    }

    impl RecordingConnClientHandler {
        fn new() -> (
            Arc<RecordingConnClientHandler>,
            tokio_mpsc::UnboundedReceiver<ClientEvent>,
        ) {
            let (tx, rx) = tokio_mpsc::unbounded_channel();
            (Arc::new(RecordingConnClientHandler { events: tx }), rx)
        }
    }

    impl ConnHandler for RecordingConnClientHandler {
        fn on_ready(&self) {
            let _ = self.events.send(ClientEvent::Ready);
        }

        fn on_new_data_coming(&self, data: &[u8]) {
            let _ = self.events.send(ClientEvent::Data(data.to_vec()));
        }

        fn on_closed(&self, err: Option<&Error>) {
            let _ = self
                .events
                .send(ClientEvent::Closed(err.map(|e| format!("{e:?}"))));
        }
    }

    async fn recv_client_event(
        rx: &mut tokio_mpsc::UnboundedReceiver<ClientEvent>,
        timeout: Duration,
    ) -> ClientEvent {
        tokio::time::timeout(timeout, rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client event channel closed")
    }

    async fn start_server(
        ty: Option<CryptoType>,
        echo: bool,
        fec: bool,
    ) -> (
        Server,
        SocketAddr,
        tokio_mpsc::UnboundedReceiver<ServerEvent>,
        tokio_mpsc::UnboundedReceiver<(u32, Vec<u8>)>,
    ) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (handler, events, data) = RecordingServerHandler::new(echo, fec);
        let server = Server::new(socket, handler, 2, 0);
        if let Some(ty) = ty {
            server.use_crypto_codec(ty);
        }
        server.start().unwrap();
        (server, addr, events, data)
    }

    async fn connect_client(
        factory: &ClientFactory,
        server_addr: SocketAddr,
        ty: Option<CryptoType>,
        fec: bool,
    ) -> (
        crate::client::ClientConn,
        tokio_mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (handler, mut events) = RecordingConnClientHandler::new();
        let client = factory.new_client_conn(socket, server_addr, handler, 0);
        if let Some(ty) = ty {
            client.use_crypto_codec(ty).unwrap();
        }
        if fec {
            client.enable_fec().unwrap();
        }
        client.start().unwrap();

        match recv_client_event(&mut events, Duration::from_secs(5)).await {
            ClientEvent::Ready => {}
            other => panic!("expected Ready, got {other:?}"),
        }
        (client, events)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loopback_echo_plaintext() {
        let (server, addr, mut server_events, _data) = start_server(None, true, false).await;
        let factory = ClientFactory::new();
        let (client, mut client_events) = connect_client(&factory, addr, None, false).await;

        match tokio::time::timeout(Duration::from_secs(2), server_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ServerEvent::NewConn(conv) => assert_eq!(conv, client.conv_id()),
            other => panic!("expected NewConn, got {other:?}"),
        }

        client.write(b"hello").unwrap();
        match recv_client_event(&mut client_events, Duration::from_millis(1500)).await {
            ClientEvent::Data(data) => assert_eq!(data, b"hello"),
            other => panic!("expected echoed data, got {other:?}"),
        }

        client.close();
        match recv_client_event(&mut client_events, Duration::from_secs(1)).await {
            ClientEvent::Closed(None) => {}
            other => panic!("expected clean close, got {other:?}"),
        }
        server.close();
        loop {
            match tokio::time::timeout(Duration::from_secs(2), server_events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ServerEvent::Closed(None) => break,
                ServerEvent::ConnClosed(_, _) => continue,
                other => panic!("unexpected server event {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_encrypted_echo_both_variants() {
        for ty in [CryptoType::Salsa20, CryptoType::Chacha20] {
            let (server, addr, _events, _data) = start_server(Some(ty), true, false).await;
            let factory = ClientFactory::new();
            let (client, mut client_events) = connect_client(&factory, addr, Some(ty), false).await;

            for round in 0..3u32 {
                let message = format!("round trip {round}");
                client.write(message.as_bytes()).unwrap();
                match recv_client_event(&mut client_events, Duration::from_secs(2)).await {
                    ClientEvent::Data(data) => assert_eq!(data, message.as_bytes()),
                    other => panic!("expected echo, got {other:?}"),
                }
            }

            client.close();
            server.close();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fec_recovery_through_lossy_path() {
        let (server, server_addr, _events, mut server_data) =
            start_server(Some(CryptoType::Salsa20), false, true).await;

        // Interpose a proxy that drops two shards of the first FEC group
        // on the client-to-server path.
        let proxy_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_socket.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let mut client_addr: Option<SocketAddr> = None;
            let mut to_drop = vec![1u32, 3u32];
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, from)) = proxy_socket.recv_from(&mut buf).await else {
                    return;
                };
                if from == server_addr {
                    if let Some(client_addr) = client_addr {
                        let _ = proxy_socket.send_to(&buf[..n], client_addr).await;
                    }
                    continue;
                }
                client_addr = Some(from);
                if n >= 8 {
                    let cmd = u16::from_le_bytes([buf[4], buf[5]]);
                    if cmd == 0x0F || cmd == 0x0E {
                        let seq = u32::from_le_bytes(buf[..4].try_into().unwrap());
                        if let Some(pos) = to_drop.iter().position(|s| *s == seq) {
                            to_drop.remove(pos);
                            continue;
                        }
                    }
                }
                let _ = proxy_socket.send_to(&buf[..n], server_addr).await;
            }
        });

        let factory = ClientFactory::new();
        let (client, _client_events) =
            connect_client(&factory, proxy_addr, Some(CryptoType::Salsa20), true).await;

        // Three writes fill one FEC group; the proxy eats shards 1 and 3
        // of it, so the server must rebuild them from parity.
        let messages: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 100]).collect();
        for message in &messages {
            client.write(message).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 3 {
            let (_, data) = tokio::time::timeout(Duration::from_secs(5), server_data.recv())
                .await
                .expect("server did not receive fec-protected data")
                .unwrap();
            received.push(data);
        }
        assert_eq!(received, messages);

        client.close();
        server.close();
        proxy.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_backpressure_try_again() {
        let (server, addr, _events, mut server_data) =
            start_server(None, false, false).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (handler, mut events) = RecordingConnClientHandler::new();
        let factory = ClientFactory::new();
        let client = factory.new_client_conn(socket, addr, handler, 0);
        client.set_window(2, 128).unwrap();
        client.start().unwrap();
        match recv_client_event(&mut events, Duration::from_secs(5)).await {
            ClientEvent::Ready => {}
            other => panic!("expected Ready, got {other:?}"),
        }

        client.write(b"first").unwrap();
        client.write(b"second").unwrap();
        assert!(matches!(client.write(b"third"), Err(Error::TryAgain)));

        // Once the server acks the backlog, the third write goes through.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match client.write(b"third") {
                Ok(_) => break,
                Err(Error::TryAgain) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "window never drained"
                    );
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => panic!("unexpected write error {err:?}"),
            }
        }

        for expected in [b"first".as_slice(), b"second", b"third"] {
            let (_, data) = tokio::time::timeout(Duration::from_secs(3), server_data.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(data, expected);
        }

        client.close();
        server.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ten_clients_demux(){
        let (server, addr, mut server_events, mut server_data) =
            start_server(Some(CryptoType::Chacha20), false, false).await;
        let factory = ClientFactory::new();

        let mut clients = Vec::new();
        for i in 0u32..10 {
            let (client, events) =
                connect_client(&factory, addr, Some(CryptoType::Chacha20), false).await;
            client.write(&i.to_le_bytes()).unwrap();
            clients.push((client, events));
        }

        let mut convs = std::collections::HashSet::new();
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(3), server_events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ServerEvent::NewConn(conv) => {
                    assert!(convs.insert(conv), "duplicate conv id {conv}");
                }
                other => panic!("expected NewConn, got {other:?}"),
            }
        }

        // Each server-side connection sees exactly its client's index.
        let mut seen = std::collections::HashMap::new();
        for _ in 0..10 {
            let (conv, data) = tokio::time::timeout(Duration::from_secs(5), server_data.recv())
                .await
                .unwrap()
                .unwrap();
            let index = u32::from_le_bytes(data[..4].try_into().unwrap());
            assert!(seen.insert(conv, index).is_none());
        }
        let client_convs: std::collections::HashSet<u32> =
            clients.iter().map(|(c, _)| c.conv_id()).collect();
        assert_eq!(client_convs, convs);
        assert_eq!(seen.len(), 10);

        for (client, _) in &clients {
            client.close();
        }
        server.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connection_survives_idle_via_heartbeats() {
        let (server, addr, _events, _data) = start_server(Some(CryptoType::Salsa20), false, false).await;
        let factory = ClientFactory::new();
        let (client, mut client_events) =
            connect_client(&factory, addr, Some(CryptoType::Salsa20), false).await;

        // Longer than the liveness window; heartbeats must keep both
        // sides alive.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(!client.is_closed());
        assert!(client_events.try_recv().is_err(), "no events expected while idle");

        client.write(b"still alive").unwrap();
        client.close();
        server.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_close_notifies_everyone() {
        let (server, addr, mut server_events, _data) = start_server(None, false, false).await;
        let factory = ClientFactory::new();
        let (client, _client_events) = connect_client(&factory, addr, None, false).await;

        match tokio::time::timeout(Duration::from_secs(2), server_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ServerEvent::NewConn(_) => {}
            other => panic!("expected NewConn, got {other:?}"),
        }

        server.close();
        let mut saw_conn_closed = false;
        let mut saw_closed = false;
        while !(saw_conn_closed && saw_closed) {
            match tokio::time::timeout(Duration::from_secs(2), server_events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ServerEvent::ConnClosed(conv, None) => {
                    assert_eq!(conv, client.conv_id());
                    saw_conn_closed = true;
                }
                ServerEvent::Closed(None) => saw_closed = true,
                other => panic!("unexpected event {other:?}"),
            }
        }

        // Closing again is a no-op.
        server.close();
        client.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handshake_on_established_connection() {
        let (server, addr, mut server_events, _data) = start_server(None, false, false).await;

        // Drive the wire by hand: handshake, then a second handshake
        // from the same source address.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut handshake = vec![0u8; HANDSHAKE_PACKET_SIZE];
        put_proto_type(&mut handshake, ProtoType::Handshake);
        handshake[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + 4]
            .copy_from_slice(&77u32.to_le_bytes());

        socket.send_to(&handshake, addr).await.unwrap();
        let mut buf = [0u8; 2048];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, HANDSHAKE_REPLY_SIZE);
        match tokio::time::timeout(Duration::from_secs(2), server_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ServerEvent::NewConn(conv) => assert_eq!(conv, 77),
            other => panic!("expected NewConn, got {other:?}"),
        }

        socket.send_to(&handshake, addr).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(2), server_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ServerEvent::ConnClosed(77, Some(err)) => {
                assert!(err.contains("ExistConnection"), "{err}")
            }
            other => panic!("expected ConnClosed, got {other:?}"),
        }

        server.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_malformed_first_datagram_is_ignored() {
        let (server, addr, mut server_events, _data) = start_server(None, false, false).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Heartbeat instead of handshake on first contact.
        let mut bogus = vec![0u8; crate::protocol::HEARTBEAT_PACKET_SIZE];
        put_proto_type(&mut bogus, ProtoType::Heartbeat);
        socket.send_to(&bogus, addr).await.unwrap();

        // Zero conv id is rejected too.
        let mut zero_conv = vec![0u8; HANDSHAKE_PACKET_SIZE];
        put_proto_type(&mut zero_conv, ProtoType::Handshake);
        socket.send_to(&zero_conv, addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(server_events.try_recv().is_err(), "no connection expected");
        server.close();
    }
}
