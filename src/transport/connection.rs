//! Connection state machine and public request API.
//!
//! A [`Connection`] owns one TCP socket at a time. Each successful dial
//! creates a fresh session: outbound queue, pending registry, sequence
//! counter and the three pipeline tasks. `redial` throws the old session
//! away and builds a new one for the same address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::config::ConnectionConfig;
use super::frame::FrameCodec;
use super::future::PendingRegistry;
use super::message::{Reply, RequestHeader, WireMessage, unix_millis};
use super::pipeline::{DispatchTask, Latch, ReadTask, SendTask};
use crate::core::{Codec, NAME_PUBKEY, Result, RpcError};
use crate::crypto::{FrameSealer, NonceMode, generate_ephemeral, generate_shared_secret};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Dial or key exchange in progress.
    Connecting,
    /// Pipeline running.
    Connected,
    /// Stop requested; waiting for the pipeline to drain.
    Disconnecting,
}

/// Socket addresses of an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Peer address.
    pub remote: SocketAddr,
    /// Local address.
    pub local: SocketAddr,
}

/// Something that arrived from the peer unsolicited.
pub enum Incoming<T> {
    /// Fire-and-forget message.
    Post(T),
    /// Request expecting an answer through `responder`.
    Request {
        /// Decoded request.
        item: T,
        /// Answers this request.
        responder: Responder<T>,
    },
}

impl<T: std::fmt::Debug + Send + 'static> std::fmt::Debug for Incoming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Incoming::Post(item) => f.debug_tuple("Post").field(item).finish(),
            Incoming::Request { item, responder } => f
                .debug_struct("Request")
                .field("seq", &responder.seq())
                .field("item", item)
                .finish(),
        }
    }
}

/// Connection event callbacks.
///
/// Called from the dispatch task, in order: `connected`, any number of
/// `receive`, then `closed`. Callbacks must not block; spawn a task to do
/// slow work (such as answering a request).
pub trait Handler<T>: Send + Sync + 'static {
    /// The session is up.
    fn connected(&self, _info: &ConnectionInfo) {}

    /// The peer sent a post or a request.
    fn receive(&self, _info: &ConnectionInfo, _incoming: Incoming<T>) {}

    /// The session is down and every pending request has failed.
    fn closed(&self, _info: &ConnectionInfo) {}
}

impl<T> Handler<T> for () {}

/// Answers one inbound request.
pub struct Responder<T> {
    header: RequestHeader,
    codec: Arc<dyn Codec<Item = T>>,
    outbound: mpsc::Sender<WireMessage>,
    stop: Arc<Latch>,
}

impl<T: Send + 'static> Responder<T> {
    pub(crate) fn new(
        header: RequestHeader,
        codec: Arc<dyn Codec<Item = T>>,
        outbound: mpsc::Sender<WireMessage>,
        stop: Arc<Latch>,
    ) -> Self {
        Self {
            header,
            codec,
            outbound,
            stop,
        }
    }

    /// Sequence id of the request.
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Whether the caller's deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.header.expired_at(unix_millis())
    }

    /// Send the result. Past the caller's deadline this sends a timeout
    /// answer instead.
    pub async fn reply(self, item: &T) -> Result<()> {
        if self.is_expired() {
            return self.send(Reply::Timeout).await;
        }
        let payload = self.codec.encode(item)?;
        self.send(Reply::Ok(payload)).await
    }

    /// Report a failure to the caller.
    pub async fn fail(self, reason: impl Into<String>) -> Result<()> {
        self.send(Reply::Failed(reason.into())).await
    }

    /// Tell the caller the request timed out.
    pub async fn timeout(self) -> Result<()> {
        self.send(Reply::Timeout).await
    }

    pub(crate) fn fail_now(self, reason: String) {
        let message = WireMessage::Response {
            seq: self.header.seq,
            reply: Reply::Failed(reason),
        };
        if self.outbound.try_send(message).is_err() {
            debug!(seq = self.header.seq, "failure answer dropped");
        }
    }

    async fn send(&self, reply: Reply<crate::core::Payload>) -> Result<()> {
        if self.stop.is_set() {
            return Err(RpcError::ConnectorClosed);
        }
        self.outbound
            .send(WireMessage::Response {
                seq: self.header.seq,
                reply,
            })
            .await
            .map_err(|_| RpcError::ConnectorClosed)
    }
}

struct Session<T> {
    info: ConnectionInfo,
    outbound: mpsc::Sender<WireMessage>,
    registry: Arc<PendingRegistry<T>>,
    sequence: AtomicU32,
    stop: Arc<Latch>,
    closed: Arc<Latch>,
}

/// A duplex RPC connection to one remote address.
pub struct Connection<C: Codec> {
    addr: String,
    config: ConnectionConfig,
    codec: Arc<C>,
    handler: Arc<dyn Handler<C::Item>>,
    state: Arc<Mutex<ConnectionState>>,
    session: Mutex<Option<Arc<Session<C::Item>>>>,
}

impl<C: Codec> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C: Codec> Connection<C> {
    /// Create a disconnected connection. Call [`dial`](Self::dial) to open it.
    pub fn new(
        addr: impl Into<String>,
        codec: Arc<C>,
        handler: Arc<dyn Handler<C::Item>>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            addr: addr.into(),
            config,
            codec,
            handler,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            session: Mutex::new(None),
        }
    }

    /// Create and dial.
    pub async fn connect(
        addr: impl Into<String>,
        codec: Arc<C>,
        handler: Arc<dyn Handler<C::Item>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let connection = Self::new(addr, codec, handler, config);
        connection.dial().await?;
        Ok(connection)
    }

    /// Wrap an accepted socket: run the key exchange and start the pipeline.
    pub async fn from_stream(
        stream: TcpStream,
        codec: Arc<C>,
        handler: Arc<dyn Handler<C::Item>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        let connection = Self::new(addr, codec, handler, config);
        let pending = connection.begin_dial()?;

        let negotiated = tokio::time::timeout(
            connection.config.dial_timeout,
            negotiate(stream, connection.config.encrypt, connection.config.nonce_mode),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RpcError::DialTimeout {
                addr: connection.addr.clone(),
            })
        });
        pending.disarm();
        connection.finish_dial(negotiated)?;
        Ok(connection)
    }

    /// Remote address this connection dials.
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the pipeline is running.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Socket addresses of the current session.
    pub fn info(&self) -> Option<ConnectionInfo> {
        self.session.lock().as_ref().map(|s| s.info)
    }

    /// Requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |s| s.registry.len())
    }

    /// Connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open the socket, exchange keys if configured, and start the pipeline.
    ///
    /// Only valid from [`ConnectionState::Disconnected`].
    ///
    /// Dropping the returned future before it completes leaves the
    /// connection [`ConnectionState::Disconnected`].
    pub async fn dial(&self) -> Result<()> {
        let pending = self.begin_dial()?;
        debug!(addr = %self.addr, "dialing");

        let addr = self.addr.clone();
        let (encrypt, mode) = (self.config.encrypt, self.config.nonce_mode);
        let attempt = async move {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|source| RpcError::Dial {
                    addr: addr.clone(),
                    source,
                })?;
            negotiate(stream, encrypt, mode).await
        };

        let negotiated = tokio::time::timeout(self.config.dial_timeout, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(RpcError::DialTimeout {
                    addr: self.addr.clone(),
                })
            });
        pending.disarm();
        self.finish_dial(negotiated)
    }

    /// Tear down the current session, if any, and dial again.
    pub async fn redial(&self) -> Result<()> {
        self.close().await;
        self.dial().await
    }

    /// Send `item` as a request and wait for the correlated reply.
    pub async fn request_message(&self, item: &C::Item, timeout: Duration) -> Result<C::Item> {
        let session = self.live_session()?;
        let payload = self.codec.encode(item)?;

        let future = session.registry.register(&session.sequence);
        if session.stop.is_set() {
            future.cancel();
            return Err(RpcError::ConnectorClosed);
        }
        let header = RequestHeader::new(future.seq(), timeout);
        future.arm(timeout);

        trace!(addr = %self.addr, seq = header.seq, "request queued");
        // The deadline also covers waiting for room in the outbound queue.
        let sent = tokio::select! {
            sent = session.outbound.send(WireMessage::Request { header, payload }) => sent,
            result = future.clone().wait() => return result,
        };
        if sent.is_err() {
            future.cancel();
            return Err(RpcError::ConnectorClosed);
        }

        future.wait().await
    }

    /// Queue `item` as a fire-and-forget message.
    pub async fn post_message(&self, item: &C::Item) -> Result<()> {
        let session = self.live_session()?;
        let payload = self.codec.encode(item)?;
        session
            .outbound
            .send(WireMessage::Post(payload))
            .await
            .map_err(|_| RpcError::ConnectorClosed)
    }

    /// Stop the pipeline and wait until the handler's `closed` has run.
    pub async fn close(&self) {
        let Some(session) = self.signal_stop() else {
            return;
        };
        session.closed.wait().await;
    }

    /// Stop the pipeline without waiting.
    pub fn stop(&self) {
        self.signal_stop();
    }

    fn signal_stop(&self) -> Option<Arc<Session<C::Item>>> {
        let session = self.session.lock().clone()?;
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnecting;
            }
        }
        if session.stop.trigger() {
            debug!(addr = %self.addr, "stopping connection");
        }
        Some(session)
    }

    fn live_session(&self) -> Result<Arc<Session<C::Item>>> {
        self.session
            .lock()
            .clone()
            .filter(|s| !s.stop.is_set())
            .ok_or(RpcError::ConnectorClosed)
    }

    fn begin_dial(&self) -> Result<PendingDial<'_>> {
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            return Err(RpcError::InvalidState(*state));
        }
        *state = ConnectionState::Connecting;
        Ok(PendingDial {
            state: &*self.state,
            armed: true,
        })
    }

    fn finish_dial(&self, negotiated: Result<Negotiated>) -> Result<()> {
        let negotiated = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                debug!(addr = %self.addr, error = %e, "dial failed");
                return Err(e);
            }
        };

        let session = match self.start(negotiated) {
            Ok(session) => session,
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        *self.session.lock() = Some(Arc::clone(&session));
        // The peer may already have hung up.
        if *state == ConnectionState::Connecting && !session.stop.is_set() {
            *state = ConnectionState::Connected;
        }
        debug!(addr = %self.addr, local = %session.info.local, sealed = self.config.encrypt, "connected");
        Ok(())
    }

    fn start(&self, negotiated: Negotiated) -> Result<Arc<Session<C::Item>>> {
        let Negotiated {
            stream,
            frames,
            mut buffer,
        } = negotiated;
        let info = ConnectionInfo {
            remote: stream.peer_addr()?,
            local: stream.local_addr()?,
        };
        buffer.reserve(self.config.read_buffer_size);

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let frames = Arc::new(frames);
        let registry = PendingRegistry::new();
        let stop = Latch::new();
        let closed = Latch::new();

        let send = tokio::spawn(
            SendTask {
                info,
                writer,
                outbound: outbound_rx,
                frames: Arc::clone(&frames),
                registry: Arc::clone(&registry),
                stop: Arc::clone(&stop),
            }
            .run(),
        );
        let read = tokio::spawn(
            ReadTask {
                info,
                reader,
                buffer,
                frames,
                inbound: inbound_tx,
                outbound: outbound_tx.clone(),
                stop: Arc::clone(&stop),
                keepalive: self.config.keepalive,
                max_missed_pings: self.config.max_missed_pings,
            }
            .run(),
        );
        tokio::spawn(
            DispatchTask {
                info,
                inbound: inbound_rx,
                outbound: outbound_tx.clone(),
                registry: Arc::clone(&registry),
                codec: Arc::clone(&self.codec),
                handler: Arc::clone(&self.handler),
                state: Arc::clone(&self.state),
                stop: Arc::clone(&stop),
                closed: Arc::clone(&closed),
                send,
                read,
            }
            .run(),
        );

        Ok(Arc::new(Session {
            info,
            outbound: outbound_tx,
            registry,
            sequence: AtomicU32::new(0),
            stop,
            closed,
        }))
    }
}

impl<C: Codec> Drop for Connection<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.stop.trigger();
        }
    }
}

/// Puts a `Connecting` connection back to `Disconnected` if its dial is
/// abandoned before completing.
struct PendingDial<'a> {
    state: &'a Mutex<ConnectionState>,
    armed: bool,
}

impl PendingDial<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingDial<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
            debug!("dial abandoned");
        }
    }
}

struct Negotiated {
    stream: TcpStream,
    frames: FrameCodec,
    /// Bytes read past the peer's key message.
    buffer: BytesMut,
}

/// Swap ephemeral public keys and install the shared secret.
///
/// Both sides write their key first, so neither waits on the other.
async fn negotiate(mut stream: TcpStream, encrypt: bool, mode: NonceMode) -> Result<Negotiated> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::new();
    if !encrypt {
        return Ok(Negotiated {
            stream,
            frames: FrameCodec::new(),
            buffer,
        });
    }

    let (private, public) = generate_ephemeral()?;
    let plain = FrameCodec::new();
    stream
        .write_all(&WireMessage::Pubkey(public).to_frame(&plain)?)
        .await?;

    loop {
        if let Some(frame) = plain.decode(&mut buffer)? {
            return match WireMessage::decode(frame)? {
                WireMessage::Pubkey(peer) => {
                    let secret = generate_shared_secret(&private, &peer)?;
                    Ok(Negotiated {
                        stream,
                        frames: FrameCodec::sealed(FrameSealer::new(&secret, mode)),
                        buffer,
                    })
                }
                other => {
                    warn!(name = other.name(), "expected key exchange");
                    Err(RpcError::Handshake(format!(
                        "expected {NAME_PUBKEY}, got {}",
                        other.name()
                    )))
                }
            };
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(RpcError::Handshake(
                "peer closed during key exchange".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NAME_PING, NAME_REQUEST, Payload, RawCodec};
    use crate::transport::{ConnectionConfigBuilder, Listener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    /// Answers every request with its own payload after a delay.
    struct Echo {
        delay: Duration,
    }

    impl Handler<Payload> for Echo {
        fn receive(&self, _info: &ConnectionInfo, incoming: Incoming<Payload>) {
            if let Incoming::Request { item, responder } = incoming {
                let delay = self.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = responder.reply(&item).await;
                });
            }
        }
    }

    /// Answers later requests sooner, so replies come back out of order.
    struct Reverse;

    impl Handler<Payload> for Reverse {
        fn receive(&self, _info: &ConnectionInfo, incoming: Incoming<Payload>) {
            if let Incoming::Request { item, responder } = incoming {
                let delay = Duration::from_millis(200u64.saturating_sub(responder.seq() as u64 * 4));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = responder.reply(&item).await;
                });
            }
        }
    }

    struct Refuse;

    impl Handler<Payload> for Refuse {
        fn receive(&self, _info: &ConnectionInfo, incoming: Incoming<Payload>) {
            if let Incoming::Request { responder, .. } = incoming {
                tokio::spawn(async move {
                    let _ = responder.fail("not today").await;
                });
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        posts: parking_lot::Mutex<Vec<Payload>>,
        connected: AtomicUsize,
        closed: AtomicUsize,
        notify: Notify,
    }

    impl Handler<Payload> for Recorder {
        fn connected(&self, _info: &ConnectionInfo) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn receive(&self, _info: &ConnectionInfo, incoming: Incoming<Payload>) {
            if let Incoming::Post(item) = incoming {
                self.posts.lock().push(item);
                self.notify.notify_one();
            }
        }

        fn closed(&self, _info: &ConnectionInfo) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    async fn serve(
        handler: Arc<dyn Handler<Payload>>,
        config: ConnectionConfig,
    ) -> (String, JoinHandle<()>) {
        let listener = Listener::bind("127.0.0.1:0", Arc::new(RawCodec), handler, config)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok(connection) = listener.accept().await {
                    held.push(connection);
                }
            }
        });
        (addr, task)
    }

    async fn dial(addr: &str, handler: Arc<dyn Handler<Payload>>) -> Connection<RawCodec> {
        Connection::connect(addr, Arc::new(RawCodec), handler, ConnectionConfig::default())
            .await
            .unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn text(body: &'static str) -> Payload {
        Payload::new("Echo", body.as_bytes())
    }

    /// A raw peer that accepts one socket and never reads from it.
    async fn stalled_peer() -> (String, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        (addr, task)
    }

    /// A raw peer that answers every ping with `value + offset`.
    async fn pong_peer(offset: u64) -> (String, JoinHandle<usize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frames = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut answered = 0;
            loop {
                while let Some(frame) = frames.decode(&mut buf).unwrap() {
                    if let WireMessage::Ping(value) = WireMessage::decode(frame).unwrap() {
                        let pong = WireMessage::Pong(value.wrapping_add(offset));
                        if stream.write_all(&pong.to_frame(&frames).unwrap()).await.is_err() {
                            return answered;
                        }
                        answered += 1;
                    }
                }
                match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return answered,
                    Ok(_) => {}
                }
            }
        });
        (addr, task)
    }

    fn bulk() -> Payload {
        Payload::new("Bulk", bytes::Bytes::from(vec![0u8; 60_000]))
    }

    #[tokio::test]
    async fn test_echo_within_deadline() {
        let (addr, server) = serve(Arc::new(Echo { delay: Duration::ZERO }), ConnectionConfig::default()).await;
        let client = dial(&addr, Arc::new(())).await;
        assert_eq!(client.state(), ConnectionState::Connected);

        let start = Instant::now();
        let reply = client
            .request_message(&text("hello"), Duration::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(reply, text("hello"));
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(client.pending_requests(), 0);

        client.close().await;
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_correlate() {
        let (addr, server) = serve(Arc::new(Reverse), ConnectionConfig::default()).await;
        let client = Arc::new(dial(&addr, Arc::new(())).await);

        let tasks: Vec<_> = (0..40u32)
            .map(|i| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let body = format!("request-{i}");
                    let reply = client
                        .request_message(&Payload::new("Echo", body.clone()), Duration::from_secs(5))
                        .await
                        .unwrap();
                    assert_eq!(reply.body, body.as_bytes());
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(client.pending_requests(), 0);

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        let (addr, server) = serve(
            Arc::new(Echo {
                delay: Duration::from_millis(500),
            }),
            ConnectionConfig::default(),
        )
        .await;
        let client = dial(&addr, Arc::new(())).await;

        let start = Instant::now();
        let result = client
            .request_message(&text("slow"), Duration::from_millis(200))
            .await;
        let elapsed = start.elapsed();
        assert!(matches!(result, Err(RpcError::RequestTimeout)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(client.pending_requests(), 0);

        // The late reply arrives and is dropped; the connection stays usable.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(client.is_connected());
        let reply = client
            .request_message(&text("again"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, text("again"));

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let (addr, server) = serve(Arc::new(Refuse), ConnectionConfig::default()).await;
        let client = dial(&addr, Arc::new(())).await;

        let result = client.request_message(&text("x"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RpcError::Remote(reason)) if reason == "not today"));

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_post_after_stop() {
        let (addr, server) = serve(Arc::new(()), ConnectionConfig::default()).await;
        let client = dial(&addr, Arc::new(())).await;

        client.stop();
        assert!(matches!(
            client.post_message(&text("late")).await,
            Err(RpcError::ConnectorClosed)
        ));
        assert!(matches!(
            client.request_message(&text("late"), Duration::from_secs(1)).await,
            Err(RpcError::ConnectorClosed)
        ));

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        server.abort();
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        // The unit handler never answers.
        let (addr, server) = serve(Arc::new(()), ConnectionConfig::default()).await;
        let recorder = Arc::new(Recorder::default());
        let client = Arc::new(dial(&addr, recorder.clone()).await);
        wait_until(|| recorder.connected.load(Ordering::SeqCst) == 1).await;

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client
                        .request_message(&text("never"), Duration::from_secs(10))
                        .await
                })
            })
            .collect();
        wait_until(|| client.pending_requests() == 5).await;

        client.close().await;
        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(RpcError::ClientClosed)));
        }
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);

        server.abort();
    }

    #[tokio::test]
    async fn test_post_reaches_peer_handler() {
        let recorder = Arc::new(Recorder::default());
        let (addr, server) = serve(recorder.clone(), ConnectionConfig::default()).await;
        let client = dial(&addr, Arc::new(())).await;

        client
            .post_message(&Payload::new("Notice", &b"fyi"[..]))
            .await
            .unwrap();
        wait_until(|| !recorder.posts.lock().is_empty()).await;
        assert_eq!(
            recorder.posts.lock()[0],
            Payload::new("Notice", &b"fyi"[..])
        );

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let config = ConnectionConfigBuilder::new().encrypt(true).build().unwrap();
        let (addr, server) = serve(Arc::new(Echo { delay: Duration::ZERO }), config.clone()).await;
        let client = Connection::connect(&*addr, Arc::new(RawCodec), Arc::new(()), config)
            .await
            .unwrap();

        for body in ["one", "two", "three"] {
            let reply = client
                .request_message(&text(body), Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(reply, text(body));
        }

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_encrypted_client_against_plain_peer_times_out() {
        let (addr, server) = serve(Arc::new(()), ConnectionConfig::default()).await;
        let config = ConnectionConfigBuilder::new()
            .encrypt(true)
            .dial_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let client = Connection::new(&*addr, Arc::new(RawCodec), Arc::new(()), config);
        assert!(matches!(
            client.dial().await,
            Err(RpcError::DialTimeout { .. })
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        server.abort();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let addr = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().to_string()
        };

        let client = Connection::new(addr, Arc::new(RawCodec), Arc::new(()), ConnectionConfig::default());
        assert!(matches!(client.dial().await, Err(RpcError::Dial { .. })));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dial_twice_is_invalid() {
        let (addr, server) = serve(Arc::new(()), ConnectionConfig::default()).await;
        let client = dial(&addr, Arc::new(())).await;

        assert!(matches!(
            client.dial().await,
            Err(RpcError::InvalidState(ConnectionState::Connected))
        ));

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_redial_after_close() {
        let (addr, server) = serve(Arc::new(Echo { delay: Duration::ZERO }), ConnectionConfig::default()).await;
        let client = dial(&addr, Arc::new(())).await;

        client.close().await;
        assert!(!client.is_connected());

        client.redial().await.unwrap();
        assert!(client.is_connected());
        let reply = client
            .request_message(&text("back"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, text("back"));

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_peer_hangup_runs_closed() {
        let (addr, server) = serve(Arc::new(()), ConnectionConfig::default()).await;
        let recorder = Arc::new(Recorder::default());
        let client = dial(&addr, recorder.clone()).await;

        server.abort();
        wait_until(|| recorder.closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_keepalive_holds_idle_connection() {
        let config = ConnectionConfigBuilder::new()
            .keepalive(Duration::from_millis(40))
            .build()
            .unwrap();
        let (addr, server) = serve(Arc::new(()), config.clone()).await;
        let client = Connection::connect(&*addr, Arc::new(RawCodec), Arc::new(()), config)
            .await
            .unwrap();

        // Several keepalive periods with no application traffic
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.is_connected());

        client.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_keepalive_tears_down_silent_peer() {
        // A peer that accepts and then never writes anything
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        });

        let config = ConnectionConfigBuilder::new()
            .keepalive(Duration::from_millis(30))
            .build()
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let client = Connection::connect(&*addr, Arc::new(RawCodec), recorder.clone(), config)
            .await
            .unwrap();

        wait_until(|| recorder.closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        server.abort();
    }

    #[tokio::test]
    async fn test_keepalive_sends_three_pings_before_teardown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Records every frame name until the client hangs up
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frames = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut names = Vec::new();
            loop {
                while let Some(frame) = frames.decode(&mut buf).unwrap() {
                    names.push(frame.name);
                }
                match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return names,
                    Ok(_) => {}
                }
            }
        });

        let config = ConnectionConfigBuilder::new()
            .keepalive(Duration::from_millis(50))
            .build()
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let client = Connection::connect(&*addr, Arc::new(RawCodec), recorder.clone(), config)
            .await
            .unwrap();

        wait_until(|| recorder.closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let names = tokio::time::timeout(Duration::from_secs(2), peer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(names.iter().filter(|n| *n == NAME_PING).count(), 3);
    }

    #[tokio::test]
    async fn test_keepalive_rejects_wrong_pong() {
        let (addr, peer) = pong_peer(2).await;
        let config = ConnectionConfigBuilder::new()
            .keepalive(Duration::from_millis(30))
            .build()
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let client = Connection::connect(&*addr, Arc::new(RawCodec), recorder.clone(), config)
            .await
            .unwrap();

        wait_until(|| recorder.closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let answered = tokio::time::timeout(Duration::from_secs(2), peer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answered, 3);
    }

    #[tokio::test]
    async fn test_keepalive_accepts_matching_pong() {
        let (addr, peer) = pong_peer(1).await;
        let config = ConnectionConfigBuilder::new()
            .keepalive(Duration::from_millis(30))
            .build()
            .unwrap();
        let client = Connection::connect(&*addr, Arc::new(RawCodec), Arc::new(()), config)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.is_connected());

        client.close().await;
        let answered = tokio::time::timeout(Duration::from_secs(2), peer)
            .await
            .unwrap()
            .unwrap();
        assert!(answered >= 4);
    }

    #[tokio::test]
    async fn test_full_queue_respects_request_timeout() {
        let (addr, peer) = stalled_peer().await;
        let config = ConnectionConfigBuilder::new()
            .outbound_capacity(1)
            .build()
            .unwrap();
        let client = Connection::connect(&*addr, Arc::new(RawCodec), Arc::new(()), config)
            .await
            .unwrap();

        // Fill the socket buffers and the queue until posting blocks
        let payload = bulk();
        tokio::time::timeout(Duration::from_secs(10), async {
            while tokio::time::timeout(Duration::from_millis(100), client.post_message(&payload))
                .await
                .is_ok()
            {}
        })
        .await
        .unwrap();

        let start = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.request_message(&text("stuck"), Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(RpcError::RequestTimeout)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(client.pending_requests(), 0);

        // The send task is blocked mid-write; close must still finish.
        tokio::time::timeout(Duration::from_secs(3), client.close())
            .await
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        peer.abort();
    }

    #[tokio::test]
    async fn test_resolved_request_is_not_sent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (start_tx, start_rx) = tokio::sync::oneshot::channel::<()>();
        // Reads nothing until told to, then collects names up to the marker
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = start_rx.await;
            let frames = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut names = Vec::new();
            loop {
                while let Some(frame) = frames.decode(&mut buf).unwrap() {
                    if frame.name == "Marker" {
                        return names;
                    }
                    names.push(frame.name);
                }
                if stream.read_buf(&mut buf).await.unwrap() == 0 {
                    return names;
                }
            }
        });

        let client = dial(&addr, Arc::new(())).await;

        // Far more than the socket buffers hold, so the send task stalls
        let payload = bulk();
        for _ in 0..400 {
            client.post_message(&payload).await.unwrap();
        }

        // Queued behind the stalled posts; times out before it is reached.
        let result = client
            .request_message(&text("expired"), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(RpcError::RequestTimeout)));
        client
            .post_message(&Payload::new("Marker", &b""[..]))
            .await
            .unwrap();

        start_tx.send(()).unwrap();
        let names = tokio::time::timeout(Duration::from_secs(20), peer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(names.len(), 400);
        assert!(names.iter().all(|n| n != NAME_REQUEST));

        client.close().await;
    }
}
