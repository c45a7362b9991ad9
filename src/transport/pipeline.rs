//! The per-connection task pipeline.
//!
//! ```text
//! callers ──► outbound mpsc ──► send task ──► socket
//!                                              │
//! callers ◄── futures ◄── dispatch ◄── inbound mpsc ◄── read task
//! ```
//!
//! The read task exits on error, EOF, keepalive failure or stop, dropping
//! the inbound sender. Dispatch sees the closed channel, joins the other two
//! tasks, and fails whatever is still pending.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::connection::{ConnectionInfo, ConnectionState, Handler, Incoming, Responder};
use super::frame::FrameCodec;
use super::future::PendingRegistry;
use super::message::{Reply, WireMessage, unix_millis};
use crate::core::{Codec, FrameError, LATE_SEND_THRESHOLD_PERCENT, RpcError};

/// One-way flag that async tasks can wait on.
pub(crate) struct Latch {
    set: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Latch {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        Arc::new(Self {
            set: AtomicBool::new(false),
            tx,
        })
    }

    /// Set the latch. Returns `true` for the first caller only.
    pub(crate) fn trigger(&self) -> bool {
        let first = !self.set.swap(true, Ordering::SeqCst);
        self.tx.send_replace(true);
        first
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this only returns once set.
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Whether a queued request has too little of its deadline left to be worth
/// writing.
pub(crate) fn is_late(enqueued_ms: u64, timeout_ms: u32, now_ms: u64) -> bool {
    let deadline = enqueued_ms.saturating_add(timeout_ms as u64);
    let remaining = deadline.saturating_sub(now_ms);
    remaining * 100 < timeout_ms as u64 * LATE_SEND_THRESHOLD_PERCENT as u64
}

pub(crate) struct SendTask<T> {
    pub(crate) info: ConnectionInfo,
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) outbound: mpsc::Receiver<WireMessage>,
    pub(crate) frames: Arc<FrameCodec>,
    pub(crate) registry: Arc<PendingRegistry<T>>,
    pub(crate) stop: Arc<Latch>,
}

impl<T: Send + 'static> SendTask<T> {
    pub(crate) async fn run(mut self) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                message = self.outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if let WireMessage::Request { header, .. } = &message {
                if !self.registry.contains(header.seq) {
                    trace!(remote = %self.info.remote, seq = header.seq, "request already resolved, not sending");
                    continue;
                }
                if is_late(header.enqueued_ms, header.timeout_ms, unix_millis()) {
                    debug!(remote = %self.info.remote, seq = header.seq, "request too close to its deadline, not sending");
                    continue;
                }
            }

            let bytes = match message.to_frame(&self.frames) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(remote = %self.info.remote, error = %e, "encode failed, closing connection");
                    break;
                }
            };
            // A peer that stops reading must not pin this task.
            let written = tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                written = self.writer.write_all(&bytes) => written,
            };
            if let Err(e) = written {
                debug!(remote = %self.info.remote, error = %e, "write failed, closing connection");
                break;
            }
        }

        self.stop.trigger();
        let _ = self.writer.shutdown().await;
        trace!(remote = %self.info.remote, "send task exited");
    }
}

pub(crate) struct ReadTask {
    pub(crate) info: ConnectionInfo,
    pub(crate) reader: OwnedReadHalf,
    pub(crate) buffer: BytesMut,
    pub(crate) frames: Arc<FrameCodec>,
    pub(crate) inbound: mpsc::Sender<WireMessage>,
    pub(crate) outbound: mpsc::Sender<WireMessage>,
    pub(crate) stop: Arc<Latch>,
    pub(crate) keepalive: Option<Duration>,
    pub(crate) max_missed_pings: u32,
}

enum ReadOutcome {
    Data,
    Eof,
    Idle,
}

impl ReadTask {
    pub(crate) async fn run(mut self) {
        let stop = Arc::clone(&self.stop);
        let mut missed = 0u32;
        let mut last_ping: Option<u64> = None;
        let mut fresh = false;

        loop {
            match self.drain_frames(&mut last_ping).await {
                Ok(Some(live)) => {
                    // A stray pong alone does not prove the peer is alive.
                    if fresh && (live || !self.buffer.is_empty()) {
                        missed = 0;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(remote = %self.info.remote, error = %e, "bad frame, closing connection");
                    break;
                }
            }
            fresh = false;

            let outcome = tokio::select! {
                biased;
                _ = stop.wait() => break,
                outcome = self.read() => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Data) => fresh = true,
                Ok(ReadOutcome::Eof) => {
                    debug!(remote = %self.info.remote, "peer closed connection");
                    break;
                }
                Ok(ReadOutcome::Idle) => {
                    if missed >= self.max_missed_pings {
                        warn!(remote = %self.info.remote, missed, "keepalive failed, closing connection");
                        break;
                    }
                    missed += 1;
                    let value = rand::random::<u64>();
                    last_ping = Some(value);
                    trace!(remote = %self.info.remote, value, missed, "idle, sending ping");
                    if self.outbound.try_send(WireMessage::Ping(value)).is_err() {
                        debug!(remote = %self.info.remote, "outbound queue full, ping skipped");
                    }
                }
                Err(e) => {
                    debug!(remote = %self.info.remote, error = %e, "read failed, closing connection");
                    break;
                }
            }
        }

        stop.trigger();
        trace!(remote = %self.info.remote, "read task exited");
    }

    async fn read(&mut self) -> std::io::Result<ReadOutcome> {
        let read = self.reader.read_buf(&mut self.buffer);
        let n = match self.keepalive {
            Some(keepalive) => match tokio::time::timeout(keepalive, read).await {
                Ok(result) => result?,
                Err(_) => return Ok(ReadOutcome::Idle),
            },
            None => read.await?,
        };
        Ok(if n == 0 {
            ReadOutcome::Eof
        } else {
            ReadOutcome::Data
        })
    }

    /// Decode every complete frame in the buffer.
    ///
    /// Returns `Ok(None)` once dispatch has gone away, otherwise whether any
    /// frame other than an unmatched pong arrived.
    async fn drain_frames(&mut self, last_ping: &mut Option<u64>) -> Result<Option<bool>, FrameError> {
        let mut live = false;
        while let Some(frame) = self.frames.decode(&mut self.buffer)? {
            match WireMessage::decode(frame)? {
                WireMessage::Ping(value) => {
                    live = true;
                    let pong = WireMessage::Pong(value.wrapping_add(1));
                    if self.outbound.try_send(pong).is_err() {
                        debug!(remote = %self.info.remote, "outbound queue full, pong skipped");
                    }
                }
                WireMessage::Pong(value) => {
                    if last_ping.is_some_and(|sent| sent.wrapping_add(1) == value) {
                        trace!(remote = %self.info.remote, "pong verified");
                        *last_ping = None;
                        live = true;
                    } else {
                        debug!(remote = %self.info.remote, value, "unmatched pong ignored");
                    }
                }
                message => {
                    live = true;
                    if self.inbound.send(message).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(live))
    }
}

pub(crate) struct DispatchTask<C: Codec> {
    pub(crate) info: ConnectionInfo,
    pub(crate) inbound: mpsc::Receiver<WireMessage>,
    pub(crate) outbound: mpsc::Sender<WireMessage>,
    pub(crate) registry: Arc<PendingRegistry<C::Item>>,
    pub(crate) codec: Arc<C>,
    pub(crate) handler: Arc<dyn Handler<C::Item>>,
    pub(crate) state: Arc<Mutex<ConnectionState>>,
    pub(crate) stop: Arc<Latch>,
    pub(crate) closed: Arc<Latch>,
    pub(crate) send: JoinHandle<()>,
    pub(crate) read: JoinHandle<()>,
}

impl<C: Codec> DispatchTask<C> {
    pub(crate) async fn run(mut self) {
        self.handler.connected(&self.info);

        while let Some(message) = self.inbound.recv().await {
            self.dispatch(message);
        }

        // Inbound closed: the read task is gone.
        self.stop.trigger();
        let _ = self.send.await;
        let _ = self.read.await;

        *self.state.lock() = ConnectionState::Disconnected;
        let failed = self.registry.fail_all(|| RpcError::ClientClosed);
        debug!(remote = %self.info.remote, failed, "connection closed");

        self.handler.closed(&self.info);
        self.closed.trigger();
    }

    fn dispatch(&self, message: WireMessage) {
        match message {
            WireMessage::Response { seq, reply } => {
                let Some(future) = self.registry.take(seq) else {
                    debug!(remote = %self.info.remote, seq, "late response dropped");
                    return;
                };
                let result = match reply {
                    Reply::Ok(payload) => self.codec.decode(payload).map_err(RpcError::from),
                    Reply::Timeout => Err(RpcError::RequestTimeout),
                    Reply::Failed(reason) => Err(RpcError::Remote(reason)),
                };
                future.resolve(result);
            }
            WireMessage::Request { header, payload } => {
                let responder = Responder::new(
                    header,
                    Arc::clone(&self.codec) as Arc<dyn Codec<Item = C::Item>>,
                    self.outbound.clone(),
                    Arc::clone(&self.stop),
                );
                match self.codec.decode(payload) {
                    Ok(item) => self
                        .handler
                        .receive(&self.info, Incoming::Request { item, responder }),
                    Err(e) => {
                        warn!(remote = %self.info.remote, seq = header.seq, error = %e, "undecodable request");
                        responder.fail_now(e.to_string());
                    }
                }
            }
            WireMessage::Post(payload) => match self.codec.decode(payload) {
                Ok(item) => self.handler.receive(&self.info, Incoming::Post(item)),
                Err(e) => warn!(remote = %self.info.remote, error = %e, "undecodable post dropped"),
            },
            WireMessage::Pubkey(_) => {
                warn!(remote = %self.info.remote, "unexpected key exchange after handshake");
            }
            WireMessage::Ping(_) | WireMessage::Pong(_) => {}
        }
    }
}
