//! A framed connection with its own receive loop.
//!
//! Each [`Client`] owns a [`Service`] whose routine reads one frame per
//! iteration and queues it. Consumers pull messages with
//! [`Client::receive`] and are woken through the client's listener, which is
//! either the client's own signal or a shared one supplied by the server.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use futures_util::{SinkExt, StreamExt};
use taskwire_core::{CoreError, Routine, Service, StopSignal};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info, warn};

use super::codec::{Frame, MessageCodec};
use super::config::ClientConfig;
use crate::error::ServerError;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique client identifier, assigned in creation order from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, MessageCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MessageCodec>;
type DisconnectCallback = Box<dyn Fn(&Client) + Send + Sync>;

/// One side of a framed connection.
pub struct Client {
    id: ClientId,
    peer: Option<SocketAddr>,
    service: Service,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    inbox: SegQueue<Bytes>,
    data_ready: Arc<Notify>,
    listener: Arc<Notify>,
    on_disconnect: Option<DisconnectCallback>,
    /// Remembered address of an outbound connection, used to recover the
    /// input stream once after it ends.
    reconnect: Option<(String, u16)>,
    /// Set by the first recovery attempt; later ends of stream stop the client.
    recovery_used: AtomicBool,
    config: ClientConfig,
}

impl Client {
    /// Opens an outbound TCP connection. The returned client is not started.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the connection cannot be opened and
    /// [`ServerError::Core`] if `config.loop_rate` is invalid.
    pub async fn connect(
        host: &str,
        port: u16,
        config: ClientConfig,
    ) -> Result<Arc<Self>, ServerError> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer = stream.peer_addr().ok();
        let mut client = Self::from_stream(stream, config)?.with_reconnect(host, port);
        client.peer = peer;
        Ok(Arc::new(client))
    }

    /// Wraps an established stream.
    ///
    /// The stream is split into independently locked read and write halves,
    /// each framed by [`MessageCodec`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LoopRateTooLow`] if `config.loop_rate` is below
    /// the minimum.
    pub fn from_stream<S>(stream: S, config: ClientConfig) -> Result<Self, CoreError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = ClientId::next();
        let service = Service::new(format!("client-{id}"));
        service.set_loop_rate(config.loop_rate)?;
        let (reader, writer) = framed(stream, config.max_frame_length);
        let data_ready = Arc::new(Notify::new());
        Ok(Self {
            id,
            peer: None,
            service,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            inbox: SegQueue::new(),
            listener: Arc::clone(&data_ready),
            data_ready,
            on_disconnect: None,
            reconnect: None,
            recovery_used: AtomicBool::new(false),
            config,
        })
    }

    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Remembers where to reconnect, once, if the input stream ends.
    #[must_use]
    pub fn with_reconnect(mut self, host: impl Into<String>, port: u16) -> Self {
        self.reconnect = Some((host.into(), port));
        self
    }

    /// Notifies `listener` in addition to the client's own signal whenever
    /// a message is queued.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<Notify>) -> Self {
        self.listener = listener;
        self
    }

    /// Registers a callback run once when the client is stopped.
    #[must_use]
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Starts the receive loop. See [`Service::start`].
    pub fn start(self: &Arc<Self>) -> bool {
        self.service.start(Arc::clone(self))
    }

    /// Stops the receive loop and runs the disconnect callback.
    ///
    /// Returns `false`, and skips the callback, if the client was not
    /// running. The connection itself is released when the loop exits.
    pub fn stop(&self) -> bool {
        if !self.service.stop() {
            return false;
        }
        if let Some(callback) = &self.on_disconnect {
            callback(self);
        }
        true
    }

    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        self.service.join(timeout).await
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.service.is_finished()
    }

    /// Returns `true` if at least one received message is waiting.
    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.inbox.is_empty()
    }

    /// Number of received messages waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Takes the oldest received message without waiting.
    pub fn receive(&self) -> Option<Bytes> {
        let message = self.inbox.pop();
        if message.is_none() {
            warn!(client = %self.id, "tried to receive but queue was empty");
        }
        message
    }

    /// Waits up to `timeout` for a received message.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.inbox.pop() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, self.data_ready.notified())
                .await
                .is_err()
            {
                return self.inbox.pop();
            }
        }
    }

    /// Writes one message and flushes it. Failures are logged, not returned.
    pub async fn send(&self, message: Bytes) {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            error!(client = %self.id, "failed to send message: connection already released");
            return;
        };
        if let Err(e) = sink.send(message).await {
            error!(client = %self.id, "failed to send message: {e}");
        }
    }

    fn enqueue(&self, message: Bytes) {
        self.inbox.push(message);
        self.data_ready.notify_one();
        if !Arc::ptr_eq(&self.listener, &self.data_ready) {
            self.listener.notify_one();
        }
    }

    /// Reopens an outbound connection, replacing both halves. Only the first
    /// call in a client's lifetime tries; every later call fails.
    async fn recover(&self, reader: &mut Option<Reader>) -> bool {
        let Some((host, port)) = &self.reconnect else {
            return false;
        };
        if self.recovery_used.swap(true, Ordering::SeqCst) {
            return false;
        }
        let attempt = TcpStream::connect((host.as_str(), *port));
        match tokio::time::timeout(self.config.recovery_timeout, attempt).await {
            Ok(Ok(stream)) => {
                let (new_reader, new_writer) = framed(stream, self.config.max_frame_length);
                *reader = Some(new_reader);
                *self.writer.lock().await = Some(new_writer);
                true
            }
            Ok(Err(e)) => {
                warn!(client = %self.id, "reconnect failed: {e}");
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Routine for Client {
    async fn run(&self, stop: &StopSignal) -> anyhow::Result<()> {
        let mut reader = self.reader.lock().await;
        let Some(frames) = reader.as_mut() else {
            self.stop();
            return Ok(());
        };

        let next = tokio::select! {
            next = frames.next() => next,
            () = stop.stopped() => return Ok(()),
        };

        match next {
            Some(Ok(Frame::Message(message))) => self.enqueue(message),
            Some(Ok(Frame::Oversized { length })) => {
                error!(
                    client = %self.id,
                    length,
                    max = self.config.max_frame_length,
                    "discarded oversized message"
                );
            }
            Some(Err(e)) if is_connection_lost(&e) => {
                info!(client = %self.id, "connection lost: {e}");
                *reader = None;
                self.stop();
            }
            Some(Err(e)) if e.kind() != io::ErrorKind::UnexpectedEof => {
                error!(client = %self.id, "failed to read message: {e}");
            }
            // End of stream, on or between frame boundaries.
            Some(Err(_)) | None => {
                *reader = None;
                if !stop.is_stopped() && self.recover(&mut *reader).await {
                    info!(client = %self.id, "input stream recovered");
                } else {
                    warn!(client = %self.id, "could not recover input stream");
                    self.stop();
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&self) {
        self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        if let Some(mut sink) = writer {
            if let Err(e) = sink.close().await {
                error!(client = %self.id, "failed to release connection: {e}");
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.service.state().as_str())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

fn framed<S>(stream: S, max_frame_length: usize) -> (Reader, Writer)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let read: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
    let write: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
    (
        FramedRead::new(read, MessageCodec::new(max_frame_length)),
        FramedWrite::new(write, MessageCodec::new(max_frame_length)),
    )
}

fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
