//! Connection lifecycle: pumps, keepalive and the closing handshake.
//!
//! A [`Connection`] owns the two frame queues and a state machine with four
//! states, in strictly increasing order:
//!
//! ```text
//! Connecting -> Connected -> Closing -> Closed
//! ```
//!
//! The state only ever moves forward. Every transition attempt goes through
//! [`Connection::advance`], which holds the state lock and reports whether it
//! won; the winner emits the matching event, so each lifecycle event fires at
//! most once no matter how many tasks race toward the same state.
//!
//! [`Connection::spawn`] starts one lifecycle task which owns the stream.
//! After the handshake it splits frame I/O into an outbound pump (queue to
//! wire), an inbound pump (wire to queue, answering pings and spotting the
//! peer's Close) and a keepalive ticker. All of them hang off a root
//! [`CancellationToken`] through child tokens; cancelling the root is the
//! single shutdown signal, whether it comes from [`Connection::close`], the
//! peer's Close frame or a transport error. The lifecycle task then runs the
//! closing handshake and settles the connection in `Closed`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::close::CloseCode;
use crate::events::Events;
use crate::frame::{Frame, OpCode};
use crate::handshake::Handshake;
use crate::queue::AsyncQueue;
use crate::socket::{FrameSink, FrameSocket, FrameStream, Role};
use crate::Result;

/// Default interval between keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Default wait for the peer's Close confirmation before dropping the stream.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a connection. States are ordered and only ever advance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// The opening handshake has not completed yet.
    Connecting,
    /// Frames flow in both directions.
    Connected,
    /// The closing handshake is underway; no new data is accepted.
    Closing,
    /// The transport is released. Terminal.
    Closed,
}

/// Tunables threaded from the facade into the lifecycle task.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub buffer_limit: usize,
    pub ping_interval: Duration,
    pub close_timeout: Duration,
    pub max_payload_read: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_limit: crate::queue::DEFAULT_BUFFER_LIMIT,
            ping_interval: DEFAULT_PING_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_payload_read: crate::codec::MAX_PAYLOAD_READ,
        }
    }
}

/// One live WebSocket connection, shared between the facade and the
/// lifecycle tasks.
pub(crate) struct Connection {
    state: Mutex<ConnectionState>,
    root: CancellationToken,
    incoming: AsyncQueue<Frame>,
    outgoing: AsyncQueue<Frame>,
    events: Arc<Events>,
    /// Set when the peer's Close frame started the shutdown, which decides
    /// whether teardown confirms a close or initiates one.
    peer_requested_close: AtomicBool,
    close_timeout: Duration,
}

impl Connection {
    /// Creates the connection and spawns its lifecycle task over the stream
    /// `pending` resolves to.
    ///
    /// Taking a future instead of a ready stream lets transport setup that
    /// is still in flight, like a server-side TLS accept, finish on the
    /// lifecycle task. The task performs the handshake, runs the pumps until
    /// shutdown is signalled and finishes the closing handshake. It holds
    /// the only reference to the stream for the whole lifetime of the
    /// connection.
    pub fn spawn<S, F>(
        pending: F,
        role: Role,
        handshake: Handshake,
        events: Arc<Events>,
        config: ConnectionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = Result<S>> + Send + 'static,
    {
        let connection = Arc::new(Self {
            state: Mutex::new(ConnectionState::Connecting),
            root: CancellationToken::new(),
            incoming: AsyncQueue::new(config.buffer_limit),
            outgoing: AsyncQueue::new(config.buffer_limit),
            events,
            peer_requested_close: AtomicBool::new(false),
            close_timeout: config.close_timeout,
        });

        tokio::spawn(lifecycle(
            Arc::clone(&connection),
            pending,
            role,
            handshake,
            config,
        ));

        connection
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    /// Queues a frame for the outbound pump.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outgoing.enqueue(frame).await
    }

    /// Queues a run of frames as one contiguous block, so fragments of a
    /// message are never interleaved with another sender's frames.
    pub async fn send_all(&self, frames: impl IntoIterator<Item = Frame>) -> Result<()> {
        self.outgoing.enqueue_range(frames).await
    }

    /// Takes the next inbound data frame.
    pub async fn receive(&self) -> Result<Frame> {
        self.incoming.dequeue().await
    }

    /// Starts a local close.
    ///
    /// The `Connected -> Closing` transition happens before this returns, so
    /// callers observe the new state immediately. The closing handshake
    /// itself runs on the lifecycle task. Idempotent.
    pub fn close(&self) {
        if self.advance(ConnectionState::Closing) {
            self.events.emit_closing();
        }
        self.root.cancel();
    }

    /// Moves the state forward to `to`. Returns `false` when the state is
    /// already at or past `to`; the caller that gets `true` owns the
    /// corresponding event.
    fn advance(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock().expect("state lock");
        if *state >= to {
            return false;
        }
        *state = to;
        true
    }
}

async fn lifecycle<S, F>(
    connection: Arc<Connection>,
    pending: F,
    role: Role,
    handshake: Handshake,
    config: ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = Result<S>> + Send + 'static,
{
    let upgraded = async {
        let mut stream = tokio::select! {
            result = pending => result?,
            _ = connection.root.cancelled() => return Err(crate::WebSocketError::Cancelled),
        };
        tokio::select! {
            result = handshake.perform(&mut stream) => result?,
            _ = connection.root.cancelled() => return Err(crate::WebSocketError::Cancelled),
        }
        Ok(stream)
    }
    .await;

    let stream = match upgraded {
        Ok(stream) => stream,
        Err(_error) => {
            #[cfg(feature = "logging")]
            log::debug!("{role} handshake failed: {_error}");

            connection.root.cancel();
            connection.incoming.close();
            connection.outgoing.close();
            if connection.advance(ConnectionState::Closed) {
                connection.events.emit_closed();
            }
            return;
        }
    };

    #[cfg(feature = "logging")]
    log::debug!("{role} handshake complete");

    if connection.advance(ConnectionState::Connected) {
        connection.events.emit_connected();
    }

    let socket = FrameSocket::new(stream, role, config.max_payload_read);
    let (sink, frame_stream) = socket.split();
    // The sink is shared by the outbound pump, the inbound pump (pong
    // replies) and teardown; a pong grabs the lock between queued frames
    // instead of waiting behind the whole queue.
    let sink = Arc::new(AsyncMutex::new(sink));

    let keepalive = spawn_keepalive(&connection, config.ping_interval);
    let outbound = spawn_outbound(&connection, Arc::clone(&sink));
    let inbound = spawn_inbound(&connection, Arc::clone(&sink), frame_stream);

    connection.root.cancelled().await;

    if connection.advance(ConnectionState::Closing) {
        connection.events.emit_closing();
    }

    let _ = outbound.await;
    let _ = keepalive.await;

    // A peer that stops reading must not wedge teardown; the whole closing
    // handshake, including its writes, gets one bounded window.
    if let Ok(mut frame_stream) = inbound.await {
        let _ = tokio::time::timeout(connection.close_timeout, async {
            let mut sink = sink.lock().await;
            close_handshake(&connection, &mut sink, &mut frame_stream).await;
            let _ = sink.close().await;
        })
        .await;
    }

    connection.incoming.close();
    connection.outgoing.close();

    if connection.advance(ConnectionState::Closed) {
        connection.events.emit_closed();
    }

    #[cfg(feature = "logging")]
    log::debug!("{role} connection closed");
}

/// Enqueues a ping every `interval` until shutdown.
fn spawn_keepalive(connection: &Arc<Connection>, interval: Duration) -> JoinHandle<()> {
    let connection = Arc::clone(connection);
    let token = connection.root.child_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the peer just connected and does
        // not need a ping yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    // The queue may be full behind a slow peer; shutdown
                    // outranks the ping.
                    let enqueued = tokio::select! {
                        _ = token.cancelled() => break,
                        result = connection.outgoing.enqueue(Frame::ping()) => result,
                    };
                    if enqueued.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Moves frames from the outbound queue to the wire. After the shutdown
/// signal it drains whatever was queued beforehand, then stops.
fn spawn_outbound<S>(
    connection: &Arc<Connection>,
    sink: Arc<AsyncMutex<FrameSink<S>>>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = Arc::clone(connection);
    let token = connection.root.child_token();
    tokio::spawn(async move {
        loop {
            match connection.outgoing.dequeue_with(&token).await {
                Ok(frame) => {
                    // A write can block for as long as the peer stops
                    // reading; shutdown must still get through.
                    let sent = tokio::select! {
                        _ = token.cancelled() => break,
                        result = async { sink.lock().await.send(frame).await } => result,
                    };
                    if sent.is_err() {
                        connection.root.cancel();
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        // Frames queued before the shutdown signal still drain to the wire,
        // within a bounded window so a stalled peer cannot wedge teardown.
        let _ = tokio::time::timeout(connection.close_timeout, async {
            while let Some(frame) = connection.outgoing.try_dequeue() {
                if sink.lock().await.send(frame).await.is_err() {
                    break;
                }
            }
        })
        .await;
    })
}

/// Moves data frames from the wire to the inbound queue. Pings are answered
/// on the spot, pongs are dropped, and a Close frame or transport error
/// triggers shutdown. Returns the stream half so teardown can finish the
/// closing handshake on it.
fn spawn_inbound<S>(
    connection: &Arc<Connection>,
    sink: Arc<AsyncMutex<FrameSink<S>>>,
    mut stream: FrameStream<S>,
) -> JoinHandle<FrameStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = Arc::clone(connection);
    let token = connection.root.child_token();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                frame = stream.receive() => frame,
            };

            match frame {
                Ok(frame) => match frame.opcode {
                    OpCode::Ping => {
                        let payload = frame.payload;
                        let sent = tokio::select! {
                            _ = token.cancelled() => break,
                            result = async { sink.lock().await.send(Frame::pong(payload)).await } => result,
                        };
                        if sent.is_err() {
                            connection.root.cancel();
                            break;
                        }
                    }
                    OpCode::Pong => {}
                    OpCode::Close => {
                        #[cfg(feature = "logging")]
                        log::debug!("peer requested close");

                        connection.peer_requested_close.store(true, Ordering::SeqCst);
                        connection.root.cancel();
                        break;
                    }
                    _ => {
                        // Backpressure: wait for queue space, but give up on
                        // shutdown rather than wedge teardown.
                        let enqueued = tokio::select! {
                            _ = token.cancelled() => break,
                            result = connection.incoming.enqueue(frame) => result,
                        };
                        if enqueued.is_err() {
                            break;
                        }
                    }
                },
                Err(_error) => {
                    #[cfg(feature = "logging")]
                    log::debug!("inbound pump stopping: {_error}");

                    connection.root.cancel();
                    break;
                }
            }
        }
        stream
    })
}

/// Runs the closing handshake once the pumps are quiescent. The caller
/// bounds the whole exchange with the close timeout.
///
/// When the peer initiated, a single Close confirmation goes out. When we
/// initiated, a Close goes out and the reader waits for the peer's
/// confirmation, discarding any data frames still in flight. Failures here
/// are swallowed: the connection is going away regardless.
async fn close_handshake<S>(
    connection: &Connection,
    sink: &mut FrameSink<S>,
    stream: &mut FrameStream<S>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let close = Frame::close(CloseCode::Normal, "");
    if connection.peer_requested_close.load(Ordering::SeqCst) {
        let _ = sink.send(close).await;
        return;
    }

    if sink.send(close).await.is_err() {
        return;
    }
    loop {
        match stream.receive().await {
            Ok(frame) if frame.opcode == OpCode::Close => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}
