//! Connection gateway implementation
//!
//! Owns the listening socket, accepts at most one qualifying WebSocket peer
//! at a time, and pipes JSON-RPC messages between the wire and the callbacks
//! registered by the RPC layer above.

use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{GatewayError, SendError, TransportError};
use super::events::{ConnectionHandle, EventHandlers};
use crate::protocol::JsonRpcMessage;

/// Subprotocol token a client must offer during the upgrade handshake
pub const SUBPROTOCOL: &str = "mcp";

/// Close reason sent to peers that fail subprotocol negotiation
const REJECT_REASON: &str = "Unsupported protocol";

/// Configuration for the connection gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind host; all interfaces when absent
    pub host: Option<String>,
}

impl GatewayConfig {
    /// Create a configuration listening on all interfaces
    pub fn new(port: u16) -> Self {
        Self { port, host: None }
    }

    /// Restrict the listener to a specific host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or("0.0.0.0"), self.port)
    }
}

const READY_OPEN: u8 = 0;
const READY_CLOSING: u8 = 1;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// One accepted peer connection
struct Connection {
    id: Uuid,
    peer: SocketAddr,
    readiness: AtomicU8,
    sink: tokio::sync::Mutex<WsSink>,
}

impl Connection {
    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            peer: self.peer,
        }
    }

    fn is_open(&self) -> bool {
        self.readiness.load(Ordering::Acquire) == READY_OPEN
    }

    fn begin_close(&self) {
        self.readiness.store(READY_CLOSING, Ordering::Release);
    }
}

/// Occupant of the single active-connection slot
struct SlotEntry {
    conn: Arc<Connection>,
    reader: Option<JoinHandle<()>>,
}

/// The single-valued connection slot plus the gateway's terminal flag.
///
/// Both live under one lock so a handshake that finishes while `close()` is
/// running cannot install itself on a gateway that has already torn down.
#[derive(Default)]
struct Slot {
    closed: bool,
    entry: Option<SlotEntry>,
}

/// State shared between the gateway handle and its background tasks
struct Shared {
    slot: Mutex<Slot>,
    events: EventHandlers,
}

impl Shared {
    /// Per-frame fail-open pipeline: a frame that does not decode is dropped
    /// and reported, and the connection stays up.
    fn dispatch_frame(&self, text: &str) {
        match JsonRpcMessage::from_text(text) {
            Ok(message) => self.events.message(message),
            Err(e) => {
                warn!("dropping undecodable frame: {e}");
                self.events.error(TransportError::Decode(e));
            }
        }
    }

    /// Release the slot when a connection's stream ends.
    ///
    /// Only the connection currently occupying the slot may clear it; a
    /// superseded connection winding down must not disturb its replacement.
    /// The slot is cleared before the close callback fires.
    fn release(&self, conn: &Connection) {
        let cleared = match self.slot.lock() {
            Ok(mut slot) => match slot.entry.as_ref() {
                Some(entry) if entry.conn.id == conn.id => {
                    slot.entry = None;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };

        if cleared {
            conn.begin_close();
            info!("connection {} released", conn.id);
            self.events.closed();
        }
    }
}

/// Listener lifecycle: `Idle -> Listening -> Closed`, one way only
enum ListenerState {
    Idle,
    Listening {
        shutdown: broadcast::Sender<()>,
        accept_task: JoinHandle<()>,
    },
    Closed,
}

/// Server-side WebSocket transport with a single active-connection slot.
///
/// Accepts connections that negotiate the `mcp` subprotocol, decodes inbound
/// text frames into [`JsonRpcMessage`]s, and writes outbound messages as
/// JSON text frames. At most one peer is attached at any time; a newly
/// accepted peer supersedes the previous one.
pub struct WebSocketGateway {
    config: GatewayConfig,
    state: tokio::sync::Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    shared: Arc<Shared>,
}

impl WebSocketGateway {
    /// Create a gateway; the listener is not bound until [`start()`](Self::start)
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            state: tokio::sync::Mutex::new(ListenerState::Idle),
            local_addr: Mutex::new(None),
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                events: EventHandlers::default(),
            }),
        }
    }

    /// Register the connect callback, fired with the handle of each newly
    /// accepted connection
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(ConnectionHandle) + Send + Sync + 'static,
    {
        self.shared.events.set_connect(Arc::new(handler));
    }

    /// Register the message callback, fired with each decoded inbound message
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(JsonRpcMessage) + Send + Sync + 'static,
    {
        self.shared.events.set_message(Arc::new(handler));
    }

    /// Register the close callback, fired after the active-connection slot
    /// has been cleared
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.set_close(Arc::new(handler));
    }

    /// Register the error callback for bind, socket, and frame-decode faults
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        self.shared.events.set_error(Arc::new(handler));
    }

    /// Bind the listener and begin accepting connections.
    ///
    /// Resolves once the socket is listening. Fails with
    /// [`GatewayError::AlreadyStarted`] while a listener exists and with
    /// [`GatewayError::Closed`] after [`close()`](Self::close) has run;
    /// restart-in-place is unsupported.
    ///
    /// A bind failure is reported twice: the registered error callback fires
    /// with an equivalent fault, and the caller gets [`GatewayError::Bind`].
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        match *state {
            ListenerState::Listening { .. } => return Err(GatewayError::AlreadyStarted),
            ListenerState::Closed => return Err(GatewayError::Closed),
            ListenerState::Idle => {}
        }

        let addr = self.config.socket_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.bind_failure(addr, e)),
        };

        let bound = match listener.local_addr() {
            Ok(bound) => bound,
            Err(e) => return Err(self.bind_failure(addr, e)),
        };
        if let Ok(mut local) = self.local_addr.lock() {
            *local = Some(bound);
        }
        info!("gateway listening on ws://{bound}");

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let shared = Arc::clone(&self.shared);
        let accept_task = tokio::spawn(accept_loop(shared, listener, shutdown_rx));

        *state = ListenerState::Listening {
            shutdown,
            accept_task,
        };
        Ok(())
    }

    /// Bind failure is dual-notified: the registered error callback fires
    /// with an equivalent fault, and the caller gets the original error
    fn bind_failure(&self, addr: String, e: std::io::Error) -> GatewayError {
        error!("failed to bind {addr}: {e}");
        self.shared
            .events
            .error(TransportError::Bind(std::io::Error::new(
                e.kind(),
                e.to_string(),
            )));
        GatewayError::Bind { addr, source: e }
    }

    /// Tear the gateway down.
    ///
    /// Idempotent: closing a never-started or already-closed gateway is a
    /// no-op. An active connection is force-closed first (slot cleared, close
    /// callback fired), then the listener is unbound; this resolves only
    /// after the accept loop has confirmed shutdown. The gateway ends in its
    /// terminal state either way.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let previous = mem::replace(&mut *state, ListenerState::Closed);

        // Mark the slot terminal so an in-flight handshake cannot install
        // itself once we are gone, then cut off the active peer with no
        // graceful drain.
        let entry = match self.shared.slot.lock() {
            Ok(mut slot) => {
                slot.closed = true;
                slot.entry.take()
            }
            Err(_) => None,
        };
        if let Some(entry) = entry {
            info!("force-closing connection {}", entry.conn.id);
            close_connection(entry).await;
            self.shared.events.closed();
        }

        if let ListenerState::Listening {
            shutdown,
            accept_task,
        } = previous
        {
            let _ = shutdown.send(());
            if let Err(e) = accept_task.await {
                if !e.is_cancelled() {
                    warn!("accept loop ended abnormally: {e}");
                }
            }
            info!("gateway closed");
        }
    }

    /// Write one message to the active connection as a JSON text frame.
    ///
    /// Fails with [`SendError::NoConnection`] when the slot is empty and
    /// [`SendError::NotReady`] when the occupant is already closing. No
    /// queueing: each call performs exactly one gated write.
    pub async fn send(&self, message: &JsonRpcMessage) -> Result<(), SendError> {
        let conn = {
            let slot = self.shared.slot.lock().map_err(|_| SendError::NoConnection)?;
            match slot.entry.as_ref() {
                Some(entry) => Arc::clone(&entry.conn),
                None => return Err(SendError::NoConnection),
            }
        };

        if !conn.is_open() {
            return Err(SendError::NotReady);
        }

        let text = serde_json::to_string(message)?;
        let mut sink = conn.sink.lock().await;
        sink.send(Message::text(text)).await?;
        Ok(())
    }

    /// Handle of the connection currently occupying the slot, if any
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.shared
            .slot
            .lock()
            .ok()
            .and_then(|slot| slot.entry.as_ref().map(|entry| entry.conn.handle()))
    }

    /// Whether an open connection is currently attached
    pub fn is_connected(&self) -> bool {
        self.shared.slot.lock().is_ok_and(|slot| {
            slot.entry.as_ref().is_some_and(|entry| entry.conn.is_open())
        })
    }

    /// Address the listener is actually bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|local| *local)
    }

    /// The configured (port, host) pair
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// Accept incoming sockets until told to shut down
async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(shared, stream, peer).await {
                                debug!("handshake with {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {e}");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("listener shutting down");
                break;
            }
        }
    }
}

/// Upgrade one socket, negotiate the subprotocol, and install the connection
async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), tungstenite::Error> {
    let mut negotiated = false;
    let mut ws = accept_hdr_async(stream, |request: &Request, mut response: Response| {
        if let Some(offered) = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
        {
            if offers_subprotocol(offered, SUBPROTOCOL) {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
                negotiated = true;
            }
        }
        Ok(response)
    })
    .await?;

    if !negotiated {
        // Admission filter: no slot change, no callbacks for this peer.
        info!("rejecting connection from {peer}: unsupported subprotocol");
        ws.close(Some(CloseFrame {
            code: CloseCode::Protocol,
            reason: REJECT_REASON.into(),
        }))
        .await?;
        return Ok(());
    }

    let (sink, source) = ws.split();
    let conn = Arc::new(Connection {
        id: Uuid::new_v4(),
        peer,
        readiness: AtomicU8::new(READY_OPEN),
        sink: tokio::sync::Mutex::new(sink),
    });
    info!("accepted connection {} from {peer}", conn.id);

    // The reader holds off until the go signal below, so no inbound frame is
    // dispatched ahead of the connect callback.
    let (ready_tx, ready_rx) = oneshot::channel();
    let reader = tokio::spawn(read_loop(Arc::clone(&shared), Arc::clone(&conn), source, ready_rx));
    let entry = SlotEntry {
        conn: Arc::clone(&conn),
        reader: Some(reader),
    };

    // Installing the entry, evicting the previous occupant, and checking the
    // terminal flag are one critical section: a concurrent close() either
    // sees this connection in the slot or refuses it, never neither.
    enum Admission {
        Installed(Option<SlotEntry>),
        Refused(SlotEntry),
    }
    let admission = match shared.slot.lock() {
        Ok(mut slot) if !slot.closed => Admission::Installed(slot.entry.replace(entry)),
        _ => Admission::Refused(entry),
    };

    match admission {
        Admission::Refused(entry) => {
            // The gateway reached its terminal state while this handshake
            // was in flight; the late peer is turned away, no callbacks.
            info!("gateway closed during handshake, disconnecting {peer}");
            close_connection(entry).await;
            return Ok(());
        }
        Admission::Installed(Some(previous)) => {
            // Last connection wins. The superseded peer is closed explicitly
            // rather than left dangling; its close callback is suppressed
            // because the connect callback below signals the replacement.
            info!("superseding connection {}", previous.conn.id);
            close_connection(previous).await;
        }
        Admission::Installed(None) => {}
    }

    shared.events.connected(conn.handle());
    let _ = ready_tx.send(());
    Ok(())
}

/// Mark a connection closing, send the close frame, and stop its reader.
///
/// Waits for the read loop to actually finish so no callback can fire on
/// behalf of a connection that is already gone.
async fn close_connection(entry: SlotEntry) {
    entry.conn.begin_close();
    {
        let mut sink = entry.conn.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("close frame to {} not delivered: {e}", entry.conn.peer);
        }
    }
    if let Some(reader) = entry.reader {
        reader.abort();
        let _ = reader.await;
    }
}

/// Test whether a comma-separated offer list contains the required token
fn offers_subprotocol(header: &str, token: &str) -> bool {
    header.split(',').any(|offer| offer.trim() == token)
}

/// Read frames from one connection until the stream ends, dispatching each
/// through the inbound pipeline
async fn read_loop(
    shared: Arc<Shared>,
    conn: Arc<Connection>,
    mut source: WsSource,
    ready: oneshot::Receiver<()>,
) {
    // A dropped sender means the connection was never installed
    if ready.await.is_err() {
        return;
    }

    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Text(text)) => shared.dispatch_frame(&text),
            Ok(Message::Binary(data)) => {
                // Binary frames are coerced to their text representation
                let text = String::from_utf8_lossy(&data);
                shared.dispatch_frame(&text);
            }
            Ok(Message::Ping(payload)) => {
                let mut sink = conn.sink.lock().await;
                if let Err(e) = sink.send(Message::Pong(payload)).await {
                    debug!("pong to {} not delivered: {e}", conn.peer);
                }
            }
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("connection {} closed by peer", conn.id);
                break;
            }
            Err(e) => {
                // Reported without clearing the slot; the stream ending below
                // is what releases it.
                warn!("socket error on connection {}: {e}", conn.id);
                shared.events.error(TransportError::Socket(e));
                break;
            }
        }
    }

    shared.release(&conn);
}
