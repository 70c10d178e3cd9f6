//! Peer-to-peer transport: one multiplexed TCP session per remote address,
//! scope-routed request/response exchanges and one-way block streams.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod message;
pub mod mux;

use message::{Message, MessageKind, ProtocolError, Request, Response, StreamHeader};
use mux::{MuxSession, MuxStream, Role};

/// Default ceiling on a request/response exchange.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NetError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("remote error: {0}")]
    Remote(String),
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Transport(e.to_string())
    }
}

impl From<ProtocolError> for NetError {
    fn from(e: ProtocolError) -> Self {
        NetError::Protocol(e.to_string())
    }
}

pub type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handles one request on a scope; the returned bytes become the response
/// payload, an `Err` becomes an `is_error` response.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, from: &str, payload: Bytes) -> BoxFut<Result<Bytes, String>>;
}

/// Handles an inbound block stream on a scope. Blocks arrive until the
/// sender closes the stream.
pub trait StreamHandler: Send + Sync {
    fn handle(&self, from: &str, blocks: mpsc::Receiver<Bytes>) -> BoxFut<()>;
}

pub struct Peer {
    addr: String,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<MuxSession>>>,
    request_handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    stream_handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
    cancel: CancellationToken,
    rpc_timeout: Duration,
}

impl Peer {
    /// Binds the listener and starts accepting sessions. The returned peer's
    /// address reflects the actual bound socket, so `"127.0.0.1:0"` works in
    /// tests.
    pub async fn bind(addr: &str, cancel: CancellationToken) -> Result<Arc<Self>, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let peer = Arc::new(Self {
            addr: local.to_string(),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            stream_handlers: RwLock::new(HashMap::new()),
            cancel: cancel.clone(),
            rpc_timeout: RPC_TIMEOUT,
        });

        let accept_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            tracing::info!(addr = %accept_peer.addr, "listening");
            loop {
                let conn = tokio::select! {
                    conn = listener.accept() => conn,
                    _ = cancel.cancelled() => break,
                };
                match conn {
                    Ok((socket, remote)) => {
                        accept_peer.attach_session(socket, Role::Server, remote.to_string());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            tracing::info!("listener shut down");
        });

        Ok(peer)
    }

    /// Advertised address used for routing identity.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn add_request_handler(&self, scope: &str, handler: Arc<dyn RequestHandler>) {
        self.request_handlers
            .write()
            .insert(scope.to_string(), handler);
    }

    pub fn add_stream_handler(&self, scope: &str, handler: Arc<dyn StreamHandler>) {
        self.stream_handlers
            .write()
            .insert(scope.to_string(), handler);
    }

    /// Sends one request and waits for the single response on the same
    /// stream.
    pub async fn request(
        self: &Arc<Self>,
        addr: &str,
        scope: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetError> {
        let session = self.session_for(addr).await?;
        let mut stream = session.open_stream().await?;

        let message = Request {
            scope: scope.to_string(),
            payload: Bytes::from(payload),
        }
        .into_message();
        stream.send(message.encode()).await?;

        let raw = tokio::time::timeout(self.rpc_timeout, stream.recv())
            .await
            .map_err(|_| NetError::Transport(format!("request to {} timed out", addr)))?
            .ok_or_else(|| NetError::Transport("stream closed before response".into()))?;

        let message = Message::decode(raw)?;
        if message.kind != MessageKind::Response {
            return Err(NetError::Protocol("expected response message".into()));
        }
        let response = Response::from_message(&message)?;
        stream.close().await;

        if response.is_error {
            Err(NetError::Remote(
                String::from_utf8_lossy(&response.payload).into_owned(),
            ))
        } else {
            Ok(response.payload.to_vec())
        }
    }

    /// Opens a block stream on a scope. The remote handler sees the blocks
    /// in order and an end-of-stream when the sender closes.
    pub async fn open_stream(
        self: &Arc<Self>,
        addr: &str,
        scope: &str,
    ) -> Result<BlockSender, NetError> {
        let session = self.session_for(addr).await?;
        let stream = session.open_stream().await?;

        let header = StreamHeader {
            scope: scope.to_string(),
        }
        .into_message();
        stream.send(header.encode()).await?;
        Ok(BlockSender { stream })
    }

    async fn session_for(self: &Arc<Self>, addr: &str) -> Result<Arc<MuxSession>, NetError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(addr) {
            if session.is_alive() {
                return Ok(Arc::clone(session));
            }
            sessions.remove(addr);
        }

        let socket = TcpStream::connect(addr).await?;
        let session = self.attach_session(socket, Role::Client, addr.to_string());
        sessions.insert(addr.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Wires a socket into a session and spawns the inbound-stream dispatch
    /// loop for it.
    fn attach_session(
        self: &Arc<Self>,
        socket: TcpStream,
        role: Role,
        remote: String,
    ) -> Arc<MuxSession> {
        let (incoming_tx, mut incoming_rx) = mpsc::channel::<MuxStream>(64);
        let session = MuxSession::start(socket, role, incoming_tx, self.cancel.child_token());

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(stream) = incoming_rx.recv().await {
                let peer = Arc::clone(&peer);
                let remote = remote.clone();
                // Dispatch concurrently per stream.
                tokio::spawn(async move {
                    peer.handle_stream(stream, remote).await;
                });
            }
        });

        session
    }

    async fn handle_stream(self: Arc<Self>, mut stream: MuxStream, from: String) {
        let Some(raw) = stream.recv().await else {
            return;
        };
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%from, error = %e, "malformed message");
                let _ = stream.send(Response::error(&e.to_string()).into_message().encode()).await;
                stream.close().await;
                return;
            }
        };

        match message.kind {
            MessageKind::Request => self.serve_request(stream, &message, &from).await,
            MessageKind::Stream => self.serve_stream(stream, &message, &from).await,
            MessageKind::Response => {
                tracing::warn!(%from, "unexpected response message on fresh stream");
            }
        }
    }

    async fn serve_request(&self, stream: MuxStream, message: &Message, from: &str) {
        let response = match Request::from_message(message) {
            Ok(request) => {
                let handler = self.request_handlers.read().get(&request.scope).cloned();
                match handler {
                    Some(handler) => match handler.handle(from, request.payload).await {
                        Ok(payload) => Response::ok(payload),
                        Err(reason) => Response::error(&reason),
                    },
                    None => Response::error(&format!("no handler for scope {}", request.scope)),
                }
            }
            Err(e) => Response::error(&e.to_string()),
        };
        let _ = stream.send(response.into_message().encode()).await;
        stream.close().await;
    }

    async fn serve_stream(&self, mut stream: MuxStream, message: &Message, from: &str) {
        let header = match StreamHeader::from_message(message) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(%from, error = %e, "malformed stream header");
                return;
            }
        };
        let Some(handler) = self.stream_handlers.read().get(&header.scope).cloned() else {
            tracing::warn!(%from, scope = %header.scope, "no stream handler");
            return;
        };

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let scope = header.scope.clone();
        tokio::spawn(async move {
            while let Some(raw) = stream.recv().await {
                match message::decode_block(raw) {
                    Ok(block) => {
                        if tx.send(block).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%scope, error = %e, "malformed stream block");
                        break;
                    }
                }
            }
        });
        handler.handle(from, rx).await;
    }
}

/// Sender half of an outbound block stream.
pub struct BlockSender {
    stream: MuxStream,
}

impl BlockSender {
    pub async fn send_block(&self, payload: &[u8]) -> Result<(), NetError> {
        self.stream.send(message::encode_block(payload)).await
    }

    pub async fn close(self) {
        self.stream.close().await;
    }
}
