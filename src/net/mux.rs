//! Stream multiplexer over a single TCP connection.
//!
//! Every remote peer shares one connection; each logical exchange gets its
//! own stream. Frames interleave on the wire as
//! `u32 stream_id, u8 kind, u32 len, payload`. Client-opened streams use odd
//! ids, server-opened streams even ids, so both sides can open streams on the
//! same session without collisions.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::NetError;

const FRAME_OPEN: u8 = 1;
const FRAME_DATA: u8 = 2;
const FRAME_CLOSE: u8 = 3;

/// Refuse frames larger than this; a peer sending one is broken or hostile.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Per-stream inbound buffer before the reader applies backpressure.
const STREAM_BUFFER: usize = 256;

#[derive(Debug)]
struct Frame {
    stream: u32,
    kind: u8,
    payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub enum Role {
    Client,
    Server,
}

/// One multiplexed session. Cheap to clone via `Arc`; dropped streams clean
/// up after themselves.
pub struct MuxSession {
    outbound: mpsc::Sender<Frame>,
    streams: Arc<DashMap<u32, mpsc::Sender<Bytes>>>,
    next_stream: AtomicU32,
    alive: Arc<AtomicBool>,
}

impl MuxSession {
    /// Starts reader and writer tasks over the socket. Streams opened by the
    /// remote side arrive on `incoming`.
    pub fn start(
        socket: TcpStream,
        role: Role,
        incoming: mpsc::Sender<MuxStream>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let _ = socket.set_nodelay(true);
        let (mut read_half, mut write_half) = socket.into_split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(STREAM_BUFFER);
        let streams: Arc<DashMap<u32, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let session = Arc::new(Self {
            outbound: outbound.clone(),
            streams: Arc::clone(&streams),
            next_stream: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            alive: Arc::clone(&alive),
        });

        // Writer: single owner of the write half keeps frames ordered.
        {
            let alive = Arc::clone(&alive);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        frame = outbound_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                        _ = cancel.cancelled() => break,
                    };
                    let mut buf = BytesMut::with_capacity(9 + frame.payload.len());
                    buf.put_u32(frame.stream);
                    buf.put_u8(frame.kind);
                    buf.put_u32(frame.payload.len() as u32);
                    buf.put_slice(&frame.payload);
                    if let Err(e) = write_half.write_all(&buf).await {
                        tracing::debug!(error = %e, "session write failed");
                        break;
                    }
                }
                alive.store(false, Ordering::SeqCst);
            });
        }

        // Reader: routes frames to per-stream channels.
        {
            let streams = Arc::clone(&streams);
            let alive = Arc::clone(&alive);
            let outbound = outbound.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        frame = read_frame(&mut read_half) => frame,
                        _ = cancel.cancelled() => break,
                    };
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::debug!(error = %e, "session read ended");
                            break;
                        }
                    };
                    match frame.kind {
                        FRAME_OPEN => {
                            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                            streams.insert(frame.stream, tx);
                            let stream = MuxStream {
                                id: frame.stream,
                                inbound: rx,
                                outbound: outbound.clone(),
                                streams: Arc::clone(&streams),
                                closed: false,
                            };
                            if incoming.send(stream).await.is_err() {
                                streams.remove(&frame.stream);
                            }
                        }
                        FRAME_DATA => {
                            let entry = streams.get(&frame.stream).map(|e| e.value().clone());
                            if let Some(tx) = entry {
                                if tx.send(frame.payload).await.is_err() {
                                    streams.remove(&frame.stream);
                                }
                            }
                        }
                        FRAME_CLOSE => {
                            streams.remove(&frame.stream);
                        }
                        other => {
                            tracing::debug!(kind = other, "unknown frame kind, dropping session");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                streams.clear();
            });
        }

        session
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Opens a new locally-initiated stream on this session.
    pub async fn open_stream(&self) -> Result<MuxStream, NetError> {
        if !self.is_alive() {
            return Err(NetError::Transport("session closed".into()));
        }
        let id = self.next_stream.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.insert(id, tx);
        self.outbound
            .send(Frame {
                stream: id,
                kind: FRAME_OPEN,
                payload: Bytes::new(),
            })
            .await
            .map_err(|_| NetError::Transport("session closed".into()))?;
        Ok(MuxStream {
            id,
            inbound: rx,
            outbound: self.outbound.clone(),
            streams: Arc::clone(&self.streams),
            closed: false,
        })
    }
}

async fn read_frame(read_half: &mut tokio::net::tcp::OwnedReadHalf) -> Result<Frame, NetError> {
    let stream = read_half.read_u32().await?;
    let kind = read_half.read_u8().await?;
    let len = read_half.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetError::Protocol(format!("frame of {} bytes", len)));
    }
    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;
    Ok(Frame {
        stream,
        kind,
        payload: Bytes::from(payload),
    })
}

/// One logical stream. Receiving requires `&mut`; sending is shared.
pub struct MuxStream {
    id: u32,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Frame>,
    streams: Arc<DashMap<u32, mpsc::Sender<Bytes>>>,
    closed: bool,
}

impl MuxStream {
    pub async fn send(&self, payload: Bytes) -> Result<(), NetError> {
        self.outbound
            .send(Frame {
                stream: self.id,
                kind: FRAME_DATA,
                payload,
            })
            .await
            .map_err(|_| NetError::Transport("session closed".into()))
    }

    /// Next inbound payload, or `None` once the remote closed the stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Signals end-of-stream to the remote side.
    pub async fn close(mut self) {
        self.closed = true;
        self.streams.remove(&self.id);
        let _ = self
            .outbound
            .send(Frame {
                stream: self.id,
                kind: FRAME_CLOSE,
                payload: Bytes::new(),
            })
            .await;
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.closed {
            self.streams.remove(&self.id);
            // Best effort; the writer may already be gone.
            let _ = self.outbound.try_send(Frame {
                stream: self.id,
                kind: FRAME_CLOSE,
                payload: Bytes::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn session_pair() -> (Arc<MuxSession>, Arc<MuxSession>, mpsc::Receiver<MuxStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, server_rx) = mpsc::channel(8);
        let (client_tx, _client_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client_sock = TcpStream::connect(addr).await.unwrap();
        let server_sock = accept.await.unwrap();

        let client = MuxSession::start(client_sock, Role::Client, client_tx, cancel.clone());
        let server = MuxSession::start(server_sock, Role::Server, server_tx, cancel);
        (client, server, server_rx)
    }

    #[tokio::test]
    async fn test_open_send_receive() {
        let (client, _server, mut incoming) = session_pair().await;

        let stream = client.open_stream().await.unwrap();
        stream.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut remote = incoming.recv().await.unwrap();
        assert_eq!(remote.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (client, _server, mut incoming) = session_pair().await;

        let a = client.open_stream().await.unwrap();
        let b = client.open_stream().await.unwrap();
        b.send(Bytes::from_static(b"from-b")).await.unwrap();
        a.send(Bytes::from_static(b"from-a")).await.unwrap();

        let mut first = incoming.recv().await.unwrap();
        let mut second = incoming.recv().await.unwrap();
        let mut got = vec![
            first.recv().await.unwrap(),
            second.recv().await.unwrap(),
        ];
        got.sort();
        assert_eq!(
            got,
            vec![Bytes::from_static(b"from-a"), Bytes::from_static(b"from-b")]
        );
    }

    #[tokio::test]
    async fn test_close_ends_remote_stream() {
        let (client, _server, mut incoming) = session_pair().await;

        let stream = client.open_stream().await.unwrap();
        stream.send(Bytes::from_static(b"x")).await.unwrap();
        stream.close().await;

        let mut remote = incoming.recv().await.unwrap();
        assert_eq!(remote.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(remote.recv().await, None);
    }

    #[tokio::test]
    async fn test_bidirectional_streams() {
        let (client, server, mut incoming) = session_pair().await;

        let mut up = client.open_stream().await.unwrap();
        up.send(Bytes::from_static(b"ping")).await.unwrap();
        let mut up_remote = incoming.recv().await.unwrap();
        assert_eq!(up_remote.recv().await.unwrap(), Bytes::from_static(b"ping"));

        // Server can answer on the same stream.
        up_remote.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(up.recv().await.unwrap(), Bytes::from_static(b"pong"));
        let _ = server;
    }
}
