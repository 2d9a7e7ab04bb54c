//! Stream multiplexing over a message-based tunnel transport.
//!
//! One WebSocket connection carries many logical byte-streams. Each frame
//! rides in a single binary message with a 7-byte header:
//! `type(1) + stream_id(4) + data_len(2)` followed by the payload.
//!
//! A [`MuxSession`] owns the transport through a background driver task. The
//! agent side runs the *client* role and opens streams; the gateway side runs
//! the *server* role and accepts them. The driver pings the peer every
//! [`MuxConfig::keep_alive_interval`] and declares the session dead after
//! [`MuxConfig::keep_alive_timeout`] of silence; death fails every open
//! stream with a broken-session error.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::PollSender;

use crate::error::{Error, Result};
use crate::{KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT, WS_CLOSE_TIMEOUT};

/// Stream identifier type. Client-opened streams use odd ids.
pub type StreamId = u32;

/// Maximum payload size per frame (bounded by the u16 length field).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Multiplexing frame types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Client opens a new stream. No payload.
    Open = 0x01,
    /// Graceful end-of-stream from the sending side.
    Fin = 0x02,
    /// Abrupt reset of a stream.
    Rst = 0x03,
    /// Data payload for an existing stream.
    Data = 0x04,
    /// Keep-alive probe.
    Ping = 0x05,
    /// Keep-alive answer.
    Pong = 0x06,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Fin),
            0x03 => Ok(Self::Rst),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Ping),
            0x06 => Ok(Self::Pong),
            _ => Err(Error::protocol(format!("unknown frame type: {v:#04x}"))),
        }
    }
}

/// A multiplexing frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from one transport message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::protocol(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let frame_type = FrameType::from_u8(data[0])?;
        let stream_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let data_len = u16::from_be_bytes([data[5], data[6]]) as usize;

        if data.len() != FRAME_HEADER_SIZE + data_len {
            return Err(Error::protocol(format!(
                "frame length mismatch: header says {} payload bytes, got {}",
                data_len,
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        Ok(Self {
            frame_type,
            stream_id,
            payload: data[FRAME_HEADER_SIZE..].to_vec(),
        })
    }

    fn open(stream_id: StreamId) -> Self {
        Self { frame_type: FrameType::Open, stream_id, payload: Vec::new() }
    }

    fn fin(stream_id: StreamId) -> Self {
        Self { frame_type: FrameType::Fin, stream_id, payload: Vec::new() }
    }

    fn rst(stream_id: StreamId) -> Self {
        Self { frame_type: FrameType::Rst, stream_id, payload: Vec::new() }
    }

    fn data(stream_id: StreamId, data: &[u8]) -> Self {
        Self { frame_type: FrameType::Data, stream_id, payload: data.to_vec() }
    }

    fn ping() -> Self {
        Self { frame_type: FrameType::Ping, stream_id: 0, payload: Vec::new() }
    }

    fn pong() -> Self {
        Self { frame_type: FrameType::Pong, stream_id: 0, payload: Vec::new() }
    }
}

/// Keep-alive parameters. Both ends of a tunnel must use identical values.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Events delivered from the driver to one stream's read side.
enum StreamEvent {
    Data(Vec<u8>),
    Fin,
    Rst,
}

enum Control {
    Shutdown(Option<String>),
}

struct Shared {
    role: Role,
    label: String,
    closed: AtomicBool,
    next_id: AtomicU32,
    frame_tx: mpsc::Sender<Frame>,
    streams: parking_lot::Mutex<HashMap<StreamId, mpsc::UnboundedSender<StreamEvent>>>,
}

/// One side of a multiplexed tunnel session.
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl MuxSession {
    /// Start the client role over `transport`. The client side opens streams.
    pub fn client<T>(transport: T, config: MuxConfig, label: impl Into<String>) -> Self
    where
        T: Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>>,
        T: Send + Unpin + 'static,
    {
        Self::start(transport, Role::Client, config, label.into())
    }

    /// Start the server role over `transport`. The server side accepts
    /// streams opened by the peer.
    pub fn server<T>(transport: T, config: MuxConfig, label: impl Into<String>) -> Self
    where
        T: Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>>,
        T: Send + Unpin + 'static,
    {
        Self::start(transport, Role::Server, config, label.into())
    }

    fn start<T>(transport: T, role: Role, config: MuxConfig, label: String) -> Self
    where
        T: Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>>,
        T: Send + Unpin + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            role,
            label,
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            frame_tx,
            streams: parking_lot::Mutex::new(HashMap::new()),
        });

        tokio::spawn(drive(
            transport,
            config,
            Arc::clone(&shared),
            accept_tx,
            frame_rx,
            control_rx,
        ));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            control_tx,
        }
    }

    /// Open a new logical stream (client role).
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::BrokenSession);
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.shared.streams.lock().insert(id, event_tx);

        if self.shared.frame_tx.send(Frame::open(id)).await.is_err() {
            self.shared.streams.lock().remove(&id);
            return Err(Error::BrokenSession);
        }

        Ok(MuxStream::new(id, Arc::clone(&self.shared), event_rx))
    }

    /// Wait for the next stream opened by the peer (server role).
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::BrokenSession)
    }

    /// Liveness flag: true once the driver has stopped, for any reason.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Remote-address label this session was created with.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Shut the session down. A `None` reason sends a normal closure frame;
    /// `Some(err)` sends policy-violation (1008) with `error: <err>`.
    pub fn close(&self, reason: Option<String>) {
        let _ = self.control_tx.send(Control::Shutdown(reason));
    }
}

/// One logical full-duplex byte pipe inside a [`MuxSession`].
///
/// Reads end with EOF after the peer's FIN, fail with `ConnectionReset` after
/// a RST, and fail with `ConnectionAborted` when the enclosing session dies.
/// Shutdown (or drop) sends FIN to the peer.
pub struct MuxStream {
    id: StreamId,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_closed: bool,
    out: PollSender<Frame>,
    wrote_fin: bool,
}

impl MuxStream {
    fn new(id: StreamId, shared: Arc<Shared>, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        let out = PollSender::new(shared.frame_tx.clone());
        Self {
            id,
            shared,
            events,
            read_buf: Vec::new(),
            read_pos: 0,
            read_closed: false,
            out,
            wrote_fin: false,
        }
    }

    /// Session-unique stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Remote-address label inherited from the session.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    fn broken() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "broken mux session")
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if me.read_pos < me.read_buf.len() {
                let n = buf.remaining().min(me.read_buf.len() - me.read_pos);
                buf.put_slice(&me.read_buf[me.read_pos..me.read_pos + n]);
                me.read_pos += n;
                if me.read_pos == me.read_buf.len() {
                    me.read_buf.clear();
                    me.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if me.read_closed {
                return Poll::Ready(Ok(()));
            }

            match me.events.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Data(data))) => {
                    me.read_buf = data;
                    me.read_pos = 0;
                }
                Poll::Ready(Some(StreamEvent::Fin)) => {
                    me.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(StreamEvent::Rst)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset by peer",
                    )));
                }
                Poll::Ready(None) => {
                    if me.shared.closed.load(Ordering::SeqCst) {
                        return Poll::Ready(Err(Self::broken()));
                    }
                    me.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if me.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(Self::broken()));
        }
        match me.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = data.len().min(MAX_FRAME_PAYLOAD);
                me.out
                    .send_item(Frame::data(me.id, &data[..n]))
                    .map_err(|_| Self::broken())?;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::broken())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the driver on write; nothing is buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.wrote_fin || me.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        match me.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                me.wrote_fin = true;
                let _ = me.out.send_item(Frame::fin(me.id));
                Poll::Ready(Ok(()))
            }
            // Session already torn down; there is no peer left to notify.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.streams.lock().remove(&self.id);
        if !self.wrote_fin && !self.shared.closed.load(Ordering::SeqCst) {
            let _ = self.shared.frame_tx.try_send(Frame::fin(self.id));
        }
    }
}

/// Outcome of one inbound frame: an optional immediate reply.
fn handle_frame(
    frame: Frame,
    shared: &Arc<Shared>,
    accept_tx: &mpsc::Sender<MuxStream>,
) -> Option<Frame> {
    match frame.frame_type {
        FrameType::Open => {
            if shared.role != Role::Server {
                tracing::warn!(stream = frame.stream_id, "peer opened a stream on the client side");
                return Some(Frame::rst(frame.stream_id));
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            shared.streams.lock().insert(frame.stream_id, event_tx);
            let stream = MuxStream::new(frame.stream_id, Arc::clone(shared), event_rx);
            if accept_tx.try_send(stream).is_err() {
                shared.streams.lock().remove(&frame.stream_id);
                return Some(Frame::rst(frame.stream_id));
            }
            None
        }
        FrameType::Data => {
            let mut streams = shared.streams.lock();
            if let Some(tx) = streams.get(&frame.stream_id) {
                if tx.send(StreamEvent::Data(frame.payload)).is_err() {
                    streams.remove(&frame.stream_id);
                }
            }
            None
        }
        FrameType::Fin => {
            if let Some(tx) = shared.streams.lock().remove(&frame.stream_id) {
                let _ = tx.send(StreamEvent::Fin);
            }
            None
        }
        FrameType::Rst => {
            if let Some(tx) = shared.streams.lock().remove(&frame.stream_id) {
                let _ = tx.send(StreamEvent::Rst);
            }
            None
        }
        FrameType::Ping => Some(Frame::pong()),
        FrameType::Pong => None,
    }
}

async fn drive<T>(
    transport: T,
    config: MuxConfig,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
    mut frame_rx: mpsc::Receiver<Frame>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) where
    T: Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>>,
    T: Send + Unpin + 'static,
{
    let (mut sink, mut stream) = transport.split();

    let mut keepalive = time::interval(config.keep_alive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let mut close_reason: Option<String> = None;
    let mut broken = false;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    last_seen = Instant::now();
                    match Frame::decode(&data) {
                        Ok(frame) => {
                            if let Some(reply) = handle_frame(frame, &shared, &accept_tx) {
                                if sink.send(Message::Binary(reply.encode())).await.is_err() {
                                    broken = true;
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(session = %shared.label, "bad mux frame: {e}");
                            broken = true;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(session = %shared.label, ?frame, "peer closed the tunnel");
                    break;
                }
                Some(Ok(_)) => {
                    last_seen = Instant::now();
                }
                Some(Err(e)) => {
                    tracing::debug!(session = %shared.label, "tunnel transport error: {e}");
                    broken = true;
                    break;
                }
                None => {
                    broken = true;
                    break;
                }
            },
            Some(frame) = frame_rx.recv() => {
                if sink.send(Message::Binary(frame.encode())).await.is_err() {
                    broken = true;
                    break;
                }
            },
            ctrl = control_rx.recv() => {
                // None means the session handle was dropped: same as a
                // normal shutdown without a reason.
                if let Some(Control::Shutdown(reason)) = ctrl {
                    close_reason = reason;
                }
                break;
            },
            _ = keepalive.tick() => {
                if last_seen.elapsed() >= config.keep_alive_timeout {
                    tracing::debug!(session = %shared.label, "keep-alive timeout, peer is dead");
                    broken = true;
                    break;
                }
                if sink.send(Message::Binary(Frame::ping().encode())).await.is_err() {
                    broken = true;
                    break;
                }
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);

    // A cleanly closed session ends its streams with EOF; a broken one fails
    // them (readers observe the closed flag through the dropped senders).
    let streams: Vec<_> = shared.streams.lock().drain().collect();
    if !broken {
        for (_, tx) in streams {
            let _ = tx.send(StreamEvent::Fin);
        }
    }

    if !broken {
        let frame = match close_reason {
            None => CloseFrame { code: CloseCode::Normal, reason: "".into() },
            Some(err) => CloseFrame {
                code: CloseCode::Policy,
                reason: format!("error: {err}").into(),
            },
        };
        let _ = time::timeout(WS_CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
    }
    let _ = time::timeout(WS_CLOSE_TIMEOUT, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// In-memory message transport: two of these glued back to back stand in
    /// for a WebSocket during tests.
    struct ChannelTransport {
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    fn transport_pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport { tx: a_tx, rx: b_rx },
            ChannelTransport { tx: b_tx, rx: a_rx },
        )
    }

    impl Stream for ChannelTransport {
        type Item = std::result::Result<Message, WsError>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.get_mut().rx.poll_recv(cx).map(|m| m.map(Ok))
        }
    }

    impl Sink<Message> for ChannelTransport {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> std::result::Result<(), WsError> {
            self.get_mut().tx.send(item).map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::data(42, b"hello world");
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.payload, b"hello world");
    }

    #[test]
    fn test_frame_rejects_garbage() {
        assert!(Frame::decode(&[0x04, 0, 0]).is_err());
        assert!(Frame::decode(&[0x7f, 0, 0, 0, 1, 0, 0]).is_err());
        // length field disagrees with the actual payload
        assert!(Frame::decode(&[0x04, 0, 0, 0, 1, 0, 9, b'x']).is_err());
    }

    #[tokio::test]
    async fn test_open_accept_roundtrip() {
        let (a, b) = transport_pair();
        let client = MuxSession::client(a, MuxConfig::default(), "test-client");
        let server = MuxSession::server(b, MuxConfig::default(), "test-server");

        let mut up = client.open_stream().await.unwrap();
        up.write_all(b"hello").await.unwrap();

        let mut down = server.accept_stream().await.unwrap();
        assert_eq!(down.id(), up.id());

        let mut buf = [0u8; 5];
        down.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        down.write_all(b"world").await.unwrap();
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // FIN from the client surfaces as clean EOF on the server side.
        up.shutdown().await.unwrap();
        let n = down.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_second_stream_is_independent() {
        let (a, b) = transport_pair();
        let client = MuxSession::client(a, MuxConfig::default(), "c");
        let server = MuxSession::server(b, MuxConfig::default(), "s");

        let mut first = client.open_stream().await.unwrap();
        let mut second = client.open_stream().await.unwrap();
        assert_ne!(first.id(), second.id());

        // Write on the second stream before the first has moved any bytes.
        second.write_all(b"2nd").await.unwrap();
        first.write_all(b"1st").await.unwrap();

        let mut s1 = server.accept_stream().await.unwrap();
        let mut s2 = server.accept_stream().await.unwrap();

        let mut buf = [0u8; 3];
        s1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1st");
        s2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2nd");
    }

    #[tokio::test]
    async fn test_broken_transport_fails_streams() {
        let (a, b) = transport_pair();
        let client = MuxSession::client(a, MuxConfig::default(), "c");

        let mut stream = client.open_stream().await.unwrap();
        drop(b);

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(client.is_closed());
        assert!(matches!(client.open_stream().await, Err(Error::BrokenSession)));
    }

    #[tokio::test]
    async fn test_session_close_gives_eof() {
        let (a, b) = transport_pair();
        let client = MuxSession::client(a, MuxConfig::default(), "c");
        let server = MuxSession::server(b, MuxConfig::default(), "s");

        let _up = client.open_stream().await.unwrap();
        let mut down = server.accept_stream().await.unwrap();

        client.close(None);

        // The normal closure frame ends the server session; its streams see
        // EOF rather than an error.
        let mut buf = [0u8; 4];
        let n = down.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_declares_peer_dead() {
        // The peer end swallows pings and never answers.
        let (a, _quiet) = transport_pair();
        let client = MuxSession::client(a, MuxConfig::default(), "c");
        let mut stream = client.open_stream().await.unwrap();

        // Paused time auto-advances past the keep-alive timeout.
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(client.is_closed());
    }
}
