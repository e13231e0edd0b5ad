//! Session wiring: transport halves, tasks, and the application handle
//!
//! [`WebSocketSession::spawn`] takes ownership of an already-upgraded
//! duplex transport and starts the per-connection tasks: a reader that
//! drives the inbound state machine and routes control frames to the
//! coordinator, a writer that drains the outbound queue, and (when
//! keepalive is configured) the ping scheduler. The application talks to
//! the session through bounded queues only; a slow consumer stalls the
//! reader instead of growing memory.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::control::ControlCoordinator;
use crate::error::{CloseReason, Error, Result};
use crate::frame::Frame;
use crate::reader::Reader;
use crate::serialize::Serializer;
use crate::writer::{run_writer, Outbound};
use crate::{Config, RECV_BUFFER_SIZE};

/// Terminates the session when the last application handle goes away
struct TerminateOnDrop(Arc<ControlCoordinator>);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// A running WebSocket connection
///
/// Dropping the session terminates it: all tasks stop and the transport
/// halves are released. For a graceful shutdown call [`close`] first.
///
/// [`close`]: WebSocketSession::close
pub struct WebSocketSession {
    outbound: Outbound,
    inbound: mpsc::Receiver<Result<Frame>>,
    coordinator: Arc<ControlCoordinator>,
    _guard: TerminateOnDrop,
}

impl WebSocketSession {
    /// Start a session over an upgraded transport
    pub fn spawn<T>(transport: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);

        let outbound = Outbound::new(cmd_tx);
        let (coordinator, pong_rx) =
            ControlCoordinator::new(outbound.clone(), inbound_tx.clone(), config.timeout);

        let serializer = Serializer::new(config.masking, config.write_buffer_size);
        let writer_coordinator = coordinator.clone();
        let writer_shutdown = coordinator.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = run_writer(write_half, cmd_rx, serializer, writer_shutdown).await {
                debug!(error = %e, "writer stopped");
            }
            writer_coordinator.terminate();
        });

        let reader = Reader::new(config.max_frame_size);
        let reader_coordinator = coordinator.clone();
        let reader_shutdown = coordinator.shutdown_signal();
        tokio::spawn(run_reader(
            read_half,
            reader,
            inbound_tx,
            reader_coordinator,
            reader_shutdown,
        ));

        match config.ping_interval {
            Some(interval) => {
                tokio::spawn(coordinator.clone().ping_loop(interval, pong_rx));
            }
            None => drop(pong_rx),
        }

        Self {
            outbound,
            inbound: inbound_rx,
            _guard: TerminateOnDrop(coordinator.clone()),
            coordinator,
        }
    }

    /// Receive the next inbound frame
    ///
    /// Yields reassembled data frames and the peer's close frame; pings
    /// and pongs are consumed internally. `None` means the connection has
    /// ended and the queue is drained. An `Err` item reports the failure
    /// that terminated the connection.
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await
    }

    /// Enqueue a frame for the peer
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound.send(frame).await
    }

    /// Flush everything enqueued so far to the transport
    pub async fn flush(&self) -> Result<()> {
        self.outbound.flush().await
    }

    /// Start a graceful close handshake
    ///
    /// Sends a close frame and waits for the peer's echo; the configured
    /// timeout bounds the whole sequence, so an unresponsive peer (or a
    /// jammed transport) cannot hold this open. Idempotent.
    pub async fn close(&self, reason: Option<CloseReason>) -> Result<()> {
        self.coordinator.close(reason).await
    }

    /// A cloneable enqueue-only handle, usable from other tasks
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// The close reason the peer sent, once one has arrived
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.coordinator.peer_close_reason()
    }

    /// Whether the connection has been torn down
    pub fn is_terminated(&self) -> bool {
        self.coordinator.is_terminated()
    }

    /// Split into a frame stream and a send handle
    pub fn split(self) -> (Incoming, Outbound) {
        let Self {
            outbound,
            inbound,
            _guard,
            ..
        } = self;
        (
            Incoming {
                inbound,
                _guard,
            },
            outbound,
        )
    }
}

/// Stream of inbound frames, produced by [`WebSocketSession::split`]
///
/// Dropping it terminates the session.
pub struct Incoming {
    inbound: mpsc::Receiver<Result<Frame>>,
    _guard: TerminateOnDrop,
}

impl futures_core::Stream for Incoming {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

/// Reader task: transport bytes in, frames routed out
///
/// Control frames go to the coordinator, data frames to the application
/// queue. Any framing error closes the connection with a reason code
/// matching the failure; EOF simply ends the inbound stream.
async fn run_reader<R>(
    mut transport: R,
    mut reader: Reader,
    inbound: mpsc::Sender<Result<Frame>>,
    coordinator: Arc<ControlCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
    let mut frames = Vec::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            read = transport.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("transport EOF");
                reader.finish();
                break;
            }
            Ok(n) => trace!(bytes = n, "read"),
            Err(e) => {
                match Error::from(e) {
                    Error::ConnectionClosed(_) => {}
                    error => {
                        // Terminal: must not be lost to a full queue
                        let _ = inbound.send(Err(error)).await;
                    }
                }
                break;
            }
        }

        let drained = reader.drain(&mut buf, &mut frames);

        // Frames completed before any error still get delivered
        for frame in frames.drain(..) {
            if frame.is_control() {
                coordinator.on_control(frame).await;
                if coordinator.is_terminated() {
                    // Close handshake finished; anything after it is ignored
                    return;
                }
            } else if inbound.send(Ok(frame)).await.is_err() {
                // Application handle dropped
                coordinator.terminate();
                return;
            }
        }

        if let Err(error) = drained {
            let reason = match &error {
                Error::FrameTooBig => CloseReason::new(CloseReason::TOO_BIG, "Frame too big"),
                Error::Protocol(msg) => CloseReason::new(CloseReason::PROTOCOL_ERROR, *msg),
                _ => CloseReason::new(CloseReason::UNEXPECTED_CONDITION, ""),
            };
            coordinator.fail(reason, Some(error)).await;
            return;
        }

        if coordinator.is_terminated() {
            return;
        }
    }

    coordinator.terminate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use crate::parser::{FrameCollector, FrameParser};
    use crate::serialize::encode_frame;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Test-side peer: raw frame encode/decode over the other end of a
    /// duplex pipe
    struct Peer {
        stream: DuplexStream,
        parser: FrameParser,
        collector: FrameCollector,
        buf: BytesMut,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                parser: FrameParser::new(),
                collector: FrameCollector::new(),
                buf: BytesMut::new(),
            }
        }

        async fn write_frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) {
            let mut wire = BytesMut::new();
            encode_frame(&mut wire, opcode, payload, fin, None);
            self.stream.write_all(&wire).await.unwrap();
        }

        async fn read_frame(&mut self) -> Frame {
            let mut chunk = [0u8; 4096];
            loop {
                loop {
                    if !self.parser.body_ready() {
                        match self.parser.feed(&mut self.buf).unwrap() {
                            Some(header) => self.collector.begin(header.payload_len as usize),
                            None => break,
                        }
                    }
                    self.collector.push(&mut self.buf);
                    if self.collector.has_remaining() {
                        break;
                    }
                    let header = *self.parser.header().unwrap();
                    self.parser.reset();
                    return Frame::new(
                        header.opcode,
                        self.collector.take(header.mask),
                        header.fin,
                    );
                }
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer hit EOF while expecting a frame");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn session_pair(config: Config) -> (WebSocketSession, Peer) {
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        (WebSocketSession::spawn(ours, config), Peer::new(theirs))
    }

    #[tokio::test]
    async fn data_round_trip() {
        let (mut session, mut peer) = session_pair(Config::server());

        peer.write_frame(OpCode::Text, b"hello", true).await;
        let frame = session.recv().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.as_text(), Some("hello"));

        session.send(Frame::binary(vec![1, 2, 3])).await.unwrap();
        let echoed = peer.read_frame().await;
        assert_eq!(echoed.opcode, OpCode::Binary);
        assert_eq!(echoed.payload.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn fragmented_message_reassembled() {
        let (mut session, mut peer) = session_pair(Config::server());

        peer.write_frame(OpCode::Text, b"AB", false).await;
        peer.write_frame(OpCode::Ping, b"probe", true).await;
        peer.write_frame(OpCode::Continuation, b"CDE", true).await;

        // The interleaved ping comes back as a pong before the message
        let pong = peer.read_frame().await;
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload.as_ref(), b"probe");

        let frame = session.recv().await.unwrap().unwrap();
        assert_eq!(frame.as_text(), Some("ABCDE"));
    }

    #[tokio::test]
    async fn client_side_masks_outgoing_frames() {
        let (session, mut peer) = session_pair(Config::client());

        session.send(Frame::text("masked")).await.unwrap();
        session.flush().await.unwrap();

        // Read raw bytes to check the mask bit before decoding
        let mut raw = [0u8; 2];
        peer.stream.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw[1] & 0x80, 0x80);

        let mut rest = [0u8; 4 + 6];
        peer.stream.read_exact(&mut rest).await.unwrap();
        let key = [rest[0], rest[1], rest[2], rest[3]];
        let mut payload = rest[4..].to_vec();
        crate::mask::apply_mask(&mut payload, key);
        assert_eq!(&payload, b"masked");
    }

    #[tokio::test]
    async fn peer_initiated_close_is_echoed_once() {
        let (mut session, mut peer) = session_pair(Config::server());

        let reason = CloseReason::new(CloseReason::GOING_AWAY, "maintenance");
        peer.write_frame(OpCode::Close, &reason.to_payload(), true)
            .await;

        let echo = peer.read_frame().await;
        assert_eq!(echo.opcode, OpCode::Close);
        assert_eq!(echo.close_reason().unwrap().unwrap(), reason);

        // Application observes the close frame, then end of stream
        let frame = session.recv().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(session.recv().await.is_none());
        assert_eq!(session.close_reason().unwrap(), reason);
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn local_close_completes_on_peer_echo() {
        let (session, mut peer) = session_pair(Config::server());

        let peer_task = tokio::spawn(async move {
            let close = peer.read_frame().await;
            assert_eq!(close.opcode, OpCode::Close);
            peer.write_frame(OpCode::Close, &close.payload, true).await;
        });

        session.close(Some(CloseReason::normal())).await.unwrap();
        assert!(session.is_terminated());
        peer_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_gives_up_after_timeout() {
        let config = Config::builder().timeout(Duration::from_secs(5)).build();
        let (session, mut peer) = session_pair(config);

        let started = tokio::time::Instant::now();
        session.close(None).await.unwrap();

        assert!(session.is_terminated());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(peer.read_frame().await.opcode, OpCode::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_when_writer_is_wedged() {
        let config = Config::builder().timeout(Duration::from_millis(200)).build();
        // Tiny pipe the peer never reads: the writer jams mid-write
        let (ours, theirs) = tokio::io::duplex(16);
        let session = WebSocketSession::spawn(ours, config);

        session.send(Frame::binary(vec![0u8; 1024])).await.unwrap();

        session.close(Some(CloseReason::normal())).await.unwrap();
        assert!(session.is_terminated());
        drop(theirs);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_timeout_tears_down_despite_wedged_writer() {
        let config = Config::builder()
            .ping_interval(Duration::from_millis(100))
            .timeout(Duration::from_millis(200))
            .build();
        let (ours, theirs) = tokio::io::duplex(16);
        let mut session = WebSocketSession::spawn(ours, config);

        // Jam the writer so neither the ping nor the failure close frame
        // can reach the peer
        session.send(Frame::binary(vec![0u8; 1024])).await.unwrap();

        assert!(matches!(
            session.recv().await.unwrap(),
            Err(Error::PingTimeout)
        ));
        assert!(session.recv().await.is_none());
        assert!(session.is_terminated());
        drop(theirs);
    }

    #[tokio::test]
    async fn terminal_error_survives_a_full_queue() {
        let config = Config::builder().channel_capacity(1).build();
        let (mut session, mut peer) = session_pair(config);

        // The first frame fills the capacity-1 queue; the stray
        // continuation is a fatal protocol error behind it
        peer.write_frame(OpCode::Text, b"first", true).await;
        peer.write_frame(OpCode::Continuation, b"stray", true).await;

        assert_eq!(
            session.recv().await.unwrap().unwrap().as_text(),
            Some("first")
        );
        assert!(matches!(
            session.recv().await.unwrap(),
            Err(Error::Protocol(_))
        ));
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn peer_close_survives_a_full_queue() {
        let config = Config::builder().channel_capacity(1).build();
        let (mut session, mut peer) = session_pair(config);

        peer.write_frame(OpCode::Text, b"first", true).await;
        let reason = CloseReason::new(CloseReason::NORMAL, "done");
        peer.write_frame(OpCode::Close, &reason.to_payload(), true)
            .await;

        assert_eq!(
            session.recv().await.unwrap().unwrap().as_text(),
            Some("first")
        );
        let frame = session.recv().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(session.close_reason().unwrap(), reason);
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_fails_with_too_big() {
        let config = Config::builder().max_frame_size(64).build();
        let (mut session, mut peer) = session_pair(config);

        peer.write_frame(OpCode::Binary, &[0u8; 100], true).await;

        assert!(matches!(
            session.recv().await.unwrap(),
            Err(Error::FrameTooBig)
        ));

        let close = peer.read_frame().await;
        assert_eq!(close.opcode, OpCode::Close);
        let reason = close.close_reason().unwrap().unwrap();
        assert_eq!(reason.code, CloseReason::TOO_BIG);
    }

    #[tokio::test]
    async fn protocol_violation_fails_with_protocol_error() {
        let (mut session, mut peer) = session_pair(Config::server());

        peer.write_frame(OpCode::Continuation, b"stray", true).await;

        assert!(matches!(
            session.recv().await.unwrap(),
            Err(Error::Protocol(_))
        ));

        let close = peer.read_frame().await;
        let reason = close.close_reason().unwrap().unwrap();
        assert_eq!(reason.code, CloseReason::PROTOCOL_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_answered_then_missed() {
        let config = Config::builder()
            .ping_interval(Duration::from_secs(5))
            .timeout(Duration::from_secs(2))
            .build();
        let (mut session, mut peer) = session_pair(config);

        // Answer the first two pings, then go silent
        for _ in 0..2 {
            let ping = peer.read_frame().await;
            assert_eq!(ping.opcode, OpCode::Ping);
            peer.write_frame(OpCode::Pong, &ping.payload, true).await;
        }
        let unanswered = peer.read_frame().await;
        assert_eq!(unanswered.opcode, OpCode::Ping);

        assert!(matches!(
            session.recv().await.unwrap(),
            Err(Error::PingTimeout)
        ));

        let close = peer.read_frame().await;
        let reason = close.close_reason().unwrap().unwrap();
        assert_eq!(reason.code, CloseReason::UNEXPECTED_CONDITION);
    }

    #[tokio::test]
    async fn transport_eof_ends_the_stream() {
        let (mut session, peer) = session_pair(Config::server());

        drop(peer);
        assert!(session.recv().await.is_none());
        assert!(session.is_terminated());
        assert!(session.close_reason().is_none());
    }

    #[tokio::test]
    async fn send_after_close_rejected() {
        let (session, mut peer) = session_pair(Config::server());

        let peer_task = tokio::spawn(async move {
            let close = peer.read_frame().await;
            peer.write_frame(OpCode::Close, &close.payload, true).await;
        });

        session.close(Some(CloseReason::normal())).await.unwrap();
        peer_task.await.unwrap();

        assert!(session.send(Frame::text("late")).await.is_err());
    }

    #[tokio::test]
    async fn incoming_stream_yields_frames() {
        use futures_util::StreamExt;

        let (session, mut peer) = session_pair(Config::server());
        let (mut incoming, outbound) = session.split();

        peer.write_frame(OpCode::Text, b"one", true).await;
        peer.write_frame(OpCode::Text, b"two", true).await;

        assert_eq!(
            incoming.next().await.unwrap().unwrap().as_text(),
            Some("one")
        );
        assert_eq!(
            incoming.next().await.unwrap().unwrap().as_text(),
            Some("two")
        );

        outbound.send(Frame::text("reply")).await.unwrap();
        assert_eq!(peer.read_frame().await.as_text(), Some("reply"));
    }
}
