//! Control-frame lifecycle: keepalive pings and the close handshake
//!
//! One [`ControlCoordinator`] per connection. The reader routes every
//! control frame here; the coordinator injects replies (pong echoes,
//! close frames) into the shared outbound queue and owns the one switch
//! that tears the connection down. Termination is idempotent: whichever
//! of peer close, local close, ping timeout, or transport failure gets
//! there first wins, and the rest are no-ops.
//!
//! Timing (ping interval, pong/close-wait deadline) is passed in at
//! construction; there is no process-wide timer state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, OpCode};
use crate::writer::Outbound;

/// Close handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    /// No close frame sent or received
    Open,
    /// We sent a close frame first, awaiting the peer's echo
    CloseSent,
    /// Handshake complete in both directions
    Closed,
}

/// Per-connection control coordinator
pub struct ControlCoordinator {
    outbound: Outbound,
    timeout: Duration,
    state: Mutex<CloseState>,
    peer_close: Mutex<Option<CloseReason>>,
    peer_close_seen: Notify,
    inbound: Mutex<Option<mpsc::Sender<Result<Frame>>>>,
    pong_tx: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
    terminated: AtomicBool,
}

impl ControlCoordinator {
    /// Create a coordinator
    ///
    /// `timeout` bounds both the wait for an expected pong and the wait
    /// for the peer's close echo. The returned receiver feeds pong
    /// payloads to the ping scheduler; drop it when keepalive is
    /// disabled.
    pub(crate) fn new(
        outbound: Outbound,
        inbound: mpsc::Sender<Result<Frame>>,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (pong_tx, pong_rx) = mpsc::channel(4);
        let (shutdown, _) = watch::channel(false);
        let coordinator = Arc::new(Self {
            outbound,
            timeout,
            state: Mutex::new(CloseState::Open),
            peer_close: Mutex::new(None),
            peer_close_seen: Notify::new(),
            inbound: Mutex::new(Some(inbound)),
            pong_tx,
            shutdown,
            terminated: AtomicBool::new(false),
        });
        (coordinator, pong_rx)
    }

    /// Subscribe to the termination signal
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Whether the connection has been torn down
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The peer's close reason, once a close frame has been received
    pub fn peer_close_reason(&self) -> Option<CloseReason> {
        self.peer_close.lock().unwrap().clone()
    }

    fn close_state(&self) -> CloseState {
        *self.state.lock().unwrap()
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<Result<Frame>>> {
        self.inbound.lock().unwrap().clone()
    }

    /// Handle one control frame from the reader
    pub(crate) async fn on_control(&self, frame: Frame) {
        match frame.opcode {
            OpCode::Ping => {
                if self.close_state() == CloseState::Open {
                    trace!(len = frame.payload.len(), "echoing pong");
                    let _ = self.outbound.send(Frame::pong(frame.payload)).await;
                } else {
                    trace!("ping suppressed, close in progress");
                }
            }
            OpCode::Pong => {
                // Unsolicited pongs are dropped by the scheduler's nonce
                // match; a full buffer just means nobody is waiting
                let _ = self.pong_tx.try_send(frame.payload);
            }
            OpCode::Close => self.on_peer_close(frame).await,
            _ => debug_assert!(false, "data frame routed to coordinator"),
        }
    }

    /// Peer-initiated close, or the peer's echo of ours
    async fn on_peer_close(&self, frame: Frame) {
        let reason = frame.close_reason().unwrap_or(None);
        *self.peer_close.lock().unwrap() = reason.clone();

        let echo = {
            let mut state = self.state.lock().unwrap();
            match *state {
                CloseState::Open => {
                    *state = CloseState::Closed;
                    true
                }
                // We initiated; this is the confirmation. No second echo.
                CloseState::CloseSent => {
                    *state = CloseState::Closed;
                    false
                }
                CloseState::Closed => return,
            }
        };

        debug!(?reason, echo, "peer close received");

        if echo {
            let _ = self
                .outbound
                .send(Frame::new(OpCode::Close, frame.payload.clone(), true))
                .await;
            // Make sure the echo reaches the wire before shutdown stops
            // the writer
            let _ = self.outbound.flush().await;
        }

        // The application must observe the clean close before the queue
        // closes, even when the queue is full of undelivered data frames
        if let Some(tx) = self.inbound_sender() {
            let _ = tx.send(Ok(frame)).await;
        }

        self.peer_close_seen.notify_one();
        self.terminate();
    }

    /// Locally initiated close handshake
    ///
    /// Sends a close frame and waits for the peer's echo, with the
    /// configured timeout bounding the whole sequence including the
    /// writes, then terminates either way. Idempotent: a second call
    /// (or a call after the peer already closed) does nothing.
    pub async fn close(&self, reason: Option<CloseReason>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                CloseState::Open => *state = CloseState::CloseSent,
                _ => return Ok(()),
            }
        }

        let frame = match &reason {
            Some(r) => Frame::close(r),
            None => Frame::close_empty(),
        };

        debug!(?reason, "closing, awaiting peer echo");
        // One deadline bounds the whole sequence. A wedged writer stalls
        // the send or flush just as an unresponsive peer stalls the echo
        // wait; neither may hold close() open past the timeout.
        let handshake = async {
            if self.outbound.send(frame).await.is_err() || self.outbound.flush().await.is_err() {
                return;
            }
            if !self.is_terminated() {
                self.peer_close_seen.notified().await;
            }
        };
        if time::timeout(self.timeout, handshake).await.is_err() {
            debug!("close deadline elapsed, terminating anyway");
        }

        self.terminate();
        Ok(())
    }

    /// Error-path close: best-effort close frame to the peer, error to
    /// the application, immediate termination
    pub(crate) async fn fail(&self, reason: CloseReason, error: Option<Error>) {
        if let (Some(e), Some(tx)) = (error, self.inbound_sender()) {
            // The terminal error must reach the application even when the
            // queue is momentarily full; a dropped receiver ends the wait
            let _ = tx.send(Err(e)).await;
        }

        {
            let mut state = self.state.lock().unwrap();
            match *state {
                CloseState::Open => *state = CloseState::CloseSent,
                _ => {
                    self.terminate();
                    return;
                }
            }
        }

        warn!(%reason, "closing on failure");
        // Best effort, deadline-bounded: a wedged writer must not keep
        // the connection alive past the timeout
        let notify_peer = async {
            if self.outbound.send(Frame::close(&reason)).await.is_ok() {
                let _ = self.outbound.flush().await;
            }
        };
        let _ = time::timeout(self.timeout, notify_peer).await;
        self.terminate();
    }

    /// Tear the connection down: stop all three tasks and close the
    /// inbound queue. Safe to call any number of times.
    pub(crate) fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inbound.lock().unwrap().take();
        let _ = self.shutdown.send(true);
        debug!("session terminated");
    }

    /// Periodic keepalive scheduler
    ///
    /// Every `interval`, sends a ping carrying a unique nonce and waits
    /// up to the configured timeout for the matching pong. Pongs with
    /// any other payload are ignored. A missed deadline is the only
    /// automatic error-triggered close in the engine.
    pub(crate) async fn ping_loop(
        self: Arc<Self>,
        interval: Duration,
        mut pong_rx: mpsc::Receiver<Bytes>,
    ) {
        let mut shutdown = self.shutdown_signal();
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            if self.is_terminated() || self.close_state() != CloseState::Open {
                return;
            }

            seq += 1;
            let nonce = ping_nonce(seq);
            if self.outbound.send(Frame::ping(nonce.clone())).await.is_err() {
                return;
            }
            trace!(seq, "ping sent");

            let matched = async {
                loop {
                    match pong_rx.recv().await {
                        Some(payload) if payload == nonce => break true,
                        Some(_) => trace!("unsolicited pong ignored"),
                        None => break false,
                    }
                }
            };

            match time::timeout(self.timeout, matched).await {
                Ok(true) => trace!(seq, "pong matched"),
                Ok(false) => return,
                Err(_) => {
                    warn!(seq, "pong deadline missed");
                    self.fail(
                        CloseReason::new(CloseReason::UNEXPECTED_CONDITION, "Ping timeout"),
                        Some(Error::PingTimeout),
                    )
                    .await;
                    return;
                }
            }
        }
    }
}

/// Unique ping payload: monotonic sequence plus random tail
fn ping_nonce(seq: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(seq);
    buf.put_u64(fastrand::u64(..));
    buf.freeze()
}
