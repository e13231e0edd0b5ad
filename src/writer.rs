//! Outbound queue and writer task
//!
//! All producers (the application and the control coordinator) enqueue
//! frames through a cloneable [`Outbound`] handle onto one bounded FIFO
//! queue; a single writer task drains it, batches frames through the
//! [`Serializer`](crate::serialize::Serializer) and performs the
//! transport writes, so wire order always matches enqueue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode};
use crate::serialize::Serializer;

/// Writer task input
pub(crate) enum Command {
    /// Serialize and write a frame
    Frame(Frame),
    /// Flush the transport and acknowledge
    Flush(oneshot::Sender<()>),
}

/// Enqueue-only handle to a session's outbound direction
///
/// Cheap to clone; every clone feeds the same FIFO queue. Once a close
/// frame has been accepted, further data frames are rejected
/// synchronously with [`Error::OutboundClosed`].
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a frame for writing
    ///
    /// Suspends while the queue is full. A close frame closes the
    /// outbound direction: exactly one is accepted, and data frames
    /// enqueued afterwards fail with [`Error::OutboundClosed`]. Control
    /// frames remain allowed so the close sequence itself can proceed.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if frame.opcode == OpCode::Close {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(Error::OutboundClosed);
            }
        } else if frame.opcode.is_data() && self.closed.load(Ordering::Acquire) {
            return Err(Error::OutboundClosed);
        }

        self.tx
            .send(Command::Frame(frame))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Flush and wait for the transport to confirm
    ///
    /// A no-op acknowledgment when nothing is pending: everything
    /// enqueued before this call has been written by the time it
    /// resolves.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        ack_rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Fire-and-forget flush request, no completion guarantee
    pub fn request_flush(&self) {
        let (ack_tx, _) = oneshot::channel();
        let _ = self.tx.try_send(Command::Flush(ack_tx));
    }

    /// Whether a close frame has been accepted
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Writer loop: drain the queue, batch, write
///
/// Exits when the shutdown signal fires or the queue closes; the
/// transport write half is dropped on exit, releasing it to the
/// external layer. A write error propagates to the caller, which
/// terminates the session.
pub(crate) async fn run_writer<W>(
    mut transport: W,
    mut rx: mpsc::Receiver<Command>,
    mut serializer: Serializer,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let cmd = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            Command::Flush(ack) => {
                transport.flush().await?;
                let _ = ack.send(());
            }

            Command::Frame(frame) => {
                // Pipeline queued frames into one write while they fit
                let mut carry = Some(frame);
                while let Some(frame) = carry.take() {
                    if !serializer.queue(&frame) {
                        // Full batch; write it, then retry this frame
                        carry = Some(frame);
                    } else {
                        loop {
                            match rx.try_recv() {
                                Ok(Command::Frame(next)) => {
                                    if !serializer.queue(&next) {
                                        carry = Some(next);
                                        break;
                                    }
                                }
                                Ok(Command::Flush(ack)) => {
                                    acks.push(ack);
                                    break;
                                }
                                Err(_) => break,
                            }
                        }
                    }

                    let batch = serializer.take();
                    trace!(bytes = batch.len(), "writing batch");
                    transport.write_all(&batch).await?;
                    transport.flush().await?;
                    for ack in acks.drain(..) {
                        let _ = ack.send(());
                    }
                }
            }
        }
    }

    Ok(())
}
