use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::{Frame, FrameCodec, FrameConfig};
use crate::error::{FrameError, Result};

/// Ordered, reliable, bidirectional frame delivery.
///
/// Sending never blocks: frames are queued and written by a background
/// task. The inbound side yields `None` once the other end is gone, which
/// is the only close signal a link gives.
pub struct Link {
    sender: LinkSender,
    receiver: LinkReceiver,
    drained: Drained,
}

/// Outbound half of a [`Link`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Frame>,
    max_payload_size: usize,
}

/// Inbound half of a [`Link`].
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Resolves once every frame queued on a link has been written out.
///
/// For a stream-backed link that happens after the last [`LinkSender`] is
/// dropped and the write half has been shut down. In-memory links hand
/// frames over directly and are always drained.
#[derive(Debug, Clone)]
pub struct Drained {
    rx: watch::Receiver<bool>,
}

impl Drained {
    fn immediate() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub async fn wait(mut self) {
        // A writer that went away without reporting is done as well.
        let _ = self.rx.wait_for(|drained| *drained).await;
    }
}

impl LinkSender {
    /// Queue a frame for delivery.
    ///
    /// A payload over the link's limit is rejected here and never reaches
    /// the writer, so the link stays up.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if frame.payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload_size,
            });
        }
        self.tx.send(frame).map_err(|_| FrameError::LinkClosed)
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// True once the delivering side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl LinkReceiver {
    /// Receive the next frame, or `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Link {
    /// Two in-memory links wired back to back.
    pub fn pair() -> (Link, Link) {
        Self::pair_with_config(&FrameConfig::default())
    }

    /// Like [`pair`](Self::pair), enforcing `config`'s payload limit on send.
    pub fn pair_with_config(config: &FrameConfig) -> (Link, Link) {
        let max_payload_size = config.max_payload_size;
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Link::from_parts(
                LinkSender {
                    tx: a_tx,
                    max_payload_size,
                },
                LinkReceiver { rx: a_rx },
                Drained::immediate(),
            ),
            Link::from_parts(
                LinkSender {
                    tx: b_tx,
                    max_payload_size,
                },
                LinkReceiver { rx: b_rx },
                Drained::immediate(),
            ),
        )
    }

    /// Frame a byte stream.
    ///
    /// Spawns a reader and a writer task on the current tokio runtime. A
    /// decode error is fatal for the stream (framing cannot resynchronize)
    /// and closes the inbound side. Dropping every [`LinkSender`] flushes
    /// queued frames and shuts down the write half.
    pub fn from_stream<S>(stream: S, config: FrameConfig) -> Link
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        let mut framed_read = FramedRead::new(read_half, FrameCodec::new(&config));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = framed_read.next() => match item {
                        Some(Ok(frame)) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "frame decode failed; closing link");
                            break;
                        }
                        None => {
                            debug!("stream reached end of input");
                            break;
                        }
                    },
                    _ = in_tx.closed() => break,
                }
            }
        });

        let (drained_tx, drained_rx) = watch::channel(false);
        let mut framed_write = FramedWrite::new(write_half, FrameCodec::new(&config));
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = framed_write.send(frame).await {
                    warn!(error = %err, "frame write failed; closing link");
                    break;
                }
            }
            if let Err(err) = framed_write.get_mut().shutdown().await {
                debug!(error = %err, "stream shutdown failed");
            }
            let _ = drained_tx.send(true);
        });

        Link::from_parts(
            LinkSender {
                tx: out_tx,
                max_payload_size: config.max_payload_size,
            },
            LinkReceiver { rx: in_rx },
            Drained { rx: drained_rx },
        )
    }

    fn from_parts(sender: LinkSender, receiver: LinkReceiver, drained: Drained) -> Self {
        Self {
            sender,
            receiver,
            drained,
        }
    }

    /// Queue a frame for delivery.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.sender.send(frame)
    }

    /// Receive the next frame, or `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// A new handle to the outbound half.
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Handle that resolves once outbound frames have been written out.
    pub fn drained(&self) -> Drained {
        self.drained.clone()
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (LinkSender, LinkReceiver) {
        (self.sender, self.receiver)
    }
}
