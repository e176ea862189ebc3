//! Outbound links and send handles.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::SinkExt;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use super::Shared;
use crate::endpoint::{ConnectionId, Endpoint};
use crate::error::{RemoteError, Result};
use crate::transport::{JsonCodec, LinkHello, NetworkProvider, TokioNetwork};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type LinkWriter<N> = FramedWrite<<N as NetworkProvider>::Stream, LengthDelimitedCodec>;

/// One cached outbound connection per destination.
///
/// The writer mutex is the ordering point: frames are written one at a time,
/// in the order senders acquire it (tokio's mutex is FIFO).
///
/// A link whose connect fails is retired and evicted from the manager's table,
/// so unreachable destinations do not accumulate. Senders queued behind it
/// pick up a fresh link.
pub(crate) struct OutboundLink<N: NetworkProvider> {
    destination: Endpoint,
    writer: Mutex<Option<(ConnectionId, LinkWriter<N>)>>,
    connected: AtomicBool,
    retired: AtomicBool,
}

impl<N: NetworkProvider> OutboundLink<N> {
    pub(crate) fn new(destination: Endpoint) -> Self {
        Self {
            destination,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    /// Write one frame. `None` means the link was retired before this frame
    /// got its turn and nothing was written.
    async fn send(&self, shared: &Shared<N>, frame: Bytes) -> Option<Result<()>> {
        let mut writer = self.writer.lock().await;
        if self.retired.load(Ordering::Acquire) {
            return None;
        }

        let (id, framed) = match writer.take() {
            Some(link) => writer.insert(link),
            None => match self.connect(shared).await {
                Ok(link) => writer.insert(link),
                Err(e) => {
                    self.retired.store(true, Ordering::Release);
                    shared.evict(&self.destination, self);
                    return Some(Err(e));
                }
            },
        };

        if let Err(e) = framed.send(frame).await {
            tracing::warn!(
                connection = %id,
                peer = %self.destination,
                error = %e,
                "Send failed, dropping connection"
            );
            *writer = None;
            self.connected.store(false, Ordering::Release);
            return Some(Err(RemoteError::connection(&self.destination, e)));
        }
        Some(Ok(()))
    }

    async fn connect(&self, shared: &Shared<N>) -> Result<(ConnectionId, LinkWriter<N>)> {
        let stream = tokio::time::timeout(
            shared.config.connect_timeout,
            shared.network.connect(&self.destination),
        )
        .await
        .map_err(|_| {
            RemoteError::connection(
                &self.destination,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            )
        })?
        .map_err(|e| RemoteError::connection(&self.destination, e))?;

        let mut hello = FramedWrite::new(
            stream,
            JsonCodec::<LinkHello>::new(shared.config.max_frame_length),
        );
        hello
            .send(LinkHello::new(shared.local.clone()))
            .await
            .map_err(|e| RemoteError::connection(&self.destination, e))?;

        let id = ConnectionId::new();
        self.connected.store(true, Ordering::Release);
        tracing::debug!(connection = %id, peer = %self.destination, "Connected to peer");

        Ok((id, hello.map_encoder(JsonCodec::into_inner)))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flush and close the connection, if any, and retire the link.
    pub(crate) async fn shutdown(&self) {
        let taken = {
            let mut writer = self.writer.lock().await;
            self.retired.store(true, Ordering::Release);
            writer.take()
        };
        self.connected.store(false, Ordering::Release);

        if let Some((id, mut framed)) = taken {
            let closing = SinkExt::<Bytes>::close(&mut framed);
            match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, closing).await {
                Ok(Ok(())) => tracing::trace!(connection = %id, "Closed outbound connection"),
                Ok(Err(e)) => {
                    tracing::debug!(connection = %id, error = %e, "Error closing outbound connection")
                }
                Err(_) => tracing::debug!(connection = %id, "Timed out closing outbound connection"),
            }
        }
    }
}

/// Handle for sending frames to one peer.
///
/// Cheap to clone; every handle for a destination shares the manager's cached
/// connection, so frames sent through one handle arrive in send order.
pub struct RemoteSender<N: NetworkProvider = TokioNetwork> {
    destination: Endpoint,
    shared: Arc<Shared<N>>,
}

impl<N: NetworkProvider> Clone for RemoteSender<N> {
    fn clone(&self) -> Self {
        Self {
            destination: self.destination.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<N: NetworkProvider> RemoteSender<N> {
    pub(crate) fn new(destination: Endpoint, shared: Arc<Shared<N>>) -> Self {
        Self {
            destination,
            shared,
        }
    }

    pub fn destination(&self) -> &Endpoint {
        &self.destination
    }

    /// Whether an outbound connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared
            .links
            .get(&self.destination)
            .is_some_and(|link| link.is_connected())
    }

    /// Send one frame, connecting first if needed.
    ///
    /// Resolves once the frame is written to the socket. A failed connect or
    /// write returns a retryable [`RemoteError::Connection`] and drops the
    /// connection; the next call reconnects. Nothing is retried automatically.
    pub async fn send(&self, frame: impl Into<Bytes>) -> Result<()> {
        let frame = frame.into();

        if self.shared.is_closed() {
            return Err(RemoteError::Closed);
        }
        let max = self.shared.config.max_frame_length;
        if frame.len() > max {
            return Err(RemoteError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }

        let size = frame.len();
        loop {
            let link = self.shared.link(&self.destination)?;
            let sent = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => return Err(RemoteError::Closed),
                sent = link.send(&self.shared, frame.clone()) => sent,
            };

            match sent {
                Some(Ok(())) => {
                    tracing::trace!(peer = %self.destination, size, "Sent frame");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
                None => continue,
            }
        }
    }
}

impl<N: NetworkProvider> std::fmt::Debug for RemoteSender<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSender")
            .field("destination", &self.destination)
            .field("connected", &self.is_connected())
            .finish()
    }
}
