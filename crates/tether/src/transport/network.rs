//! Stream transport seam.
//!
//! The remote manager only needs listen/accept/connect over an ordered,
//! reliable byte stream. [`TokioNetwork`] provides that over TCP; other
//! providers (in-memory, simulated) can be passed in at construction.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::endpoint::Endpoint;

/// Creates listeners and outbound streams.
#[async_trait]
pub trait NetworkProvider: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: Listener<Stream = Self::Stream>;

    async fn bind(&self, endpoint: &Endpoint) -> io::Result<Self::Listener>;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Self::Stream>;
}

/// A bound listening socket.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept one connection, returning the stream and the peer's address.
    async fn accept(&self) -> io::Result<(Self::Stream, Endpoint)>;

    fn local_endpoint(&self) -> io::Result<Endpoint>;
}

/// TCP via tokio.
#[derive(Debug, Clone)]
pub struct TokioNetwork {
    nodelay: bool,
}

impl TokioNetwork {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

impl Default for TokioNetwork {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl NetworkProvider for TokioNetwork {
    type Stream = TcpStream;
    type Listener = TokioListener;

    async fn bind(&self, endpoint: &Endpoint) -> io::Result<TokioListener> {
        let inner = TcpListener::bind((endpoint.host(), endpoint.port())).await?;
        tracing::trace!(requested = %endpoint, bound = ?inner.local_addr().ok(), "Bound TCP listener");
        Ok(TokioListener {
            inner,
            nodelay: self.nodelay,
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

pub struct TokioListener {
    inner: TcpListener,
    nodelay: bool,
}

#[async_trait]
impl Listener for TokioListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, Endpoint)> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        Ok((stream, Endpoint::from(peer)))
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }
}
