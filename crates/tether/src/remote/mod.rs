//! Remote manager - owns one local endpoint's listener, inbound connections,
//! outbound connections and observer registrations.
//!
//! Background tasks (all tracked, all stopped by `close()`):
//! 1. Accept loop: admits inbound connections
//! 2. Receive loop per inbound connection: reads the hello, then frames,
//!    and queues each frame for the sender's observer
//! 3. Dispatch task per observer: drains its queue into the observer
//!
//! Outbound connections are write-only and established lazily by the first
//! `send` to a destination. Inbound connections are read-only.

mod observers;
mod sender;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RemoteConfig;
use crate::endpoint::{ConnectionId, Endpoint};
use crate::error::{RemoteError, Result};
use crate::observer::Observer;
use crate::transport::codec::LINK_VERSION;
use crate::transport::{JsonCodec, LinkHello, Listener, NetworkProvider, TokioNetwork};

use observers::{ObserverTable, dispatch};
use sender::OutboundLink;
pub use sender::RemoteSender;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared between the manager, its send handles and background tasks.
pub(crate) struct Shared<N: NetworkProvider> {
    pub(crate) local: Endpoint,
    pub(crate) config: RemoteConfig,
    pub(crate) network: N,
    pub(crate) shutdown: CancellationToken,
    observers: ObserverTable,
    links: DashMap<Endpoint, Arc<OutboundLink<N>>>,
    closed: AtomicBool,
    inbound: AtomicUsize,
    tasks: TaskTracker,
}

impl<N: NetworkProvider> Shared<N> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cached link for `destination`, created on first use.
    ///
    /// Re-checks `closed` after inserting: `close()` sets the flag before it
    /// clears the table, so a link inserted concurrently is either cleared by
    /// `close()` or removed here.
    pub(crate) fn link(&self, destination: &Endpoint) -> Result<Arc<OutboundLink<N>>> {
        if self.is_closed() {
            return Err(RemoteError::Closed);
        }

        let link = self
            .links
            .entry(destination.clone())
            .or_insert_with(|| Arc::new(OutboundLink::new(destination.clone())))
            .value()
            .clone();

        if self.is_closed() {
            self.evict(destination, &link);
            return Err(RemoteError::Closed);
        }
        Ok(link)
    }

    /// Drop `link` from the table unless it has already been replaced.
    pub(crate) fn evict(&self, destination: &Endpoint, link: &OutboundLink<N>) {
        let removed = self
            .links
            .remove_if(destination, |_, cached| std::ptr::eq(Arc::as_ptr(cached), link));
        if removed.is_some() {
            tracing::debug!(peer = %destination, "Evicted outbound link");
        }
    }
}

/// Bidirectional frame transport for one local endpoint.
///
/// ```ignore
/// let (manager, local) = RemoteManager::bind(Endpoint::loopback(), RemoteConfig::default()).await?;
/// manager.register_observer(peer.clone(), observer_fn(|frame: Bytes| handle(frame)))?;
/// manager.sender(&peer)?.send(bytes).await?;
/// manager.close().await?;
/// ```
pub struct RemoteManager<N: NetworkProvider = TokioNetwork> {
    shared: Arc<Shared<N>>,
}

impl RemoteManager<TokioNetwork> {
    /// Bind over TCP. Port 0 picks an ephemeral port, or the configured
    /// port range if there is one.
    pub async fn bind(local: Endpoint, config: RemoteConfig) -> Result<(Self, Endpoint)> {
        let network = TokioNetwork::new(config.nodelay);
        Self::bind_with(network, local, config).await
    }
}

impl<N: NetworkProvider> RemoteManager<N> {
    /// Bind using an explicit network provider.
    pub async fn bind_with(
        network: N,
        local: Endpoint,
        config: RemoteConfig,
    ) -> Result<(Self, Endpoint)> {
        let listener = bind_listener(&network, &local, &config).await?;
        let bound = listener
            .local_endpoint()
            .map_err(|source| RemoteError::Bind {
                endpoint: local.clone(),
                source,
            })?;

        let shared = Arc::new(Shared {
            local: bound.clone(),
            config,
            network,
            shutdown: CancellationToken::new(),
            observers: ObserverTable::default(),
            links: DashMap::new(),
            closed: AtomicBool::new(false),
            inbound: AtomicUsize::new(0),
            tasks: TaskTracker::new(),
        });

        shared
            .tasks
            .spawn(accept_loop(Arc::clone(&shared), listener));

        tracing::info!(endpoint = %bound, "Remote manager listening");
        Ok((Self { shared }, bound))
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.shared.local
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.shared.config
    }

    /// Subscribe `observer` to frames arriving from `remote`.
    ///
    /// `remote` is the peer's *listening* endpoint. A port-0 endpoint matches
    /// every port on that host without an exact registration of its own.
    ///
    /// Fails with [`RegistrationError::AlreadyRegistered`](crate::RegistrationError)
    /// if `remote` already has an observer; call
    /// [`unregister_observer`](Self::unregister_observer) first to replace it.
    pub fn register_observer<O>(&self, remote: Endpoint, observer: O) -> Result<()>
    where
        O: Observer<Bytes> + 'static,
    {
        if self.is_closed() {
            return Err(RemoteError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.observers.insert(remote.clone(), tx)?;
        if self.is_closed() {
            self.shared.observers.remove(&remote);
            return Err(RemoteError::Closed);
        }

        tracing::debug!(local = %self.shared.local, remote = %remote, "Registered observer");
        self.shared.tasks.spawn(dispatch(
            remote,
            Arc::new(observer),
            rx,
            self.shared.shutdown.clone(),
        ));
        Ok(())
    }

    /// Remove the observer for `remote`. Frames already queued are still
    /// delivered, then the observer gets `on_completed`.
    pub fn unregister_observer(&self, remote: &Endpoint) -> bool {
        let removed = self.shared.observers.remove(remote);
        if removed {
            tracing::debug!(local = %self.shared.local, remote = %remote, "Unregistered observer");
        }
        removed
    }

    /// Send handle for `remote`; the connection is opened on first send.
    pub fn sender(&self, remote: &Endpoint) -> Result<RemoteSender<N>> {
        self.shared.link(remote)?;
        Ok(RemoteSender::new(remote.clone(), Arc::clone(&self.shared)))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.len()
    }

    /// Destinations with a cached outbound link. Links whose connect failed
    /// are not counted.
    pub fn peer_count(&self) -> usize {
        self.shared.links.len()
    }

    /// Open sockets: connected outbound links plus established inbound links.
    pub fn connection_count(&self) -> usize {
        let outbound = self
            .shared
            .links
            .iter()
            .filter(|link| link.is_connected())
            .count();
        outbound + self.shared.inbound.load(Ordering::Acquire)
    }

    /// Stop all background activity and close every socket.
    ///
    /// Idempotent: later calls return `Ok(())` immediately. Once this starts,
    /// sends fail with [`RemoteError::Closed`] and observers receive nothing
    /// more. Tasks still running after `shutdown_timeout` (typically an
    /// observer blocked inside `on_next`) are logged and left to finish.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(endpoint = %self.shared.local, "Remote manager already closed");
            return Ok(());
        }

        tracing::debug!(endpoint = %self.shared.local, "Closing remote manager");
        self.shared.shutdown.cancel();
        self.shared.observers.clear();

        let links: Vec<_> = self
            .shared
            .links
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.links.clear();
        for link in links {
            link.shutdown().await;
        }

        self.shared.tasks.close();
        if tokio::time::timeout(self.shared.config.shutdown_timeout, self.shared.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                endpoint = %self.shared.local,
                remaining = self.shared.tasks.len(),
                "Background tasks still running after shutdown timeout"
            );
        }

        tracing::info!(endpoint = %self.shared.local, "Remote manager closed");
        Ok(())
    }
}

impl<N: NetworkProvider> Drop for RemoteManager<N> {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(endpoint = %self.shared.local, "Remote manager dropped without close");
            self.shared.shutdown.cancel();
            self.shared.observers.clear();
            self.shared.links.clear();
        }
    }
}

impl<N: NetworkProvider> std::fmt::Debug for RemoteManager<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteManager")
            .field("local", &self.shared.local)
            .field("closed", &self.is_closed())
            .field("observers", &self.observer_count())
            .field("peers", &self.peer_count())
            .finish()
    }
}

async fn bind_listener<N: NetworkProvider>(
    network: &N,
    local: &Endpoint,
    config: &RemoteConfig,
) -> Result<N::Listener> {
    let range = match config.port_range {
        Some(range) if local.is_wildcard_port() => range,
        _ => {
            return network
                .bind(local)
                .await
                .map_err(|source| RemoteError::Bind {
                    endpoint: local.clone(),
                    source,
                });
        }
    };

    let mut last_error = None;
    for port in range.ports() {
        let candidate = local.with_port(port);
        match network.bind(&candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::trace!(endpoint = %candidate, error = %e, "Port unavailable");
                last_error = Some(e);
            }
        }
    }

    Err(RemoteError::Bind {
        endpoint: local.clone(),
        source: last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "empty port range")
        }),
    })
}

async fn accept_loop<N: NetworkProvider>(shared: Arc<Shared<N>>, listener: N::Listener) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = ConnectionId::new();
                tracing::debug!(connection = %id, peer = %peer, "Accepted connection");
                shared
                    .tasks
                    .spawn(receive_loop(Arc::clone(&shared), stream, peer, id));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    tracing::debug!(endpoint = %shared.local, "Accept loop stopped");
}

/// The endpoint frames on this connection are attributed to. An unspecified
/// announced host (listener bound to `0.0.0.0`) is replaced by the address
/// the connection actually came from.
fn resolve_source(hello: &LinkHello, peer: &Endpoint) -> Endpoint {
    if hello.endpoint.is_unspecified() {
        Endpoint::new(peer.host(), hello.endpoint.port())
    } else {
        hello.endpoint.clone()
    }
}

struct InboundGuard<'a>(&'a AtomicUsize);

impl<'a> InboundGuard<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for InboundGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn receive_loop<N: NetworkProvider>(
    shared: Arc<Shared<N>>,
    stream: N::Stream,
    peer: Endpoint,
    id: ConnectionId,
) {
    let mut framed = FramedRead::new(
        stream,
        JsonCodec::<LinkHello>::new(shared.config.max_frame_length),
    );

    let hello = tokio::select! {
        biased;
        _ = shared.shutdown.cancelled() => return,
        hello = tokio::time::timeout(shared.config.handshake_timeout, framed.next()) => hello,
    };

    let hello = match hello {
        Ok(Some(Ok(hello))) => hello,
        Ok(Some(Err(e))) => {
            tracing::warn!(connection = %id, peer = %peer, error = %e, "Rejected connection: bad handshake");
            return;
        }
        Ok(None) => {
            tracing::debug!(connection = %id, peer = %peer, "Connection closed before handshake");
            return;
        }
        Err(_) => {
            tracing::warn!(connection = %id, peer = %peer, "Rejected connection: handshake timed out");
            return;
        }
    };

    if hello.version != LINK_VERSION {
        tracing::warn!(
            connection = %id,
            peer = %peer,
            version = hello.version,
            "Rejected connection: unsupported link version"
        );
        return;
    }

    let source = resolve_source(&hello, &peer);
    tracing::debug!(connection = %id, source = %source, "Inbound link established");
    let _inbound = InboundGuard::new(&shared.inbound);

    let mut frames = framed.map_decoder(JsonCodec::into_inner);
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                let size = frame.len();
                if !shared.observers.deliver(&source, frame.freeze()) {
                    tracing::debug!(connection = %id, source = %source, size, "No observer for frame, dropping");
                }
            }
            Some(Err(e)) => {
                tracing::warn!(connection = %id, source = %source, error = %e, "Receive failed, closing connection");
                shared
                    .observers
                    .fail(&source, RemoteError::connection(&source, e));
                break;
            }
            None => {
                tracing::debug!(connection = %id, source = %source, "Peer closed connection");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::observer::observer_fn;
    use crate::protocol::{Message, MessageInstance, MessageRouter, ProtocolSerializer};
    use crate::transport::codec::frame_codec;

    const WAIT: Duration = Duration::from_secs(5);

    async fn manager() -> (RemoteManager, Endpoint) {
        RemoteManager::bind(Endpoint::loopback(), RemoteConfig::default())
            .await
            .unwrap()
    }

    fn channel() -> (
        mpsc::UnboundedSender<Bytes>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        mpsc::unbounded_channel()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("observer channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Bytes>) {
        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err(), "unexpected frame: {got:?}");
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestMessage {
        number: i32,
        data: String,
    }

    impl Message for TestMessage {
        const KIND: &'static str = "tests.message.TestMessage";
    }

    #[tokio::test]
    async fn two_way_exchange() {
        let serializer = ProtocolSerializer::builder()
            .register::<TestMessage>()
            .build()
            .unwrap();

        let (a, a_ep) = manager().await;
        let (b, b_ep) = manager().await;

        let (a_tx, mut a_rx) = channel();
        let (b_tx, mut b_rx) = channel();
        a.register_observer(b_ep.clone(), a_tx).unwrap();
        b.register_observer(a_ep.clone(), b_tx).unwrap();

        let first = TestMessage {
            number: 12,
            data: "The first string".to_string(),
        };
        let second = TestMessage {
            number: 25,
            data: "The second string".to_string(),
        };

        a.sender(&b_ep)
            .unwrap()
            .send(serializer.write(&first, 1).unwrap())
            .await
            .unwrap();
        b.sender(&a_ep)
            .unwrap()
            .send(serializer.write(&second, 2).unwrap())
            .await
            .unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<MessageInstance<TestMessage>>();
        let router = MessageRouter::new().subscribe::<TestMessage, _>(seen_tx);

        serializer.read(&recv(&mut b_rx).await, &router).unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), MessageInstance::new(1, first));

        serializer.read(&recv(&mut a_rx).await, &router).unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), MessageInstance::new(2, second));

        assert_quiet(&mut a_rx).await;
        assert_quiet(&mut b_rx).await;
        assert_eq!(a.connection_count(), 2);
        assert_eq!(a.peer_count(), 1);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn wildcard_registration_matches_any_port_on_host() {
        let (a, a_ep) = manager().await;
        let (b, b_ep) = manager().await;

        let (tx, mut rx) = channel();
        b.register_observer(a_ep.to_wildcard(), tx).unwrap();

        a.sender(&b_ep).unwrap().send(&b"hi"[..]).await.unwrap();
        assert_eq!(recv(&mut rx).await.as_ref(), b"hi");

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (a, a_ep) = manager().await;
        let (b, b_ep) = manager().await;
        let (tx, mut rx) = channel();
        b.register_observer(a_ep, tx).unwrap();

        let sender = a.sender(&b_ep).unwrap();
        for trial in 0..5u32 {
            for i in 0..50u32 {
                sender
                    .send(Bytes::from(format!("{trial}:{i}")))
                    .await
                    .unwrap();
            }
            for i in 0..50u32 {
                assert_eq!(recv(&mut rx).await, Bytes::from(format!("{trial}:{i}")));
            }
        }

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sends_on_one_handle_keep_each_task_ordered() {
        let (a, a_ep) = manager().await;
        let (b, b_ep) = manager().await;
        let (tx, mut rx) = channel();
        b.register_observer(a_ep, tx).unwrap();

        let sender = a.sender(&b_ep).unwrap();
        let mut tasks = Vec::new();
        for task in 0..4u32 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    sender.send(Bytes::from(format!("{task}:{i}"))).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let mut next = [0u32; 4];
        for _ in 0..100 {
            let frame = recv(&mut rx).await;
            let text = String::from_utf8(frame.to_vec()).unwrap();
            let (task, i) = text.split_once(':').unwrap();
            let (task, i): (usize, u32) = (task.parse().unwrap(), i.parse().unwrap());
            assert_eq!(i, next[task]);
            next[task] += 1;
        }

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn observers_are_isolated_by_endpoint() {
        let (hub, hub_ep) = manager().await;
        let (x, x_ep) = manager().await;
        let (y, y_ep) = manager().await;

        let (x_tx, mut x_rx) = channel();
        let (y_tx, mut y_rx) = channel();
        hub.register_observer(x_ep.clone(), x_tx).unwrap();
        hub.register_observer(y_ep.clone(), y_tx).unwrap();
        assert_eq!(hub.observer_count(), 2);

        x.sender(&hub_ep).unwrap().send(&b"from-x"[..]).await.unwrap();
        assert_eq!(recv(&mut x_rx).await.as_ref(), b"from-x");
        assert_quiet(&mut y_rx).await;

        y.sender(&hub_ep).unwrap().send(&b"from-y"[..]).await.unwrap();
        assert_eq!(recv(&mut y_rx).await.as_ref(), b"from-y");
        assert_quiet(&mut x_rx).await;

        for m in [hub, x, y] {
            m.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (m, _) = manager().await;
        let peer = Endpoint::new("127.0.0.1", 4000);
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        m.register_observer(peer.clone(), tx1).unwrap();
        let err = m.register_observer(peer.clone(), tx2).unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Registration(crate::RegistrationError::AlreadyRegistered(ref ep)) if *ep == peer
        ));

        assert!(m.unregister_observer(&peer));
        let (tx3, _rx3) = channel();
        m.register_observer(peer, tx3).unwrap();

        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn unregister_completes_observer() {
        let (m, _) = manager().await;
        let peer = Endpoint::new("127.0.0.1", 4001);
        let completed = Arc::new(tokio::sync::Notify::new());

        struct Completes(Arc<tokio::sync::Notify>);
        impl Observer<Bytes> for Completes {
            fn on_next(&self, _: Bytes) {}
            fn on_completed(&self) {
                self.0.notify_one();
            }
        }

        m.register_observer(peer.clone(), Completes(Arc::clone(&completed)))
            .unwrap();
        assert!(m.unregister_observer(&peer));
        tokio::time::timeout(WAIT, completed.notified())
            .await
            .expect("observer not completed");

        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_fails_and_observers_go_silent() {
        let (a, a_ep) = manager().await;
        let (b, b_ep) = manager().await;

        let (tx, mut rx) = channel();
        a.register_observer(b_ep.clone(), tx).unwrap();
        let a_sender = a.sender(&b_ep).unwrap();
        let b_sender = b.sender(&a_ep).unwrap();

        b_sender.send(&b"before"[..]).await.unwrap();
        assert_eq!(recv(&mut rx).await.as_ref(), b"before");

        a.close().await.unwrap();
        assert!(a.is_closed());

        let err = a_sender.send(&b"nope"[..]).await.unwrap_err();
        assert!(err.is_closed());
        assert!(a.sender(&b_ep).unwrap_err().is_closed());
        let (tx2, _rx2) = channel();
        assert!(a.register_observer(b_ep.clone(), tx2).unwrap_err().is_closed());

        // B may or may not notice the dead peer on the first write.
        let _ = b_sender.send(&b"after"[..]).await;
        let _ = b_sender.send(&b"after again"[..]).await;
        let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(
            !matches!(got, Ok(Some(_))),
            "closed manager delivered a frame"
        );

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_observer_does_not_block_other_peers() {
        let (hub, hub_ep) = manager().await;
        let (slow_peer, slow_ep) = manager().await;
        let (fast_peer, fast_ep) = manager().await;

        let gate = Arc::new(std::sync::Barrier::new(2));
        let slow_gate = Arc::clone(&gate);
        let slow_seen = Arc::new(Mutex::new(0usize));
        let slow_count = Arc::clone(&slow_seen);
        hub.register_observer(
            slow_ep,
            observer_fn(move |_: Bytes| {
                // Block the first delivery until the fast path has been checked.
                if *slow_count.lock().unwrap() == 0 {
                    slow_gate.wait();
                }
                *slow_count.lock().unwrap() += 1;
            }),
        )
        .unwrap();

        let (fast_tx, mut fast_rx) = channel();
        hub.register_observer(fast_ep, fast_tx).unwrap();

        slow_peer
            .sender(&hub_ep)
            .unwrap()
            .send(&b"slow"[..])
            .await
            .unwrap();
        fast_peer
            .sender(&hub_ep)
            .unwrap()
            .send(&b"fast"[..])
            .await
            .unwrap();

        assert_eq!(recv(&mut fast_rx).await.as_ref(), b"fast");

        let release = Arc::clone(&gate);
        tokio::task::spawn_blocking(move || release.wait())
            .await
            .unwrap();

        for m in [hub, slow_peer, fast_peer] {
            m.close().await.unwrap();
        }
        assert_eq!(*slow_seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn connection_failure_is_retryable_and_next_send_reconnects() {
        let (a, _) = manager().await;
        let (b, b_ep) = manager().await;
        let sender = a.sender(&b_ep).unwrap();
        sender.send(&b"one"[..]).await.unwrap();
        assert!(sender.is_connected());

        b.close().await.unwrap();
        drop(b);

        let mut saw_error = false;
        for _ in 0..20 {
            match sender.send(&b"into the void"[..]).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => {
                    assert!(e.is_retryable(), "unexpected error: {e}");
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error, "writes to a closed peer never failed");
        assert!(!sender.is_connected());

        // Same address, new manager: the next send dials afresh.
        let (c, c_ep) = RemoteManager::bind(b_ep.clone(), RemoteConfig::default())
            .await
            .unwrap();
        assert_eq!(c_ep, b_ep);
        let (tx, mut rx) = channel();
        c.register_observer(a.local_endpoint().clone(), tx).unwrap();
        sender.send(&b"again"[..]).await.unwrap();
        assert_eq!(recv(&mut rx).await.as_ref(), b"again");

        a.close().await.unwrap();
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_connection_error() {
        let (a, _) = manager().await;
        let (gone, gone_ep) = manager().await;
        gone.close().await.unwrap();
        drop(gone);

        let err = a.sender(&gone_ep).unwrap().send(&b"x"[..]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Connection { ref endpoint, .. } if *endpoint == gone_ep));
        assert!(err.is_retryable());
        assert_eq!(a.peer_count(), 0, "failed link should be evicted");

        let again = a.sender(&gone_ep).unwrap().send(&b"y"[..]).await.unwrap_err();
        assert!(again.is_retryable());
        assert_eq!(a.peer_count(), 0);

        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_sending() {
        let config = RemoteConfig {
            max_frame_length: 16,
            ..RemoteConfig::default()
        };
        let (a, _) = RemoteManager::bind(Endpoint::loopback(), config).await.unwrap();
        let (b, b_ep) = manager().await;

        let err = a
            .sender(&b_ep)
            .unwrap()
            .send(vec![0u8; 17])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::FrameTooLarge { size: 17, max: 16 }));
        assert!(!a.sender(&b_ep).unwrap().is_connected());

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_inbound_frame_reports_error_and_manager_survives() {
        let config = RemoteConfig {
            max_frame_length: 128,
            ..RemoteConfig::default()
        };
        let (small, small_ep) = RemoteManager::bind(Endpoint::loopback(), config)
            .await
            .unwrap();
        let (big, big_ep) = manager().await;

        let errors = Arc::new(Mutex::new(Vec::new()));
        struct Errors(Arc<Mutex<Vec<String>>>, mpsc::UnboundedSender<Bytes>);
        impl Observer<Bytes> for Errors {
            fn on_next(&self, value: Bytes) {
                let _ = self.1.send(value);
            }
            fn on_error(&self, error: &RemoteError) {
                self.0.lock().unwrap().push(error.to_string());
                let _ = self.1.send(Bytes::from_static(b"<error>"));
            }
        }
        let (tx, mut rx) = channel();
        small
            .register_observer(big_ep.clone(), Errors(Arc::clone(&errors), tx))
            .unwrap();

        let sender = big.sender(&small_ep).unwrap();
        sender.send(vec![7u8; 500]).await.unwrap();
        assert_eq!(recv(&mut rx).await.as_ref(), b"<error>");
        assert_eq!(errors.lock().unwrap().len(), 1);

        // A fresh connection from another manager still works.
        let (other, other_ep) = manager().await;
        let (tx2, mut rx2) = channel();
        small.register_observer(other_ep, tx2).unwrap();
        other.sender(&small_ep).unwrap().send(&b"ok"[..]).await.unwrap();
        assert_eq!(recv(&mut rx2).await.as_ref(), b"ok");

        for m in [small, big, other] {
            m.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn garbage_handshake_is_dropped() {
        let (m, m_ep) = manager().await;
        let (tx, mut rx) = channel();
        m.register_observer(Endpoint::loopback(), tx).unwrap();

        let mut raw = TcpStream::connect((m_ep.host(), m_ep.port())).await.unwrap();
        let mut buf = tokio_util::bytes::BytesMut::new();
        tokio_util::codec::Encoder::encode(
            &mut frame_codec(1024),
            Bytes::from_static(b"not json"),
            &mut buf,
        )
        .unwrap();
        raw.write_all(&buf).await.unwrap();

        assert_quiet(&mut rx).await;
        assert!(!m.is_closed());
        m.close().await.unwrap();
    }

    #[test]
    fn unspecified_announcement_uses_socket_address() {
        let hello = LinkHello::new(Endpoint::new("0.0.0.0", 7100));
        let peer = Endpoint::new("192.168.1.20", 53124);
        assert_eq!(
            resolve_source(&hello, &peer),
            Endpoint::new("192.168.1.20", 7100)
        );

        let hello = LinkHello::new(Endpoint::new("10.0.0.5", 7100));
        assert_eq!(resolve_source(&hello, &peer), Endpoint::new("10.0.0.5", 7100));
    }

    #[tokio::test]
    async fn port_range_binding_skips_taken_ports() {
        let (first, first_ep) = manager().await;
        let taken = first_ep.port();
        let range = crate::TcpPortRange::new(taken, 50, 50);

        let config = RemoteConfig::default().with_port_range(range);
        let (second, second_ep) = RemoteManager::bind(Endpoint::loopback(), config)
            .await
            .unwrap();
        assert_ne!(second_ep.port(), taken);
        assert!(second_ep.port() > taken && second_ep.port() < taken.saturating_add(50));

        let exhausted = RemoteConfig::default().with_port_range(crate::TcpPortRange::new(taken, 1, 1));
        let err = RemoteManager::bind(Endpoint::loopback(), exhausted)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Bind { .. }));

        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_without_close_stops_listener_and_observers() {
        let (peer, peer_ep) = manager().await;
        let (m, m_ep) = manager().await;
        let (old_tx, mut old_rx) = channel();
        m.register_observer(peer_ep.clone(), old_tx).unwrap();
        drop(m);

        // The accept loop releases the port once it sees the cancellation.
        let mut rebound = None;
        for _ in 0..100 {
            match RemoteManager::bind(m_ep.clone(), RemoteConfig::default()).await {
                Ok(bound) => {
                    rebound = Some(bound);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let (c, c_ep) = rebound.expect("port never released after drop");
        assert_eq!(c_ep, m_ep);

        let (new_tx, mut new_rx) = channel();
        c.register_observer(peer_ep, new_tx).unwrap();
        peer.sender(&c_ep).unwrap().send(&b"hello"[..]).await.unwrap();
        assert_eq!(recv(&mut new_rx).await.as_ref(), b"hello");

        let got = tokio::time::timeout(Duration::from_millis(200), old_rx.recv()).await;
        assert!(
            !matches!(got, Ok(Some(_))),
            "dropped manager delivered a frame"
        );

        peer.close().await.unwrap();
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_handshake_timeout() {
        let config = RemoteConfig {
            handshake_timeout: Duration::from_millis(100),
            ..RemoteConfig::default()
        };
        let (m, m_ep) = RemoteManager::bind(Endpoint::loopback(), config)
            .await
            .unwrap();

        let mut silent = TcpStream::connect((m_ep.host(), m_ep.port())).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, silent.read(&mut buf))
            .await
            .expect("connection without a hello was kept open");
        assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {read:?}");
        assert_eq!(m.connection_count(), 0);

        let (peer, peer_ep) = manager().await;
        let (tx, mut rx) = channel();
        m.register_observer(peer_ep, tx).unwrap();
        peer.sender(&m_ep).unwrap().send(&b"late"[..]).await.unwrap();
        assert_eq!(recv(&mut rx).await.as_ref(), b"late");

        peer.close().await.unwrap();
        m.close().await.unwrap();
    }

    /// TCP listener whose outbound connects never complete.
    #[derive(Clone, Default)]
    struct StalledConnect(TokioNetwork);

    #[async_trait::async_trait]
    impl NetworkProvider for StalledConnect {
        type Stream = TcpStream;
        type Listener = crate::transport::TokioListener;

        async fn bind(&self, endpoint: &Endpoint) -> std::io::Result<Self::Listener> {
            self.0.bind(endpoint).await
        }

        async fn connect(&self, _endpoint: &Endpoint) -> std::io::Result<TcpStream> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_connect_times_out_as_retryable_error() {
        let config = RemoteConfig {
            connect_timeout: Duration::from_millis(100),
            ..RemoteConfig::default()
        };
        let (m, _) = RemoteManager::bind_with(StalledConnect::default(), Endpoint::loopback(), config)
            .await
            .unwrap();

        let target = Endpoint::new("127.0.0.1", 9);
        let sender = m.sender(&target).unwrap();
        let err = tokio::time::timeout(WAIT, sender.send(&b"x"[..]))
            .await
            .expect("connect timeout not applied")
            .unwrap_err();

        assert!(err.is_retryable());
        match &err {
            RemoteError::Connection { endpoint, source } => {
                assert_eq!(*endpoint, target);
                assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
            }
            other => panic!("expected connection error, got {other:?}"),
        }
        assert!(!sender.is_connected());
        assert_eq!(m.peer_count(), 0);

        m.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn registrations_racing_close_leave_nothing_behind() {
        for _ in 0..20 {
            let (m, _) = manager().await;
            let m = Arc::new(m);

            let mut tasks = Vec::new();
            for i in 0..8u16 {
                let m = Arc::clone(&m);
                tasks.push(tokio::spawn(async move {
                    let peer = Endpoint::new("127.0.0.1", 5000 + i);
                    let (tx, _rx) = channel();
                    let _ = m.register_observer(peer.clone(), tx);
                    let _ = m.sender(&peer);
                }));
            }
            m.close().await.unwrap();
            for t in tasks {
                t.await.unwrap();
            }

            assert_eq!(m.observer_count(), 0);
            assert_eq!(m.peer_count(), 0);
            assert!(m.sender(&Endpoint::new("127.0.0.1", 5000)).unwrap_err().is_closed());
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (m, _) = manager().await;
        m.close().await.unwrap();
        m.close().await.unwrap();
        assert!(m.is_closed());
    }
}
