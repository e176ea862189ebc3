//! Inbound observer table and per-subscription dispatch.
//!
//! Receive loops never call observers directly: they push into the
//! subscription's queue and move on, and a dispatch task drains the queue into
//! the observer. A slow observer therefore only backs up its own queue.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::{RegistrationError, RemoteError};
use crate::observer::Observer;

pub(crate) enum Inbound {
    Frame(Bytes),
    Error(RemoteError),
}

pub(crate) type InboundSender = mpsc::UnboundedSender<Inbound>;

/// Registered observers keyed by remote endpoint.
///
/// A port-0 key is a host wildcard, consulted only when no exact key matches.
#[derive(Default)]
pub(crate) struct ObserverTable {
    subscriptions: DashMap<Endpoint, InboundSender>,
}

impl ObserverTable {
    /// Reject-on-conflict: the existing observer stays registered.
    pub(crate) fn insert(
        &self,
        endpoint: Endpoint,
        tx: InboundSender,
    ) -> Result<(), RegistrationError> {
        match self.subscriptions.entry(endpoint) {
            Entry::Occupied(existing) => {
                Err(RegistrationError::AlreadyRegistered(existing.key().clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, endpoint: &Endpoint) -> bool {
        self.subscriptions.remove(endpoint).is_some()
    }

    /// Queue for frames from `source`, cloned so no map guard outlives the call.
    pub(crate) fn lookup(&self, source: &Endpoint) -> Option<InboundSender> {
        if let Some(tx) = self.subscriptions.get(source) {
            return Some(tx.clone());
        }
        if source.is_wildcard_port() {
            return None;
        }
        self.subscriptions
            .get(&source.to_wildcard())
            .map(|tx| tx.clone())
    }

    /// Hand a frame to the observer for `source`. Returns false if nobody is
    /// registered or the subscription just ended.
    pub(crate) fn deliver(&self, source: &Endpoint, frame: Bytes) -> bool {
        match self.lookup(source) {
            Some(tx) => tx.send(Inbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn fail(&self, source: &Endpoint, error: RemoteError) -> bool {
        match self.lookup(source) {
            Some(tx) => tx.send(Inbound::Error(error)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        self.subscriptions.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Drain one subscription's queue into its observer.
///
/// Stops without further callbacks once `shutdown` fires. When the queue's
/// senders are all gone (unregistered), the observer gets `on_completed`.
pub(crate) async fn dispatch(
    endpoint: Endpoint,
    observer: Arc<dyn Observer<Bytes>>,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => next,
        };

        if shutdown.is_cancelled() {
            break;
        }

        match next {
            Some(Inbound::Frame(frame)) => observer.on_next(frame),
            Some(Inbound::Error(error)) => observer.on_error(&error),
            None => {
                tracing::debug!(endpoint = %endpoint, "Observer unregistered");
                observer.on_completed();
                return;
            }
        }
    }

    tracing::trace!(endpoint = %endpoint, "Dispatch stopped by shutdown");
}
