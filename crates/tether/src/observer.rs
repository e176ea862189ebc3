//! Push-based subscriber capability.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::RemoteError;

/// Receives pushed values.
///
/// Callbacks run on a dispatch task owned by whoever delivers to the observer,
/// one value at a time and in arrival order. A slow `on_next` only delays
/// its own subscription.
pub trait Observer<T>: Send + Sync {
    fn on_next(&self, value: T);

    /// A failure on the stream feeding this observer. The stream may continue.
    fn on_error(&self, error: &RemoteError) {
        tracing::warn!(error = %error, "Unhandled observer error");
    }

    /// The subscription ended normally; no further callbacks follow.
    fn on_completed(&self) {}
}

impl<T, O: Observer<T> + ?Sized> Observer<T> for Arc<O> {
    fn on_next(&self, value: T) {
        (**self).on_next(value)
    }

    fn on_error(&self, error: &RemoteError) {
        (**self).on_error(error)
    }

    fn on_completed(&self) {
        (**self).on_completed()
    }
}

/// Forwards values into a channel; a closed receiver drops them.
impl<T: Send> Observer<T> for mpsc::UnboundedSender<T> {
    fn on_next(&self, value: T) {
        if self.send(value).is_err() {
            tracing::trace!("Observer channel closed, dropping value");
        }
    }
}

/// Observer built from a closure; see [`observer_fn`].
pub struct FnObserver<F, T> {
    f: F,
    _phantom: PhantomData<fn(T)>,
}

/// Wrap `f` as an observer whose `on_next` calls it.
pub fn observer_fn<T, F>(f: F) -> FnObserver<F, T>
where
    F: Fn(T) + Send + Sync,
{
    FnObserver {
        f,
        _phantom: PhantomData,
    }
}

impl<T, F> Observer<T> for FnObserver<F, T>
where
    F: Fn(T) + Send + Sync,
{
    fn on_next(&self, value: T) {
        (self.f)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closure_observer_receives_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = observer_fn(move |v: u32| sink.lock().unwrap().push(v));

        observer.on_next(1);
        observer.on_next(2);
        observer.on_completed();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn channel_observer_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.on_next("a");
        assert_eq!(rx.try_recv().unwrap(), "a");

        drop(rx);
        tx.on_next("b");
    }

    #[test]
    fn arc_observer_delegates() {
        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
        let shared = Arc::new(tx);
        Observer::on_next(&shared, 7);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }
}
