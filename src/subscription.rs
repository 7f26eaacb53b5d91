//! Event fan-out with cancellable subscriptions.
//!
//! Each call to [`Channel::subscribe`] spawns a dedicated worker task that
//! owns its own bounded mailbox; a slow handler backs up only its own
//! queue, never the publisher or other subscribers.

use tokio::sync::{mpsc, oneshot};

/// Bounded so a stalled subscriber applies backpressure to itself, not
/// to the publisher or its siblings.
const SUBSCRIBER_QUEUE_SIZE: usize = 256;

/// A single handler registered on one event stream. Dropping this value
/// does *not* cancel the handler - call [`Subscription::unsubscribe`]
/// explicitly, matching the source's channel-based cancellation.
pub struct Subscription {
  cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
  /// Cancels delivery to this handler. Idempotent: calling it more than
  /// once, or after the worker has already exited, is a no-op.
  pub fn unsubscribe(mut self) {
    if let Some(cancel) = self.cancel.take() {
      let _ = cancel.send(());
    }
  }
}

/// A multi-subscriber event bus for a single event type `T`.
///
/// `publish` never blocks the caller on a slow subscriber: it attempts a
/// non-blocking send per subscriber and drops the event for any
/// subscriber whose queue is full, logging the fact.
#[derive(Clone)]
pub struct Channel<T> {
  subscribers: std::sync::Arc<parking_lot::Mutex<Vec<mpsc::Sender<T>>>>,
}

impl<T> Default for Channel<T> {
  fn default() -> Self {
    Self {
      subscribers: Default::default(),
    }
  }
}

impl<T> Channel<T>
where
  T: Clone + Send + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `handler` to be invoked once per published event, on a
  /// dedicated worker task, until the returned [`Subscription`] is
  /// cancelled.
  pub fn subscribe<F>(&self, mut handler: F) -> Subscription
  where
    F: FnMut(T) + Send + 'static,
  {
    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
    let (cancel_tx, mut cancel_rx) = oneshot::channel();

    self.subscribers.lock().push(tx);

    tokio::spawn(async move {
      loop {
        tokio::select! {
          biased;
          _ = &mut cancel_rx => return,
          event = rx.recv() => {
            match event {
              Some(event) => handler(event),
              None => return,
            }
          }
        }
      }
    });

    Subscription {
      cancel: Some(cancel_tx),
    }
  }

  /// Fans `event` out to every live subscriber. A subscriber with a full
  /// queue has the event dropped for it rather than stalling the others.
  pub fn publish(&self, event: T) {
    let mut subscribers = self.subscribers.lock();
    subscribers.retain(|tx| {
      match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
          tracing::warn!("subscriber queue full, dropping event for it");
          true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use {super::*, std::sync::atomic::{AtomicUsize, Ordering}};

  #[tokio::test]
  async fn delivers_to_every_subscriber_until_cancelled() {
    let channel: Channel<u32> = Channel::new();
    let count_a = std::sync::Arc::new(AtomicUsize::new(0));
    let count_b = std::sync::Arc::new(AtomicUsize::new(0));

    let ca = count_a.clone();
    let sub_a = channel.subscribe(move |_| {
      ca.fetch_add(1, Ordering::SeqCst);
    });
    let cb = count_b.clone();
    let _sub_b = channel.subscribe(move |_| {
      cb.fetch_add(1, Ordering::SeqCst);
    });

    channel.publish(1);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 1);

    sub_a.unsubscribe();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    channel.publish(2);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 2);
  }
}
