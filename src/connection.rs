//! A duplex link to one peer.
//!
//! [`Connection`] is transport-agnostic: the reader/writer tasks are
//! generic over any `AsyncRead + AsyncWrite` stream, so the same code
//! drives a real TCP socket or the in-memory [`tokio::io::duplex`] pair
//! used by tests. Dispatch on message *type* is the engine's job, not
//! this layer's.

use {
  crate::{codec::Codec, error::Error, wire::Message},
  asynchronous_codec::{Decoder, Encoder},
  bytes::BytesMut,
  std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, Notify},
  },
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Events a connection's background tasks report up to whoever spawned
/// it (always the [`crate::conn_manager::ConnManager`]).
#[derive(Clone)]
pub(crate) enum ConnEvent {
  MessageReceived(Connection, Message),
  Disconnected(Connection),
}

struct Inner {
  address: String,
  outbound: mpsc::UnboundedSender<Message>,
  shutdown: Notify,
  closed: AtomicBool,
}

/// A live link to one peer. Cheap to clone - all clones refer to the
/// same underlying socket and reader/writer tasks.
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl PartialEq for Connection {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}
impl Eq for Connection {}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("address", &self.0.address)
      .finish()
  }
}

impl Connection {
  /// Wraps `stream` as a connection to `address`, spawning its reader
  /// and writer tasks. Every fully-decoded inbound message and the
  /// (at-most-one) disconnect event are reported on `events`.
  pub(crate) fn spawn<S>(
    stream: S,
    address: String,
    events: mpsc::UnboundedSender<ConnEvent>,
  ) -> Connection
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let inner = Arc::new(Inner {
      address,
      outbound: outbound_tx,
      shutdown: Notify::new(),
      closed: AtomicBool::new(false),
    });
    let conn = Connection(inner);

    tokio::spawn(reader_task(conn.clone(), read_half, events.clone()));
    tokio::spawn(writer_task(conn.clone(), write_half, outbound_rx, events));

    conn
  }

  pub fn address(&self) -> &str {
    &self.0.address
  }

  /// Enqueues `msg` for delivery. Frames are written in the order this
  /// is called and each frame is written atomically; ordering and
  /// atomicity fall out of there being exactly one writer task draining
  /// a FIFO channel.
  pub fn send(&self, msg: Message) -> Result<(), Error> {
    self
      .0
      .outbound
      .send(msg)
      .map_err(|_| Error::ConnectionNotFound)
  }

  /// Closes the link. Idempotent - only the first call produces a
  /// disconnect event, later calls (or a concurrent transport failure)
  /// are no-ops.
  pub fn disconnect(&self) {
    if !self.0.closed.swap(true, Ordering::SeqCst) {
      self.0.shutdown.notify_waiters();
    }
  }

  fn is_closed(&self) -> bool {
    self.0.closed.load(Ordering::SeqCst)
  }
}

async fn reader_task<R: AsyncRead + Unpin>(
  conn: Connection,
  mut read_half: R,
  events: mpsc::UnboundedSender<ConnEvent>,
) {
  let mut codec = Codec;
  let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

  loop {
    let read = tokio::select! {
      biased;
      _ = conn.0.shutdown.notified() => break,
      read = read_half.read_buf(&mut buf) => read,
    };

    match read {
      Ok(0) => {
        tracing::debug!(address = conn.address(), "connection reached eof");
        break;
      }
      Ok(_) => loop {
        match Decoder::decode(&mut codec, &mut buf) {
          Ok(Some(msg)) => {
            let _ =
              events.send(ConnEvent::MessageReceived(conn.clone(), msg));
          }
          Ok(None) => break,
          Err(err) => {
            tracing::warn!(
              address = conn.address(),
              %err,
              "dropping malformed frame, connection stays open"
            );
            break;
          }
        }
      },
      Err(err) => {
        tracing::debug!(
          address = conn.address(),
          %err,
          "read failed, treating as disconnect"
        );
        break;
      }
    }
  }

  fire_disconnect(&conn, &events);
}

async fn writer_task<W: AsyncWrite + Unpin>(
  conn: Connection,
  mut write_half: W,
  mut outbound: mpsc::UnboundedReceiver<Message>,
  events: mpsc::UnboundedSender<ConnEvent>,
) {
  let codec = Codec;

  loop {
    let msg = tokio::select! {
      biased;
      _ = conn.0.shutdown.notified() => break,
      msg = outbound.recv() => match msg {
        Some(msg) => msg,
        None => break,
      },
    };

    let frame = match codec.encode_frame(&msg) {
      Ok(frame) => frame,
      Err(err) => {
        tracing::warn!(%err, "failed to encode outbound message, skipping");
        continue;
      }
    };

    if let Err(err) = write_half.write_all(&frame).await {
      tracing::debug!(
        address = conn.address(),
        %err,
        "write failed, treating as disconnect"
      );
      break;
    }
  }

  let _ = write_half.shutdown().await;
  fire_disconnect(&conn, &events);
}

fn fire_disconnect(
  conn: &Connection,
  events: &mpsc::UnboundedSender<ConnEvent>,
) {
  if !conn.is_closed() {
    conn.disconnect();
  }
  let _ = events.send(ConnEvent::Disconnected(conn.clone()));
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::wire::{Disconnect, Join},
  };

  async fn memory_pair() -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    (
      Connection::spawn(a, "mem-a".into(), tx_a),
      Connection::spawn(b, "mem-b".into(), tx_b),
    )
  }

  #[tokio::test]
  async fn delivers_messages_in_order() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let conn_a = Connection::spawn(a, "a".into(), tx_a);
    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let conn_b = Connection::spawn(b, "b".into(), tx_b);

    conn_b
      .send(Message::Join(Join {
        node_id: "x".into(),
        listen_address: "x:1".into(),
      }))
      .unwrap();
    conn_b
      .send(Message::Disconnect(Disconnect {
        node_id: "x".into(),
      }))
      .unwrap();

    let first = rx_a.recv().await.unwrap();
    let second = rx_a.recv().await.unwrap();
    assert!(matches!(
      first,
      ConnEvent::MessageReceived(_, Message::Join(_))
    ));
    assert!(matches!(
      second,
      ConnEvent::MessageReceived(_, Message::Disconnect(_))
    ));

    let _ = conn_a;
  }

  #[tokio::test]
  async fn disconnect_fires_exactly_once() {
    let (conn_a, _conn_b) = memory_pair().await;
    conn_a.disconnect();
    conn_a.disconnect();
    conn_a.disconnect();
    // no panic, no double-notify; is_closed latches after the first call.
    assert!(conn_a.is_closed());
  }
}
