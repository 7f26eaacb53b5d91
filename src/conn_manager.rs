//! Owns every live [`Connection`] and fans out connection and message
//! events to whoever is interested.
//!
//! A single background task serializes registry mutation: every accept,
//! dial, and disconnect funnels through the same `events` channel, so
//! "a connection going down" can never race "that same connection being
//! inserted as newly up".

use {
  crate::{
    connection::{ConnEvent, Connection},
    error::Error,
    subscription::{Channel, Subscription},
    wire::Message,
  },
  metrics::{decrement_gauge, increment_counter, increment_gauge},
  std::{collections::HashMap, sync::Arc},
  tokio::net::{TcpListener, TcpStream},
};

type Registry = Arc<parking_lot::Mutex<HashMap<String, Connection>>>;

/// Manages inbound and outbound TCP connections for one node.
#[derive(Clone)]
pub struct ConnManager {
  registry: Registry,
  events_tx: tokio::sync::mpsc::UnboundedSender<ConnEvent>,
  connection_up: Channel<Connection>,
  connection_down: Channel<Connection>,
  messages: Channel<(Connection, Message)>,
}

impl ConnManager {
  pub fn new() -> Self {
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = Self {
      registry: Default::default(),
      events_tx,
      connection_up: Channel::new(),
      connection_down: Channel::new(),
      messages: Channel::new(),
    };
    tokio::spawn(manager.clone().run_event_loop(events_rx));
    manager
  }

  async fn run_event_loop(
    self,
    mut events_rx: tokio::sync::mpsc::UnboundedReceiver<ConnEvent>,
  ) {
    while let Some(event) = events_rx.recv().await {
      match event {
        ConnEvent::MessageReceived(conn, msg) => {
          self.messages.publish((conn, msg));
        }
        ConnEvent::Disconnected(conn) => {
          let removed = {
            let mut registry = self.registry.lock();
            let present = registry
              .get(conn.address())
              .map(|existing| *existing == conn)
              .unwrap_or(false);
            if present {
              registry.remove(conn.address());
            }
            present
          };
          if removed {
            tracing::debug!(address = conn.address(), "connection down");
            decrement_gauge!("hyparview_connections_active", 1.0);
            increment_counter!("hyparview_connections_closed_total");
            self.connection_down.publish(conn);
          }
        }
      }
    }
  }

  /// Accepts inbound connections on `address` until the process exits.
  /// Spawns one task per listener; call once per node. Returns the
  /// address actually bound, which differs from `address` whenever the
  /// caller asks for an ephemeral port (`:0`).
  pub async fn listen(&self, address: &str) -> Result<String, Error> {
    let listener = TcpListener::bind(address).await?;
    let bound = listener.local_addr()?.to_string();
    let manager = self.clone();
    tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer_addr)) => {
            manager.register(stream, peer_addr.to_string());
          }
          Err(err) => {
            tracing::warn!(%err, "accept failed, listener still running");
          }
        }
      }
    });
    Ok(bound)
  }

  /// Dials `address`, registering the resulting connection as active.
  pub async fn dial(&self, address: &str) -> Result<Connection, Error> {
    let stream = TcpStream::connect(address).await?;
    Ok(self.register(stream, address.to_string()))
  }

  fn register(&self, stream: TcpStream, address: String) -> Connection {
    let conn =
      Connection::spawn(stream, address.clone(), self.events_tx.clone());
    self.registry.lock().insert(address, conn.clone());
    increment_counter!("hyparview_connections_established_total");
    increment_gauge!("hyparview_connections_active", 1.0);
    self.connection_up.publish(conn.clone());
    conn
  }

  /// Closes the connection to `address`, if one is currently registered.
  pub fn disconnect(&self, address: &str) -> Result<(), Error> {
    let conn = self
      .registry
      .lock()
      .get(address)
      .cloned()
      .ok_or(Error::ConnectionNotFound)?;
    conn.disconnect();
    Ok(())
  }

  pub fn connection(&self, address: &str) -> Option<Connection> {
    self.registry.lock().get(address).cloned()
  }

  pub fn on_connection_up<F>(&self, handler: F) -> Subscription
  where
    F: FnMut(Connection) + Send + 'static,
  {
    self.connection_up.subscribe(handler)
  }

  pub fn on_connection_down<F>(&self, handler: F) -> Subscription
  where
    F: FnMut(Connection) + Send + 'static,
  {
    self.connection_down.subscribe(handler)
  }

  pub fn on_message<F>(&self, handler: F) -> Subscription
  where
    F: FnMut((Connection, Message)) + Send + 'static,
  {
    self.messages.subscribe(handler)
  }
}

impl Default for ConnManager {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::wire::{Join, Message},
    std::sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
  };

  #[tokio::test]
  async fn disconnecting_unknown_address_is_an_error() {
    let manager = ConnManager::new();
    let err = manager.disconnect("127.0.0.1:1").unwrap_err();
    assert!(matches!(err, Error::ConnectionNotFound));
  }

  #[tokio::test]
  async fn loopback_dial_delivers_message_to_server_side() {
    let server = ConnManager::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server_events = server.events_tx.clone();
    let server_registry = server.registry.clone();
    tokio::spawn(async move {
      let (stream, peer) = listener.accept().await.unwrap();
      let conn =
        Connection::spawn(stream, peer.to_string(), server_events);
      server_registry.lock().insert(peer.to_string(), conn);
    });

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let _sub = server.on_message(move |(_, msg)| {
      if matches!(msg, Message::Join(_)) {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    let client = ConnManager::new();
    let conn = client.dial(&addr).await.unwrap();
    conn
      .send(Message::Join(Join {
        node_id: "client".into(),
        listen_address: "127.0.0.1:9999".into(),
      }))
      .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
  }
}
