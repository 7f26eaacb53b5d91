//! The HyParView engine: active/passive view management, message
//! handlers, failure repair, and periodic shuffling.
//!
//! All view mutation happens on a single task (`Actor::run`) that reads
//! a private mailbox. Every public method and every [`ConnManager`]
//! callback only ever *enqueues* onto that mailbox, so the active and
//! passive views never need a lock.

use {
  crate::{
    config::Config,
    conn_manager::ConnManager,
    connection::Connection,
    error::Error,
    node::{Node, Peer},
    subscription::{Channel, Subscription},
    wire::{
      Disconnect,
      ForwardJoin,
      Join,
      Message,
      Neighbor,
      NeighborReply,
      NodeInfo,
      Shuffle,
      ShuffleReply,
    },
  },
  metrics::{gauge, increment_counter},
  rand::{seq::SliceRandom, Rng},
  tokio::sync::{mpsc, oneshot},
};

/// A change to this node's active view, published for diagnostics and
/// for callers that want to react to overlay churn.
#[derive(Debug, Clone)]
pub enum PeerEvent {
  PeerUp(Node),
  PeerDown(Node),
}

enum Command {
  Message(Connection, Message),
  ConnectionDown(Connection),
  PeerJoined(Node, Connection),
  ForwardJoinDialed(Node, Result<Connection, Error>),
  RepairDialed(Node, Result<Connection, Error>, bool),
  ShuffleReplyDialed(ShuffleReply, Result<Connection, Error>),
  Shuffle,
  GetActivePeers(oneshot::Sender<Vec<Node>>),
  GetPassivePeers(oneshot::Sender<Vec<Node>>),
}

#[derive(Default)]
struct State {
  active: Vec<Peer>,
  passive: Vec<Node>,
}

/// A handle to a running membership engine. Cloning it is cheap; every
/// clone talks to the same background actor.
#[derive(Clone)]
pub struct Engine {
  node: Node,
  mailbox: mpsc::UnboundedSender<Command>,
  conns: ConnManager,
  peer_events: Channel<PeerEvent>,
}

impl Engine {
  /// Starts listening on `node.listen_address` and spawns the actor and
  /// shuffle timer. The overlay is empty until [`Engine::join`] is
  /// called (or an inbound `JOIN`/`NEIGHBOR` arrives).
  pub async fn start(node: Node, config: Config) -> Result<Engine, Error> {
    let conns = ConnManager::new();
    let bound_address = conns.listen(&node.listen_address).await?;
    let node = Node {
      id: node.id,
      listen_address: bound_address,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let peer_events = Channel::new();

    let on_message_tx = tx.clone();
    conns.on_message(move |(conn, msg)| {
      let _ = on_message_tx.send(Command::Message(conn, msg));
    });
    let on_down_tx = tx.clone();
    conns.on_connection_down(move |conn| {
      let _ = on_down_tx.send(Command::ConnectionDown(conn));
    });

    let actor = Actor {
      node: node.clone(),
      config: config.clone(),
      conns: conns.clone(),
      self_tx: tx.clone(),
      state: State::default(),
      peer_events: peer_events.clone(),
    };
    tokio::spawn(actor.run(rx));

    let shuffle_tx = tx.clone();
    let interval = config.shuffle_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await; // interval's first tick fires immediately
      loop {
        ticker.tick().await;
        if shuffle_tx.send(Command::Shuffle).is_err() {
          return;
        }
      }
    });

    Ok(Engine {
      node,
      mailbox: tx,
      conns,
      peer_events,
    })
  }

  pub fn node(&self) -> &Node {
    &self.node
  }

  /// Dials `contact` and begins the join procedure.
  pub async fn join(&self, contact: Node) -> Result<(), Error> {
    let conn = self.conns.dial(&contact.listen_address).await?;
    let _ = self.mailbox.send(Command::PeerJoined(contact, conn));
    Ok(())
  }

  pub async fn active_peers(&self) -> Vec<Node> {
    let (tx, rx) = oneshot::channel();
    if self.mailbox.send(Command::GetActivePeers(tx)).is_err() {
      return Vec::new();
    }
    rx.await.unwrap_or_default()
  }

  pub async fn passive_peers(&self) -> Vec<Node> {
    let (tx, rx) = oneshot::channel();
    if self.mailbox.send(Command::GetPassivePeers(tx)).is_err() {
      return Vec::new();
    }
    rx.await.unwrap_or_default()
  }

  pub fn subscribe_peer_events<F>(&self, handler: F) -> Subscription
  where
    F: FnMut(PeerEvent) + Send + 'static,
  {
    self.peer_events.subscribe(handler)
  }

  /// Address this engine's [`ConnManager`] is bound to. Exposed mainly
  /// so tests can dial between in-process engines over real sockets.
  pub fn conn_manager(&self) -> &ConnManager {
    &self.conns
  }
}

struct Actor {
  node: Node,
  config: Config,
  conns: ConnManager,
  self_tx: mpsc::UnboundedSender<Command>,
  state: State,
  peer_events: Channel<PeerEvent>,
}

impl Actor {
  async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = mailbox.recv().await {
      self.handle(cmd);
    }
  }

  fn handle(&mut self, cmd: Command) {
    match cmd {
      Command::Message(conn, msg) => self.on_message(conn, msg),
      Command::ConnectionDown(conn) => self.handle_connection_down(conn),
      Command::PeerJoined(node, conn) => self.handle_peer_joined(node, conn),
      Command::ForwardJoinDialed(node, res) => {
        self.handle_forward_join_dialed(node, res)
      }
      Command::RepairDialed(node, res, high_priority) => {
        self.handle_repair_dialed(node, res, high_priority)
      }
      Command::ShuffleReplyDialed(reply, res) => {
        self.handle_shuffle_reply_dialed(reply, res)
      }
      Command::Shuffle => self.do_shuffle(),
      Command::GetActivePeers(reply) => {
        let _ = reply.send(
          self.state.active.iter().map(|p| p.node.clone()).collect(),
        );
      }
      Command::GetPassivePeers(reply) => {
        let _ = reply.send(self.state.passive.clone());
      }
    }
    self.report_view_gauges();
  }

  fn on_message(&mut self, conn: Connection, msg: Message) {
    increment_counter!("hyparview_messages_received_total", "type" => msg.kind());
    match msg {
      Message::Join(m) => self.consume_join(conn, m),
      Message::ForwardJoin(m) => self.consume_forward_join(conn, m),
      Message::Disconnect(m) => self.consume_disconnect(conn, m),
      Message::Neighbor(m) => self.consume_neighbor(conn, m),
      Message::NeighborReply(m) => self.consume_neighbor_reply(conn, m),
      Message::Shuffle(m) => self.consume_shuffle(conn, m),
      Message::ShuffleReply(m) => self.consume_shuffle_reply(conn, m),
    }
  }

  fn report_view_gauges(&self) {
    gauge!("hyparview_active_view_size", self.state.active.len() as f64);
    gauge!("hyparview_passive_view_size", self.state.passive.len() as f64);
  }

  fn handle_peer_joined(&mut self, node: Node, conn: Connection) {
    self.try_add_to_active_view(node, conn.clone());
    let _ = conn.send(Message::Join(Join {
      node_id: self.node.id.clone(),
      listen_address: self.node.listen_address.clone(),
    }));
  }

  // -- JOIN --------------------------------------------------------

  fn consume_join(&mut self, conn: Connection, msg: Join) {
    let node = Node {
      id: msg.node_id,
      listen_address: msg.listen_address,
    };
    if node == self.node {
      let _ = self.conns.disconnect(conn.address());
      return;
    }
    self.try_add_to_active_view(node.clone(), conn);

    let arwl = self.config.arwl;
    for peer in &self.state.active {
      if peer.node == node {
        continue;
      }
      if let Some(c) = self.peer_connection(peer) {
        let _ = c.send(Message::ForwardJoin(ForwardJoin {
          node_id: node.id.clone(),
          listen_address: node.listen_address.clone(),
          ttl: arwl,
        }));
      }
    }
  }

  // -- FORWARD_JOIN --------------------------------------------------

  fn consume_forward_join(&mut self, sender: Connection, msg: ForwardJoin) {
    let node = Node {
      id: msg.node_id,
      listen_address: msg.listen_address,
    };
    if node == self.node {
      return;
    }

    // Terminal when the walk has run out of hops or this node has only
    // the sender itself in its active view (no one else to relay to).
    if msg.ttl <= 0 || self.state.active.len() == 1 {
      self.dial_terminal_forward_join(node);
      return;
    }

    if msg.ttl == self.config.prwl {
      self.add_to_passive_view(node.clone());
    }

    match self.pick_active_excluding(&sender) {
      Some(idx) => {
        if let Some(c) = self.peer_connection(&self.state.active[idx]) {
          let _ = c.send(Message::ForwardJoin(ForwardJoin {
            node_id: node.id,
            listen_address: node.listen_address,
            ttl: msg.ttl - 1,
          }));
        }
      }
      None => self.dial_terminal_forward_join(node),
    }
  }

  fn dial_terminal_forward_join(&mut self, node: Node) {
    self.spawn_dial(node.clone(), |res| {
      Command::ForwardJoinDialed(node, res)
    });
  }

  fn handle_forward_join_dialed(
    &mut self,
    node: Node,
    res: Result<Connection, Error>,
  ) {
    match res {
      Ok(conn) => {
        self.try_add_to_active_view(node, conn.clone());
        let _ = conn.send(Message::Neighbor(Neighbor {
          node_id: self.node.id.clone(),
          listen_address: self.node.listen_address.clone(),
          high_priority: true,
        }));
      }
      Err(err) => {
        tracing::warn!(node = %node.id, %err, "forward-join dial failed");
      }
    }
  }

  // -- DISCONNECT ----------------------------------------------------

  /// A no-op unless `conn` is the active peer it claims to be: the
  /// sender's identity is established by which connection the message
  /// arrived on, not by trusting `msg.node_id` on its own.
  fn consume_disconnect(&mut self, conn: Connection, msg: Disconnect) {
    let Some(idx) = self
      .state
      .active
      .iter()
      .position(|p| p.address.as_deref() == Some(conn.address()))
    else {
      return;
    };
    if self.state.active[idx].id() != msg.node_id {
      return;
    }
    let peer = self.state.active.remove(idx);
    self.peer_events.publish(PeerEvent::PeerDown(peer.node.clone()));
    let _ = self.conns.disconnect(conn.address());
    self.add_to_passive_view(peer.node);
  }

  // -- NEIGHBOR --------------------------------------------------------

  fn consume_neighbor(&mut self, conn: Connection, msg: Neighbor) {
    let node = Node {
      id: msg.node_id,
      listen_address: msg.listen_address,
    };
    let has_room =
      self.state.active.len() < self.config.active_view_capacity();
    let accept = msg.high_priority || has_room;

    if accept {
      self.try_add_to_active_view(node, conn.clone());
    }

    let _ = conn.send(Message::NeighborReply(NeighborReply {
      node_id: self.node.id.clone(),
      listen_address: self.node.listen_address.clone(),
      accepted: accept,
    }));

    if !accept {
      let _ = self.conns.disconnect(conn.address());
    }
  }

  fn consume_neighbor_reply(&mut self, conn: Connection, msg: NeighborReply) {
    if msg.accepted {
      let node = Node {
        id: msg.node_id,
        listen_address: msg.listen_address,
      };
      self.try_add_to_active_view(node, conn);
    } else {
      let _ = self.conns.disconnect(conn.address());
      self.attempt_repair();
    }
  }

  fn handle_repair_dialed(
    &mut self,
    node: Node,
    res: Result<Connection, Error>,
    high_priority: bool,
  ) {
    match res {
      Ok(conn) => {
        let _ = conn.send(Message::Neighbor(Neighbor {
          node_id: self.node.id.clone(),
          listen_address: self.node.listen_address.clone(),
          high_priority,
        }));
      }
      Err(err) => {
        tracing::debug!(node = %node.id, %err, "repair dial failed");
        self.attempt_repair();
      }
    }
  }

  // -- SHUFFLE -----------------------------------------------------

  fn consume_shuffle(&mut self, sender: Connection, msg: Shuffle) {
    if msg.node_id == self.node.id {
      return;
    }

    // Decrement first, then forward only if hops remain - matches the
    // TTL the next hop will see, rather than relaying one hop too far.
    let ttl = msg.ttl - 1;
    if ttl > 0 {
      if let Some(idx) = self.pick_active_excluding(&sender) {
        if let Some(c) = self.peer_connection(&self.state.active[idx]) {
          let _ = c.send(Message::Shuffle(Shuffle {
            node_id: msg.node_id.clone(),
            listen_address: msg.listen_address.clone(),
            nodes: msg.nodes.clone(),
            ttl,
          }));
        }
        return;
      }
    }

    // Sample the reply from the passive view *before* integrating the
    // sender's nodes, so the reply can't hand back what it was just
    // told; size it to min(|m.nodes|, |passive view|).
    let reply_nodes = self.sample_passive(msg.nodes.len());

    for info in &msg.nodes {
      self.add_to_passive_view(Node {
        id: info.node_id.clone(),
        listen_address: info.listen_address.clone(),
      });
    }

    let reply = ShuffleReply {
      received_nodes: msg.nodes,
      nodes: reply_nodes,
    };
    let origin = Node {
      id: msg.node_id,
      listen_address: msg.listen_address,
    };
    self.spawn_dial(origin, move |res| {
      Command::ShuffleReplyDialed(reply, res)
    });
  }

  fn handle_shuffle_reply_dialed(
    &mut self,
    reply: ShuffleReply,
    res: Result<Connection, Error>,
  ) {
    match res {
      Ok(conn) => {
        let _ = conn.send(Message::ShuffleReply(reply));
        let _ = self.conns.disconnect(conn.address());
      }
      Err(err) => {
        tracing::debug!(%err, "shuffle reply dial failed, dropping reply");
      }
    }
  }

  fn consume_shuffle_reply(&mut self, conn: Connection, msg: ShuffleReply) {
    let delete_candidates: Vec<String> = msg
      .received_nodes
      .iter()
      .map(|n| n.node_id.clone())
      .collect();
    for info in msg.nodes {
      self.integrate_into_passive_view(
        Node {
          id: info.node_id,
          listen_address: info.listen_address,
        },
        &delete_candidates,
      );
    }
    let _ = self.conns.disconnect(conn.address());
  }

  fn do_shuffle(&mut self) {
    if self.state.active.is_empty() {
      return;
    }
    let mut rng = rand::thread_rng();
    let idx = rng.gen_range(0..self.state.active.len());
    let target = &self.state.active[idx];
    let Some(conn) = self.peer_connection(target) else {
      return;
    };
    let target_id = target.node.id.clone();

    let mut nodes: Vec<NodeInfo> = self
      .state
      .active
      .iter()
      .filter(|p| p.node.id != target_id)
      .map(|p| NodeInfo {
        node_id: p.node.id.clone(),
        listen_address: p.node.listen_address.clone(),
      })
      .collect();
    nodes.shuffle(&mut rng);
    nodes.truncate(self.config.ka);
    nodes.extend(self.sample_passive(self.config.kp));

    let _ = conn.send(Message::Shuffle(Shuffle {
      node_id: self.node.id.clone(),
      listen_address: self.node.listen_address.clone(),
      nodes,
      ttl: self.config.arwl,
    }));
  }

  // -- repair --------------------------------------------------------

  fn handle_connection_down(&mut self, conn: Connection) {
    if let Some(node) = self.remove_from_active_view_by_conn(&conn) {
      self.add_to_passive_view(node);
      self.attempt_repair();
    }
  }

  /// Dials passive-view candidates one at a time until one connects,
  /// terminating once the passive view is exhausted.
  fn attempt_repair(&mut self) {
    if self.state.active.len() >= self.config.active_view_capacity() {
      return;
    }
    if self.state.passive.is_empty() {
      tracing::debug!("repair found no passive candidates remaining");
      return;
    }
    let idx = rand::thread_rng().gen_range(0..self.state.passive.len());
    let candidate = self.state.passive.remove(idx);
    let high_priority = self.state.active.is_empty();
    self.spawn_dial(candidate.clone(), move |res| {
      Command::RepairDialed(candidate, res, high_priority)
    });
  }

  // -- view helpers --------------------------------------------------

  fn try_add_to_active_view(&mut self, node: Node, conn: Connection) {
    if node == self.node {
      let _ = self.conns.disconnect(conn.address());
      return;
    }
    if let Some(idx) = self.find_active_by_id(&node.id) {
      if self.state.active[idx].address.as_deref() != Some(conn.address()) {
        let _ = self.conns.disconnect(conn.address());
      }
      return;
    }
    self.remove_from_passive_view_by_id(&node.id);

    if self.state.active.len() >= self.config.active_view_capacity() {
      self.evict_random_active(Some(&node.id));
    }

    self
      .state
      .active
      .push(Peer::active(node.clone(), conn.address().to_string()));
    self.peer_events.publish(PeerEvent::PeerUp(node));
  }

  fn evict_random_active(&mut self, exclude_id: Option<&str>) {
    let candidates: Vec<usize> = (0..self.state.active.len())
      .filter(|&i| {
        exclude_id.map_or(true, |id| self.state.active[i].id() != id)
      })
      .collect();
    let Some(&idx) = candidates.choose(&mut rand::thread_rng()) else {
      return;
    };
    let evicted = self.state.active.remove(idx);
    if let Some(address) = &evicted.address {
      if let Some(conn) = self.conns.connection(address) {
        let _ = conn.send(Message::Disconnect(Disconnect {
          node_id: self.node.id.clone(),
        }));
      }
      let _ = self.conns.disconnect(address);
    }
    self.peer_events.publish(PeerEvent::PeerDown(evicted.node.clone()));
    self.add_to_passive_view(evicted.node);
  }

  fn add_to_passive_view(&mut self, node: Node) {
    self.integrate_into_passive_view(node, &[]);
  }

  /// Adds `node` to the passive view, preferring to evict an entry
  /// whose id is in `delete_candidates` (the nodes the sender just told
  /// us about, for a shuffle reply) before falling back to a random
  /// eviction when the view is full.
  fn integrate_into_passive_view(
    &mut self,
    node: Node,
    delete_candidates: &[String],
  ) {
    if node == self.node {
      return;
    }
    if self.find_active_by_id(&node.id).is_some() {
      return;
    }
    if self.state.passive.iter().any(|n| *n == node) {
      return;
    }
    if self.state.passive.len() >= self.config.passive_view_size {
      let idx = self
        .state
        .passive
        .iter()
        .position(|n| delete_candidates.iter().any(|id| id == &n.id))
        .unwrap_or_else(|| {
          rand::thread_rng().gen_range(0..self.state.passive.len())
        });
      self.state.passive.remove(idx);
    }
    self.state.passive.push(node);
  }

  fn remove_from_passive_view_by_id(&mut self, id: &str) {
    self.state.passive.retain(|n| n.id != id);
  }

  fn remove_from_active_view_by_id(&mut self, id: &str) -> Option<Node> {
    let idx = self.find_active_by_id(id)?;
    let peer = self.state.active.remove(idx);
    self.peer_events.publish(PeerEvent::PeerDown(peer.node.clone()));
    Some(peer.node)
  }

  fn remove_from_active_view_by_conn(
    &mut self,
    conn: &Connection,
  ) -> Option<Node> {
    let idx = self
      .state
      .active
      .iter()
      .position(|p| p.address.as_deref() == Some(conn.address()))?;
    let peer = self.state.active.remove(idx);
    self.peer_events.publish(PeerEvent::PeerDown(peer.node.clone()));
    Some(peer.node)
  }

  fn find_active_by_id(&self, id: &str) -> Option<usize> {
    self.state.active.iter().position(|p| p.id() == id)
  }

  /// A random active peer whose connection isn't `exclude`: never
  /// forward or shuffle a message back to the peer it arrived from.
  fn pick_active_excluding(&self, exclude: &Connection) -> Option<usize> {
    let candidates: Vec<usize> = (0..self.state.active.len())
      .filter(|&i| {
        self.state.active[i].address.as_deref() != Some(exclude.address())
      })
      .collect();
    candidates.choose(&mut rand::thread_rng()).copied()
  }

  /// Looks up the live connection for an active-view peer through the
  /// connection manager rather than holding one on [`Peer`] directly -
  /// the manager is the only thing allowed to open or close a
  /// connection, so it's also the only source of truth for "is this
  /// peer still reachable right now".
  fn peer_connection(&self, peer: &Peer) -> Option<Connection> {
    peer.address.as_ref().and_then(|addr| self.conns.connection(addr))
  }

  fn sample_passive(&self, k: usize) -> Vec<NodeInfo> {
    let mut nodes: Vec<NodeInfo> = self
      .state
      .passive
      .iter()
      .map(|n| NodeInfo {
        node_id: n.id.clone(),
        listen_address: n.listen_address.clone(),
      })
      .collect();
    nodes.shuffle(&mut rand::thread_rng());
    nodes.truncate(k);
    nodes
  }

  fn spawn_dial<F>(&self, node: Node, make_cmd: F)
  where
    F: FnOnce(Result<Connection, Error>) -> Command + Send + 'static,
  {
    let conns = self.conns.clone();
    let tx = self.self_tx.clone();
    tokio::spawn(async move {
      let result = conns.dial(&node.listen_address).await;
      let _ = tx.send(make_cmd(result));
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn node(id: &str, addr: &str) -> Node {
    Node {
      id: id.into(),
      listen_address: addr.into(),
    }
  }

  async fn spin_up(id: &str) -> Engine {
    Engine::start(node(id, "127.0.0.1:0"), Config::default())
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn two_nodes_join_and_become_mutually_active() {
    let a = spin_up("a").await;
    let b = spin_up("b").await;

    let contact = a.node().clone();
    b.join(contact).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let a_active = a.active_peers().await;
    let b_active = b.active_peers().await;
    assert!(a_active.iter().any(|n| n.id == "b"));
    assert!(b_active.iter().any(|n| n.id == "a"));
  }

  #[tokio::test]
  async fn three_node_join_propagates_via_forward_join() {
    let a = spin_up("a").await;
    let b = spin_up("b").await;
    let c = spin_up("c").await;

    b.join(a.node().clone()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    c.join(a.node().clone()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // c never dials b directly; a forward-joining c's JOIN to b (and b's
    // active view having no other candidate to forward to) is the only
    // way b ends up with a live connection to c.
    let b_active = b.active_peers().await;
    assert!(b_active.iter().any(|n| n.id == "c"));
  }

  #[tokio::test]
  async fn disconnecting_an_active_peer_demotes_it_to_passive() {
    let a = spin_up("a").await;
    let b = spin_up("b").await;

    b.join(a.node().clone()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Breaking the link from b's side (it dialed a, so b's registry is
    // keyed by a's listen address) closes the shared socket and a
    // observes the same disconnect independently.
    b.conn_manager().disconnect(&a.node().listen_address).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let a_passive = a.passive_peers().await;
    assert!(a_passive.iter().any(|n| n.id == "b"));
  }
}
