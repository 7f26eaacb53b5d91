use serde::{Deserialize, Serialize};

/// Identity of a member of the p2p overlay.
///
/// Equality and hashing are by [`Node::id`] alone; two nodes that
/// advertise the same id but different addresses are the same node
/// (the newer address wins wherever a [`Node`] is replaced).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
  pub id: String,
  pub listen_address: String,
}

impl PartialEq for Node {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}
impl Eq for Node {}

impl std::hash::Hash for Node {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.id.hash(state);
  }
}

/// A member known to this node, either actively connected or only
/// remembered as a passive-view candidate.
///
/// `address` is `Some` iff this peer currently lives in the active view.
/// It names a [`crate::conn_manager::ConnManager`] registry key rather
/// than holding a live [`Connection`](crate::connection::Connection)
/// directly, so the connection manager stays the only thing that can
/// open or close one.
#[derive(Debug, Clone)]
pub struct Peer {
  pub node: Node,
  pub address: Option<String>,
}

impl Peer {
  pub fn active(node: Node, address: String) -> Self {
    Self {
      node,
      address: Some(address),
    }
  }

  pub fn passive(node: Node) -> Self {
    Self {
      node,
      address: None,
    }
  }

  pub fn id(&self) -> &str {
    &self.node.id
  }
}
