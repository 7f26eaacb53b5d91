//! Defines the wire protocol messages exchanged between HyParView peers.
//! Implements the membership protocol described by:
//! Leitão, João & Pereira, José & Rodrigues, Luís. (2007). 419-429.
//! 10.1109/DSN.2007.56.

use serde::{Deserialize, Serialize};

/// Identity and reachability of a peer as carried on the wire. Distinct
/// from [`crate::node::Node`] only in that it never carries a live
/// connection — it is always just-in-time decoded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
  #[serde(rename = "NodeID")]
  pub node_id: String,
  #[serde(rename = "ListenAddress")]
  pub listen_address: String,
}

/// Sent to a contact node to initiate joining the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
  #[serde(rename = "NodeID")]
  pub node_id: String,
  #[serde(rename = "ListenAddress")]
  pub listen_address: String,
}

/// Propagated by recipients of JOIN to their active-view peers so the
/// joining node ends up with `Fanout` active connections, not just one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardJoin {
  #[serde(rename = "NodeID")]
  pub node_id: String,
  #[serde(rename = "ListenAddress")]
  pub listen_address: String,
  #[serde(rename = "TTL")]
  pub ttl: i32,
}

/// Tells the receiver that the sender is dropping it from its active view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
  #[serde(rename = "NodeID")]
  pub node_id: String,
}

/// Requests that the receiver add the sender to its active view.
/// `high_priority` requests MUST be accepted even when the receiver's
/// active view is full (used when the sender has zero active peers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
  #[serde(rename = "NodeID")]
  pub node_id: String,
  #[serde(rename = "ListenAddress")]
  pub listen_address: String,
  #[serde(rename = "HighPriority")]
  pub high_priority: bool,
}

/// Response to [`Neighbor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborReply {
  #[serde(rename = "NodeID")]
  pub node_id: String,
  #[serde(rename = "ListenAddress")]
  pub listen_address: String,
  #[serde(rename = "Accepted")]
  pub accepted: bool,
}

/// Periodically sent to a random active peer to mix passive-view
/// knowledge across the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shuffle {
  #[serde(rename = "NodeID")]
  pub node_id: String,
  #[serde(rename = "ListenAddress")]
  pub listen_address: String,
  #[serde(rename = "Nodes")]
  pub nodes: Vec<NodeInfo>,
  #[serde(rename = "TTL")]
  pub ttl: i32,
}

/// Response to a terminal [`Shuffle`], sent over a fresh one-shot
/// connection and followed immediately by a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleReply {
  #[serde(rename = "ReceivedNodes")]
  pub received_nodes: Vec<NodeInfo>,
  #[serde(rename = "Nodes")]
  pub nodes: Vec<NodeInfo>,
}

/// Tagged union over every message the protocol exchanges. The tag
/// ordinal is the wire discriminant, not the enum's in-memory
/// representation - see [`crate::codec`] for the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
  Join(Join),
  ForwardJoin(ForwardJoin),
  Disconnect(Disconnect),
  Neighbor(Neighbor),
  NeighborReply(NeighborReply),
  Shuffle(Shuffle),
  ShuffleReply(ShuffleReply),
}

impl Message {
  pub(crate) fn tag(&self) -> u8 {
    match self {
      Message::Join(_) => 0,
      Message::ForwardJoin(_) => 1,
      Message::Disconnect(_) => 2,
      Message::Neighbor(_) => 3,
      Message::NeighborReply(_) => 4,
      Message::Shuffle(_) => 5,
      Message::ShuffleReply(_) => 6,
    }
  }

  /// Short name used in log lines.
  pub(crate) fn kind(&self) -> &'static str {
    match self {
      Message::Join(_) => "JOIN",
      Message::ForwardJoin(_) => "FORWARD_JOIN",
      Message::Disconnect(_) => "DISCONNECT",
      Message::Neighbor(_) => "NEIGHBOR",
      Message::NeighborReply(_) => "NEIGHBOR_REPLY",
      Message::Shuffle(_) => "SHUFFLE",
      Message::ShuffleReply(_) => "SHUFFLE_REPLY",
    }
  }
}
