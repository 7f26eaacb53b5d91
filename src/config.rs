//! Tunables for one node's membership engine.

use std::time::Duration;

/// Parameters governing view sizes, random-walk lengths, and shuffle
/// cadence. Values default to the ones commonly cited for the protocol
/// at moderate overlay sizes (a few hundred to a few thousand nodes).
#[derive(Debug, Clone)]
pub struct Config {
  /// Target active-view size excluding this node itself. The active
  /// view is allowed to grow to `fanout + 1` transiently: the extra
  /// slot exists so a `NEIGHBOR` accepted concurrently with another
  /// join doesn't get evicted immediately.
  pub fanout: usize,
  /// Maximum passive-view size.
  pub passive_view_size: usize,
  /// Active Random Walk Length: hop count a `JOIN` is forwarded before
  /// its subject is guaranteed a slot in the receiver's active view.
  pub arwl: i32,
  /// Passive Random Walk Length: hop count a forwarded `JOIN` keeps
  /// being added to passive views along the way.
  pub prwl: i32,
  /// Interval between this node's own shuffle rounds.
  pub shuffle_interval: Duration,
  /// Number of active-view nodes' ids included in a shuffle.
  pub ka: usize,
  /// Number of passive-view nodes' ids included in a shuffle.
  pub kp: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      fanout: 4,
      passive_view_size: 24,
      arwl: 6,
      prwl: 3,
      shuffle_interval: Duration::from_secs(60),
      ka: 3,
      kp: 4,
    }
  }
}

impl Config {
  /// Active view is full once it holds `fanout + 1` peers.
  pub fn active_view_capacity(&self) -> usize {
    self.fanout + 1
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_active_capacity_is_fanout_plus_one() {
    let cfg = Config::default();
    assert_eq!(cfg.active_view_capacity(), cfg.fanout + 1);
  }
}
