use hyparview_net::{Config, Engine, Node};

fn node(id: &str) -> Node {
  Node {
    id: id.into(),
    listen_address: "127.0.0.1:0".into(),
  }
}

async fn spin_up(id: &str, config: Config) -> Engine {
  Engine::start(node(id), config).await.unwrap()
}

/// With a fanout of 1 the hub's active view caps at 2 peers; a third
/// arrival must evict one of the first two rather than growing past
/// capacity.
#[tokio::test]
async fn active_view_never_exceeds_fanout_plus_one() {
  let config = Config {
    fanout: 1,
    ..Config::default()
  };
  let hub = spin_up("hub", config.clone()).await;
  let satellites = [
    spin_up("s1", config.clone()).await,
    spin_up("s2", config.clone()).await,
    spin_up("s3", config.clone()).await,
  ];

  for s in &satellites {
    s.join(hub.node().clone()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
  }

  let hub_active = hub.active_peers().await;
  assert!(hub_active.len() <= config.active_view_capacity());

  // Whichever satellite got evicted should have landed in the hub's
  // passive view rather than being forgotten outright.
  let hub_passive = hub.passive_peers().await;
  let known: std::collections::HashSet<_> = hub_active
    .iter()
    .chain(hub_passive.iter())
    .map(|n| n.id.clone())
    .collect();
  assert!(known.contains("s1") || known.contains("s2") || known.contains("s3"));
}
