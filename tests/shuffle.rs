use {
  hyparview_net::{Config, Engine, Node},
  std::time::Duration,
};

fn node(id: &str) -> Node {
  Node {
    id: id.into(),
    listen_address: "127.0.0.1:0".into(),
  }
}

/// A fast shuffle interval should let a four-node chain mix enough that
/// a node learns of a peer it never directly joined, purely through
/// passive-view gossip.
#[tokio::test]
async fn shuffle_spreads_passive_view_knowledge() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .try_init();

  let config = Config {
    shuffle_interval: Duration::from_millis(40),
    ka: 3,
    kp: 3,
    ..Config::default()
  };

  let a = Engine::start(node("a"), config.clone()).await.unwrap();
  let b = Engine::start(node("b"), config.clone()).await.unwrap();
  let c = Engine::start(node("c"), config.clone()).await.unwrap();
  let d = Engine::start(node("d"), config.clone()).await.unwrap();

  b.join(a.node().clone()).await.unwrap();
  c.join(b.node().clone()).await.unwrap();
  d.join(c.node().clone()).await.unwrap();

  // Give several shuffle rounds time to run across the chain.
  tokio::time::sleep(Duration::from_millis(800)).await;

  let d_known: std::collections::HashSet<_> = d
    .active_peers()
    .await
    .into_iter()
    .chain(d.passive_peers().await)
    .map(|n| n.id)
    .collect();

  assert!(
    d_known.contains("a") || d_known.contains("b"),
    "expected shuffle to have propagated at least one distant node id to d, got {d_known:?}"
  );
}
