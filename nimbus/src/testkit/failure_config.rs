use crate::core::NodeKey;
use im::HashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How packets to a destination are mistreated.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  /// The probability a packet is silently dropped.
  pub drop_prob: f64,
  /// A delay range, sampled uniformly per packet.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  /// Drops everything.
  pub fn silent() -> FailureConfig {
    FailureConfig {
      drop_prob: 1.0,
      delay: None,
    }
  }
}

/// A [`FailureConfig`] for every destination, with per-node overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<NodeKey, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, node: &NodeKey) -> &FailureConfig {
    self.node_wide.get(node).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_node_overrides() {
  let a = NodeKey::new(std::net::Ipv4Addr::LOCALHOST, 5001);
  let b = NodeKey::new(std::net::Ipv4Addr::LOCALHOST, 5002);
  let mut map = FailureConfigMap::default();
  map.cluster_wide.drop_prob = 0.25;
  map.node_wide.insert(b, FailureConfig::silent());
  assert_eq!(map.get(&a).drop_prob, 0.25);
  assert_eq!(map.get(&b).drop_prob, 1.0);
}
