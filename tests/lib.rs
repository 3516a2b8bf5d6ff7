//! Shared helpers for the STT integration test suite.

use std::time::Duration;
use stt_core::{Node, NodeConfig, NodeEvent};

/// Per-event wait budget; localhost traffic settles well within this.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a node with deterministic seeds and OS-assigned ports.
#[must_use]
pub fn test_config(node_seed_byte: u8, shared_seed_byte: u8) -> NodeConfig {
    NodeConfig::new(vec![node_seed_byte; 32], vec![shared_seed_byte; 32])
}

/// Start a node or panic with context.
pub async fn start_node(config: NodeConfig) -> Node {
    let node = Node::new(config).expect("node construction failed");
    node.start().await.expect("node start failed");
    node
}

/// Await the next event matching `pick`, skipping others (keepalives and
/// unrelated closures can interleave).
pub async fn wait_for_event<T>(
    node: &Node,
    mut pick: impl FnMut(NodeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match node.receive().await {
                Some(event) => {
                    if let Some(value) = pick(event) {
                        return value;
                    }
                }
                None => panic!("event feed ended while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
