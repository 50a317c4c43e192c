use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use super::routing::{node_routing_key, short_hostname};

/// Static set of peer image nodes, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeList {
    nodes: Vec<String>,
}

impl NodeList {
    pub fn new(nodes: Vec<String>) -> Self {
        Self { nodes }
    }

    /// Parse a comma-separated host list; whitespace is stripped and empty
    /// entries are dropped.
    pub fn parse(raw: &str) -> Self {
        let nodes = raw
            .split(',')
            .map(|node| node.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|node| !node.is_empty())
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(short_hostname(node)) {
                warn!(
                    "Node {} shares short hostname '{}' with another node; both map to one queue",
                    node,
                    short_hostname(node)
                );
            }
        }

        Self { nodes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `(node, routing_key)` pairs in list order.
    pub fn routing_keys(&self, relay_prefix: &str) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .map(|node| (node.clone(), node_routing_key(relay_prefix, node)))
            .collect()
    }
}
