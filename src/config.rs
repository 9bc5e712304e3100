//! Static cluster configuration: a JSON object mapping node ids to
//! application addresses, loaded once at startup.

use crate::RAFT_PORT_OFFSET;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterConfig {
    nodes: BTreeMap<String, String>,
}

impl ClusterConfig {
    pub fn new(nodes: BTreeMap<String, String>) -> Self {
        Self { nodes }
    }

    /// Load the cluster map from a JSON file, e.g.
    /// `{"n1": "127.0.0.1:9001", "n2": "127.0.0.1:9002"}`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading cluster config '{}'", path.display()))?;
        let config: ClusterConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing cluster config '{}'", path.display()))?;
        if config.nodes.is_empty() {
            bail!("cluster config '{}' lists no nodes", path.display());
        }
        Ok(config)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Application address of a node, as clients dial it.
    pub fn addr_of(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).map(String::as_str)
    }

    /// Raft address of a node: same host, application port plus the offset.
    pub fn raft_addr_of(&self, node_id: &str) -> Result<String> {
        let addr = self
            .nodes
            .get(node_id)
            .with_context(|| format!("node '{}' not in cluster config", node_id))?;
        raft_addr(addr)
    }

    /// All application addresses, in stable (id-sorted) order.
    pub fn all_addrs(&self) -> Vec<String> {
        self.nodes.values().cloned().collect()
    }

    /// `(peer_id, raft address)` for every node except `node_id`.
    pub fn raft_peers_of(&self, node_id: &str) -> Result<Vec<(String, String)>> {
        let mut peers = Vec::new();
        for (id, addr) in &self.nodes {
            if id != node_id {
                peers.push((id.clone(), raft_addr(addr)?));
            }
        }
        Ok(peers)
    }
}

fn raft_addr(app_addr: &str) -> Result<String> {
    let (host, port) = app_addr
        .rsplit_once(':')
        .with_context(|| format!("address '{}' is not host:port", app_addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("address '{}' has a bad port", app_addr))?;
    Ok(format!("{}:{}", host, port + RAFT_PORT_OFFSET))
}
