//! # Cluster Registry
//!
//! Purpose: Share named clusters between the parts of an application that
//! build clients, without a process-wide global.
//!
//! ## Usage Notes
//!
//! - Create one registry at startup and pass it (or an `Arc` of it) to
//!   whatever constructs clients.
//! - Registering a name twice replaces the old cluster and shuts it down.

use std::sync::Arc;

use ahash::AHashMap;
use mcpipe_common::ClientResult;
use parking_lot::RwLock;
use tracing::info;

use crate::cluster::Cluster;
use crate::config::{ClusterBuilder, ClusterConfig};

#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<AHashMap<String, Arc<Cluster>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `cluster` under `name` and returns the shared handle.
    pub fn register(&self, name: impl Into<String>, cluster: Cluster) -> Arc<Cluster> {
        let name = name.into();
        let cluster = Arc::new(cluster);
        let previous = self.clusters.write().insert(name.clone(), Arc::clone(&cluster));
        if let Some(previous) = previous {
            info!(cluster = %name, "replacing registered cluster");
            previous.shutdown();
        }
        cluster
    }

    /// Returns the cluster called `name`, starting it from `config` on first use.
    pub fn get_or_start(&self, name: &str, config: ClusterConfig) -> ClientResult<Arc<Cluster>> {
        if let Some(cluster) = self.get(name) {
            return Ok(cluster);
        }

        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(name) {
            return Ok(Arc::clone(cluster));
        }
        let cluster = Arc::new(ClusterBuilder::from_config(config).start()?);
        clusters.insert(name.to_string(), Arc::clone(&cluster));
        Ok(cluster)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.clusters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes and shuts down the cluster called `name`. Returns false if absent.
    pub fn shutdown(&self, name: &str) -> bool {
        let removed = self.clusters.write().remove(name);
        match removed {
            Some(cluster) => {
                cluster.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn shutdown_all(&self) {
        let clusters: Vec<_> = self.clusters.write().drain().collect();
        for (name, cluster) in clusters {
            info!(cluster = %name, "shutting down");
            cluster.shutdown();
        }
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry").field("names", &self.names()).finish()
    }
}
