//! # Cluster Configuration
//!
//! Purpose: Describe a cluster as plain, serializable values and turn that
//! description into a running `Cluster`.
//!
//! ## Design Principles
//! 1. **Values First**: `ClusterConfig` is plain data with serde support; the
//!    builder owns the trait-object overrides that cannot be serialized.
//! 2. **Fail at Build Time**: Missing or unresolvable endpoints surface from
//!    `build()`, never from the driver.
//! 3. **One Policy per Node**: Failure policies are created through a factory
//!    so each node counts its own errors.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use mcpipe_common::{ClientError, ClientResult, HEADER_LENGTH};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocator::{BufferAllocator, PooledAllocator};
use crate::cluster::Cluster;
use crate::locator::{KetamaLocator, NodeLocator, SingleNodeLocator};
use crate::node::{Node, NodeOptions};
use crate::policy::{
    ExponentialReconnectPolicy, FailurePolicy, FailurePolicyFactory, ImmediateFailurePolicy,
    PeriodicReconnectPolicy, ReconnectPolicy, ThrottlingFailurePolicy,
};
use crate::signal::WakeSignal;
use crate::socket::{SocketFactory, SocketOptions, TcpSocketFactory};

/// Default buffer capacity for both directions.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

const DEFAULT_ENDPOINT: &str = "127.0.0.1:11211";
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Serializable cluster description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Server addresses, e.g. "10.0.0.1:11211" or "cache-1:11211".
    pub endpoints: Vec<String>,
    /// Capacity of each node's write and receive buffer.
    pub buffer_size: usize,
    pub connect_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub failure: FailurePolicyConfig,
    pub reconnect: ReconnectPolicyConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: None,
            receive_timeout: None,
            send_timeout: None,
            failure: FailurePolicyConfig::default(),
            reconnect: ReconnectPolicyConfig::default(),
        }
    }
}

/// When an I/O error takes a node down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicyConfig {
    /// First error fails the node.
    #[default]
    Immediate,
    /// `threshold` errors, each within `reset_after` of the last, fail the node.
    Throttling { threshold: usize, reset_after: Duration },
}

impl FailurePolicyConfig {
    pub fn factory(self) -> FailurePolicyFactory {
        match self {
            FailurePolicyConfig::Immediate => {
                Arc::new(|| Box::new(ImmediateFailurePolicy) as Box<dyn FailurePolicy>)
            }
            FailurePolicyConfig::Throttling {
                threshold,
                reset_after,
            } => Arc::new(move || {
                Box::new(ThrottlingFailurePolicy::new(threshold, reset_after)) as Box<dyn FailurePolicy>
            }),
        }
    }
}

/// How long a failed node waits before the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicyConfig {
    Periodic { interval: Duration },
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicyConfig {
    fn default() -> Self {
        ReconnectPolicyConfig::Periodic {
            interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl ReconnectPolicyConfig {
    pub fn build(self) -> Arc<dyn ReconnectPolicy> {
        match self {
            ReconnectPolicyConfig::Periodic { interval } => Arc::new(PeriodicReconnectPolicy::new(interval)),
            ReconnectPolicyConfig::Exponential { initial, max } => {
                Arc::new(ExponentialReconnectPolicy::new(initial, max))
            }
        }
    }
}

/// Fluent cluster construction.
///
/// ```no_run
/// use std::time::Duration;
/// use mcpipe_client::ClusterBuilder;
///
/// let cluster = ClusterBuilder::new()
///     .endpoint("10.0.0.1:11211")
///     .endpoint("10.0.0.2:11211")
///     .connect_timeout(Duration::from_secs(1))
///     .start()
///     .unwrap();
/// ```
pub struct ClusterBuilder {
    config: ClusterConfig,
    locator: Option<Box<dyn NodeLocator>>,
    failure_policy: Option<FailurePolicyFactory>,
    reconnect_policy: Option<Arc<dyn ReconnectPolicy>>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    allocator: Option<Arc<dyn BufferAllocator>>,
}

impl ClusterBuilder {
    /// Starts with default settings and no endpoints.
    pub fn new() -> Self {
        Self::from_config(ClusterConfig {
            endpoints: Vec::new(),
            ..ClusterConfig::default()
        })
    }

    pub fn from_config(config: ClusterConfig) -> Self {
        ClusterBuilder {
            config,
            locator: None,
            failure_policy: None,
            reconnect_policy: None,
            socket_factory: None,
            allocator: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoints.push(endpoint.into());
        self
    }

    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Buffer capacity per direction; raised to one header if smaller.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = Some(timeout);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = Some(timeout);
        self
    }

    pub fn locator(mut self, locator: impl NodeLocator + 'static) -> Self {
        self.locator = Some(Box::new(locator));
        self
    }

    pub fn failure_policy<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FailurePolicy> + Send + Sync + 'static,
    {
        self.failure_policy = Some(Arc::new(factory));
        self
    }

    pub fn reconnect_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect_policy = Some(Arc::new(policy));
        self
    }

    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Resolves endpoints and assembles an idle cluster.
    pub fn build(self) -> ClientResult<Cluster> {
        let ClusterBuilder {
            config,
            locator,
            failure_policy,
            reconnect_policy,
            socket_factory,
            allocator,
        } = self;

        if config.endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| resolve(endpoint))
            .collect::<ClientResult<Vec<_>>>()?;

        let socket_factory: Arc<dyn SocketFactory> = socket_factory.unwrap_or_else(|| {
            Arc::new(TcpSocketFactory::new(SocketOptions {
                connect_timeout: config.connect_timeout,
                receive_timeout: config.receive_timeout,
                send_timeout: config.send_timeout,
            }))
        });
        let allocator = allocator.unwrap_or_else(|| Arc::new(PooledAllocator::default()));
        let failure_policy = failure_policy.unwrap_or_else(|| config.failure.factory());
        let reconnect = reconnect_policy.unwrap_or_else(|| config.reconnect.build());
        let locator: Box<dyn NodeLocator> = match locator {
            Some(locator) => locator,
            None if endpoints.len() == 1 => Box::new(SingleNodeLocator::new()),
            None => Box::new(KetamaLocator::new()),
        };

        let wake = Arc::new(WakeSignal::new());
        let buffer_size = config.buffer_size.max(HEADER_LENGTH);
        let nodes = endpoints
            .iter()
            .map(|&endpoint| {
                Arc::new(Node::new(
                    endpoint,
                    NodeOptions {
                        buffer_size,
                        socket_factory: Arc::clone(&socket_factory),
                        failure_policy: failure_policy(),
                        allocator: Arc::clone(&allocator),
                        wake: Arc::clone(&wake),
                    },
                ))
            })
            .collect();

        debug!(endpoints = ?endpoints, buffer_size, "cluster built");
        Ok(Cluster::new(nodes, locator, reconnect, wake))
    }

    /// Builds the cluster and starts its driver.
    pub fn start(self) -> ClientResult<Cluster> {
        let cluster = self.build()?;
        cluster.start()?;
        Ok(cluster)
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(endpoint: &str) -> ClientResult<SocketAddr> {
    endpoint
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ClientError::InvalidAddress(endpoint.to_string()))
}
