//! # mcpipe Client Engine
//!
//! Purpose: Pipeline memcached binary-protocol operations over one connection
//! per server, with a single background thread doing all socket I/O.
//!
//! ## Design Principles
//! 1. **Producer/Driver Split**: Callers enqueue operations and hold futures;
//!    the driver owns sockets, buffers and codec state.
//! 2. **Resumable Codec**: Requests and responses move through fixed-size
//!    buffers in as many passes as they need.
//! 3. **Strict Ordering**: Per node, responses are matched to requests by
//!    position; quiet operations are resolved by what follows them.
//! 4. **Graceful Degradation**: A failed node leaves the routing set and
//!    rejoins after reconnecting; other nodes keep serving.
//!
//! ## Layering
//!
//! ```text
//! MemcachedClient ─► Cluster ─► Locator ─► Node ─► {WriteBuffer, ReceiveBuffer}
//!                        │                   │
//!                        └─ driver thread ───┴─► BinaryRequest / BinaryResponse
//! ```

pub mod allocator;
pub mod buffer;
pub mod client;
pub mod cluster;
pub mod config;
pub mod deque;
pub mod locator;
pub mod node;
pub mod operation;
pub mod ops;
pub mod policy;
pub mod registry;
pub mod request;
pub mod response;
pub mod signal;
pub mod socket;

pub use client::{Item, MemcachedClient, ServerStats};
pub use cluster::{BroadcastFuture, Cluster, NodeResult};
pub use config::{ClusterBuilder, ClusterConfig, FailurePolicyConfig, ReconnectPolicyConfig};
pub use locator::{KetamaLocator, NodeLocator, SingleNodeLocator};
pub use node::Node;
pub use operation::{Operation, OperationFuture, OperationResult, Payload};
pub use policy::{
    ExponentialReconnectPolicy, FailurePolicy, ImmediateFailurePolicy, PeriodicReconnectPolicy,
    ReconnectPolicy, ThrottlingFailurePolicy,
};
pub use registry::ClusterRegistry;
pub use socket::{Socket, SocketFactory, SocketOptions, TcpSocketFactory};

pub use mcpipe_common::{ClientError, ClientResult, Expiration, Key, Status};
