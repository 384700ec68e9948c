//! # Cluster
//!
//! Purpose: Own the node set and the single driver thread; route keyed
//! operations, broadcast keyless ones, and take failed nodes out of rotation
//! until they reconnect.
//!
//! ## Design Principles
//! 1. **One I/O Thread**: Only the driver calls `Node::send`/`receive`.
//!    Callers enqueue and wait on futures.
//! 2. **Copy-on-Write Working Set**: Routing reads an immutable snapshot;
//!    failure and recovery publish a new one through a compare-and-swap loop.
//! 3. **Background Recovery**: Reconnect attempts run on short-lived timer
//!    threads that sleep on the shutdown token, never on the driver.
//! 4. **Orderly Shutdown**: Stop the driver, join timers, then close sockets.
//!
//! ## Driver Loop
//!
//! ```text
//! loop {
//!     wake.reset()
//!     send()    on every working node
//!     receive() on every working node
//!     if nothing moved: wake.wait(IDLE_WAIT)
//! }
//! ```

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use mcpipe_common::{ClientError, ClientResult};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::locator::NodeLocator;
use crate::node::Node;
use crate::operation::{Operation, OperationFuture, OperationResult};
use crate::ops::NoOpOperation;
use crate::policy::ReconnectPolicy;
use crate::signal::{ShutdownToken, WakeSignal};

/// Longest the driver sleeps without a wake-up.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Floor for repeated reconnect attempts after an immediate retry failed.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Outcome of a broadcast operation on one node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub endpoint: SocketAddr,
    pub result: ClientResult<OperationResult>,
}

/// Resolves once every per-node operation of a broadcast resolved.
pub struct BroadcastFuture {
    inner: BoxFuture<'static, ClientResult<Vec<NodeResult>>>,
}

impl BroadcastFuture {
    fn failed(error: ClientError) -> Self {
        BroadcastFuture {
            inner: futures::future::ready(Err(error)).boxed(),
        }
    }

    /// Blocks the current thread until all nodes answered or failed.
    pub fn wait(self) -> ClientResult<Vec<NodeResult>> {
        futures::executor::block_on(self.inner)
    }
}

impl std::future::Future for BroadcastFuture {
    type Output = ClientResult<Vec<NodeResult>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for BroadcastFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BroadcastFuture")
    }
}

/// A set of memcached nodes driven by one background thread.
///
/// Dropping the cluster shuts it down.
pub struct Cluster {
    inner: Arc<ClusterInner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct ClusterInner {
    nodes: Vec<Arc<Node>>,
    working: ArcSwap<Vec<Arc<Node>>>,
    locator: Box<dyn NodeLocator>,
    locator_lock: Mutex<()>,
    reconnect: Arc<dyn ReconnectPolicy>,
    wake: Arc<WakeSignal>,
    shutdown: ShutdownToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Assembles a cluster; every node must share `wake`.
    ///
    /// Nodes start in the working set and connect on the first driver pass.
    pub(crate) fn new(
        nodes: Vec<Arc<Node>>,
        locator: Box<dyn NodeLocator>,
        reconnect: Arc<dyn ReconnectPolicy>,
        wake: Arc<WakeSignal>,
    ) -> Self {
        locator.initialize(&nodes);
        let working = ArcSwap::from_pointee(nodes.clone());

        Cluster {
            inner: Arc::new(ClusterInner {
                nodes,
                working,
                locator,
                locator_lock: Mutex::new(()),
                reconnect,
                wake,
                shutdown: ShutdownToken::new(),
                timers: Mutex::new(Vec::new()),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Starts the driver thread. Calling it again is a no-op.
    pub fn start(&self) -> ClientResult<()> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(ClientError::Abandoned);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("mcpipe-driver".to_string())
            .spawn(move || inner.drive())
            .map_err(|err| ClientError::Driver(Arc::new(err)))?;
        *driver = Some(handle);

        info!(nodes = self.inner.nodes.len(), "cluster started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.driver.lock().is_some() && !self.inner.shutdown.is_cancelled()
    }

    /// Every configured node, alive or not.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.inner.nodes
    }

    /// Snapshot of the nodes currently used for routing.
    pub fn working_nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.inner.working.load_full()
    }

    /// Node that currently owns `key`.
    pub fn locate(&self, key: &[u8]) -> Option<Arc<Node>> {
        self.inner.locator.locate(key)
    }

    /// Routes `op` to its owner and returns the owner's future.
    ///
    /// Keyless operations go to the first working node. A quiet operation is
    /// followed by a NoOp so its silence can be observed.
    pub fn execute(&self, op: Box<dyn Operation>) -> OperationFuture {
        let Some(node) = self.inner.route(op.as_ref()) else {
            return OperationFuture::failed(ClientError::AllNodesDead);
        };

        let quiet = op.is_quiet();
        let future = node.enqueue(op);
        if quiet {
            drop(node.enqueue(Box::new(NoOpOperation::new())));
        }
        future
    }

    /// Routes a batch; futures come back in input order.
    ///
    /// Each node that received a quiet operation gets one NoOp after the batch.
    pub fn execute_many(&self, ops: Vec<Box<dyn Operation>>) -> Vec<OperationFuture> {
        let mut futures = Vec::with_capacity(ops.len());
        let mut batches: AHashMap<SocketAddr, (Arc<Node>, bool)> = AHashMap::new();

        for op in ops {
            let Some(node) = self.inner.route(op.as_ref()) else {
                futures.push(OperationFuture::failed(ClientError::AllNodesDead));
                continue;
            };
            let quiet = op.is_quiet();
            futures.push(node.enqueue(op));
            let batch = batches.entry(node.endpoint()).or_insert((node, false));
            batch.1 |= quiet;
        }

        for (node, quiet) in batches.into_values() {
            if quiet {
                drop(node.enqueue(Box::new(NoOpOperation::new())));
            }
        }
        futures
    }

    /// Sends one operation built by `factory` to every node.
    ///
    /// Dead nodes report `NotAlive` in their slot; fails outright only when no
    /// node is alive.
    pub fn broadcast<F>(&self, factory: F) -> BroadcastFuture
    where
        F: Fn() -> Box<dyn Operation>,
    {
        if !self.inner.nodes.iter().any(|node| node.is_alive()) {
            return BroadcastFuture::failed(ClientError::AllNodesDead);
        }

        let pending: Vec<_> = self
            .inner
            .nodes
            .iter()
            .map(|node| {
                let endpoint = node.endpoint();
                let future = node.enqueue(factory());
                async move {
                    NodeResult {
                        endpoint,
                        result: future.await,
                    }
                }
            })
            .collect();

        BroadcastFuture {
            inner: async move { Ok(join_all(pending).await) }.boxed(),
        }
    }

    /// Stops the driver, joins reconnect timers and closes every node.
    ///
    /// Operations still queued resolve to `ClientError::Abandoned`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.wake.set();

        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                error!("driver thread panicked");
            }
        }

        let timers = std::mem::take(&mut *self.inner.timers.lock());
        for timer in timers {
            if timer.join().is_err() {
                error!("reconnect timer panicked");
            }
        }

        for node in &self.inner.nodes {
            node.shutdown();
        }
        debug!("cluster shut down");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.inner.nodes)
            .field("working", &self.inner.working.load().len())
            .finish()
    }
}

impl ClusterInner {
    fn route(&self, op: &dyn Operation) -> Option<Arc<Node>> {
        match op.key() {
            Some(key) => self.locator.locate(key.as_bytes()),
            None => self.working.load().first().cloned(),
        }
    }

    fn drive(self: Arc<Self>) {
        debug!("driver started");
        while !self.shutdown.is_cancelled() {
            self.wake.reset();
            let working = self.working.load_full();
            let mut progress = false;

            for node in working.iter() {
                match node.send() {
                    Ok(sent) => progress |= sent,
                    Err(_) => self.fail_node(node),
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            for node in working.iter() {
                match node.receive() {
                    Ok(received) => progress |= received,
                    Err(_) => self.fail_node(node),
                }
            }

            if !progress {
                self.wake.wait(IDLE_WAIT);
            }
        }
        debug!("driver stopped");
    }

    /// Publishes `change(current)` as the working set, retrying on contention,
    /// then rebuilds the locator from whatever set is current.
    fn update_working<F>(&self, change: F)
    where
        F: Fn(&[Arc<Node>]) -> Vec<Arc<Node>>,
    {
        let mut current = self.working.load_full();
        loop {
            let next = Arc::new(change(&current));
            let previous = self.working.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*previous, &current) {
                break;
            }
            current = arc_swap::Guard::into_inner(previous);
        }

        let _guard = self.locator_lock.lock();
        self.locator.initialize(&self.working.load());
    }

    fn remove_working(&self, node: &Arc<Node>) {
        self.update_working(|nodes| {
            nodes
                .iter()
                .filter(|&candidate| !Arc::ptr_eq(candidate, node))
                .cloned()
                .collect()
        });
    }

    /// Re-admits `node`, keeping the configured order.
    fn add_working(&self, node: &Arc<Node>) {
        self.update_working(|nodes| {
            self.nodes
                .iter()
                .filter(|&candidate| {
                    Arc::ptr_eq(candidate, node) || nodes.iter().any(|n| Arc::ptr_eq(n, candidate))
                })
                .cloned()
                .collect()
        });
    }

    fn fail_node(self: &Arc<Self>, node: &Arc<Node>) {
        warn!(endpoint = %node.endpoint(), "removing node from working set");
        self.remove_working(node);

        if self.shutdown.is_cancelled() {
            return;
        }

        let delay = self.reconnect.schedule(node);
        if delay.is_zero() {
            if self.try_reconnect(node) {
                return;
            }
            let retry = self.reconnect.schedule(node).max(MIN_RETRY_DELAY);
            self.spawn_reconnect(node, retry);
            return;
        }
        self.spawn_reconnect(node, delay);
    }

    fn try_reconnect(&self, node: &Arc<Node>) -> bool {
        match node.connect(true, &self.shutdown) {
            Ok(()) => {
                self.reconnect.reset(node);
                self.add_working(node);
                self.wake.set();
                info!(endpoint = %node.endpoint(), "node reconnected");
                true
            }
            Err(err) => {
                error!(endpoint = %node.endpoint(), error = %err, "reconnect failed");
                false
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, node: &Arc<Node>, delay: Duration) {
        let inner = Arc::clone(self);
        let node = Arc::clone(node);
        let endpoint = node.endpoint();
        debug!(endpoint = %endpoint, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let spawned = thread::Builder::new()
            .name(format!("mcpipe-reconnect-{endpoint}"))
            .spawn(move || {
                let mut delay = delay;
                loop {
                    if inner.shutdown.wait_timeout(delay) {
                        return;
                    }
                    if inner.try_reconnect(&node) {
                        return;
                    }
                    delay = inner.reconnect.schedule(&node).max(MIN_RETRY_DELAY);
                }
            });

        match spawned {
            Ok(handle) => {
                let mut timers = self.timers.lock();
                timers.retain(|timer| !timer.is_finished());
                timers.push(handle);
            }
            Err(err) => error!(endpoint = %endpoint, error = %err, "failed to spawn reconnect timer"),
        }
    }
}
