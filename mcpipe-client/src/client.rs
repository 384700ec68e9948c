//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over a running `Cluster` for
//! callers that do not want to handle operation futures.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `MemcachedClient` hides routing, pipelining and the
//!    binary protocol.
//! 2. **Borrow-Friendly API**: Keys are accepted as `&[u8]`.
//! 3. **Expected Misses Are Values**: A missing key is `None` or `false`; only
//!    unexpected statuses become `ClientError::Status`.
//!
//! ## Usage Notes
//!
//! - Every call blocks the current thread until the driver resolves it; do not
//!   call it from inside an async runtime. Use `Cluster::execute` and `.await`
//!   there instead.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use mcpipe_common::{ClientError, ClientResult, Expiration, Key, Status};

use crate::cluster::Cluster;
use crate::config::{ClusterBuilder, ClusterConfig};
use crate::operation::{Operation, OperationResult, Payload};
use crate::ops::{
    ConcatMode, ConcatOperation, DeleteOperation, FlushOperation, GetOperation, MutateMode,
    MutateOperation, StatsOperation, StoreMode, StoreOperation, TouchOperation,
};

/// A stored value as returned by the get family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub flags: u32,
    pub value: Bytes,
    pub cas: u64,
}

/// Statistics reported by one server.
pub type ServerStats = Vec<(String, String)>;

/// Blocking client over a shared cluster.
#[derive(Debug, Clone)]
pub struct MemcachedClient {
    cluster: Arc<Cluster>,
}

impl MemcachedClient {
    /// Starts a cluster over `endpoints` with default settings.
    pub fn connect<I, S>(endpoints: I) -> ClientResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = ClusterBuilder::new().endpoints(endpoints).start()?;
        Ok(Self::from_cluster(Arc::new(cluster)))
    }

    pub fn with_config(config: ClusterConfig) -> ClientResult<Self> {
        let cluster = ClusterBuilder::from_config(config).start()?;
        Ok(Self::from_cluster(Arc::new(cluster)))
    }

    /// Wraps an existing (started) cluster, e.g. one from a `ClusterRegistry`.
    pub fn from_cluster(cluster: Arc<Cluster>) -> Self {
        MemcachedClient { cluster }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Item>> {
        let result = self.run(GetOperation::new(to_key(key)?))?;
        item_or_miss(result)
    }

    /// Fetches many keys in one pipelined batch; results follow `keys` order.
    pub fn get_many(&self, keys: &[&[u8]]) -> ClientResult<Vec<Option<Item>>> {
        let ops = keys
            .iter()
            .map(|key| -> ClientResult<Box<dyn Operation>> {
                Ok(Box::new(GetOperation::new(to_key(key)?).quiet()))
            })
            .collect::<ClientResult<Vec<_>>>()?;

        self.cluster
            .execute_many(ops)
            .into_iter()
            .map(|future| item_or_miss(future.wait()?))
            .collect()
    }

    /// Fetches a value and resets its expiration.
    pub fn get_and_touch(&self, key: &[u8], expiration: Expiration) -> ClientResult<Option<Item>> {
        let result = self.run(GetOperation::get_and_touch(to_key(key)?, expiration))?;
        item_or_miss(result)
    }

    /// Stores a value unconditionally. Returns the new CAS token.
    pub fn set(&self, key: &[u8], value: &[u8], expiration: Expiration) -> ClientResult<u64> {
        let op = StoreOperation::new(StoreMode::Set, to_key(key)?, Bytes::copy_from_slice(value))
            .expiration(expiration);
        Ok(self.run(op)?.into_success()?.cas)
    }

    /// Stores a value only if the key is absent. Returns false if it exists.
    pub fn add(&self, key: &[u8], value: &[u8], expiration: Expiration) -> ClientResult<bool> {
        let op = StoreOperation::new(StoreMode::Add, to_key(key)?, Bytes::copy_from_slice(value))
            .expiration(expiration);
        stored(self.run(op)?, &[Status::KeyExists])
    }

    /// Stores a value only if the key exists. Returns false if it is missing.
    pub fn replace(&self, key: &[u8], value: &[u8], expiration: Expiration) -> ClientResult<bool> {
        let op = StoreOperation::new(StoreMode::Replace, to_key(key)?, Bytes::copy_from_slice(value))
            .expiration(expiration);
        stored(self.run(op)?, &[Status::KeyNotFound])
    }

    /// Stores a value only if the item still carries `cas`. Returns false when
    /// it was modified or removed in the meantime.
    pub fn cas(&self, key: &[u8], value: &[u8], expiration: Expiration, cas: u64) -> ClientResult<bool> {
        let op = StoreOperation::new(StoreMode::Set, to_key(key)?, Bytes::copy_from_slice(value))
            .expiration(expiration)
            .cas(cas);
        stored(self.run(op)?, &[Status::KeyExists, Status::KeyNotFound])
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        stored(self.run(DeleteOperation::new(to_key(key)?))?, &[Status::KeyNotFound])
    }

    /// Adds `delta` to a counter, creating it with `initial` if missing.
    pub fn increment(&self, key: &[u8], delta: u64, initial: u64, expiration: Expiration) -> ClientResult<u64> {
        self.mutate(MutateMode::Increment, key, delta, initial, expiration)
    }

    /// Subtracts `delta` from a counter (saturating at zero on the server).
    pub fn decrement(&self, key: &[u8], delta: u64, initial: u64, expiration: Expiration) -> ClientResult<u64> {
        self.mutate(MutateMode::Decrement, key, delta, initial, expiration)
    }

    /// Resets a key's expiration. Returns false if the key is missing.
    pub fn touch(&self, key: &[u8], expiration: Expiration) -> ClientResult<bool> {
        stored(self.run(TouchOperation::new(to_key(key)?, expiration))?, &[Status::KeyNotFound])
    }

    /// Appends to an existing value. Returns false if the key is missing.
    pub fn append(&self, key: &[u8], data: &[u8]) -> ClientResult<bool> {
        self.concat(ConcatMode::Append, key, data)
    }

    /// Prepends to an existing value. Returns false if the key is missing.
    pub fn prepend(&self, key: &[u8], data: &[u8]) -> ClientResult<bool> {
        self.concat(ConcatMode::Prepend, key, data)
    }

    /// Invalidates all items on every node. Fails if any node failed.
    pub fn flush_all(&self) -> ClientResult<()> {
        let results = self.cluster.broadcast(|| Box::new(FlushOperation::new())).wait()?;
        for node in results {
            node.result?.into_success()?;
        }
        Ok(())
    }

    /// Collects statistics from every node; dead nodes report their error.
    pub fn stats(&self) -> ClientResult<Vec<(SocketAddr, ClientResult<ServerStats>)>> {
        let results = self.cluster.broadcast(|| Box::new(StatsOperation::new())).wait()?;
        Ok(results
            .into_iter()
            .map(|node| {
                let stats = node
                    .result
                    .and_then(OperationResult::into_success)
                    .and_then(|result| match result.payload {
                        Payload::Stats(stats) => Ok(stats),
                        other => Err(unexpected(&other)),
                    });
                (node.endpoint, stats)
            })
            .collect())
    }

    fn mutate(
        &self,
        mode: MutateMode,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: Expiration,
    ) -> ClientResult<u64> {
        let op = MutateOperation::new(mode, to_key(key)?, delta)
            .initial(initial)
            .expiration(expiration);
        match self.run(op)?.into_success()?.payload {
            Payload::Counter(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    fn concat(&self, mode: ConcatMode, key: &[u8], data: &[u8]) -> ClientResult<bool> {
        let op = ConcatOperation::new(mode, to_key(key)?, Bytes::copy_from_slice(data));
        stored(self.run(op)?, &[Status::ItemNotStored, Status::KeyNotFound])
    }

    fn run(&self, op: impl Operation + 'static) -> ClientResult<OperationResult> {
        self.cluster.execute(Box::new(op)).wait()
    }
}

fn to_key(key: &[u8]) -> ClientResult<Key> {
    Key::try_from(key)
}

fn unexpected(payload: &Payload) -> ClientError {
    ClientError::Protocol(format!("unexpected payload {payload:?}"))
}

fn item_or_miss(result: OperationResult) -> ClientResult<Option<Item>> {
    if result.status == Status::KeyNotFound {
        return Ok(None);
    }
    let OperationResult { cas, payload, .. } = result.into_success()?;
    match payload {
        Payload::Item { flags, value } => Ok(Some(Item { flags, value, cas })),
        other => Err(unexpected(&other)),
    }
}

/// Ok(true) on success, Ok(false) on one of the `expected` statuses.
fn stored(result: OperationResult, expected: &[Status]) -> ClientResult<bool> {
    if expected.contains(&result.status) {
        return Ok(false);
    }
    result.into_success().map(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_status(status: Status) -> OperationResult {
        OperationResult::new(status)
    }

    #[test]
    fn miss_is_none() {
        assert_eq!(item_or_miss(with_status(Status::KeyNotFound)).unwrap(), None);
    }

    #[test]
    fn hit_carries_cas() {
        let result = OperationResult {
            status: Status::NoError,
            cas: 7,
            payload: Payload::Item {
                flags: 1,
                value: Bytes::from_static(b"v"),
            },
        };
        let item = item_or_miss(result).unwrap().unwrap();
        assert_eq!(item.cas, 7);
        assert_eq!(item.flags, 1);
        assert_eq!(item.value, "v");
    }

    #[test]
    fn unexpected_status_is_error() {
        assert!(matches!(
            item_or_miss(with_status(Status::OutOfMemory)),
            Err(ClientError::Status(Status::OutOfMemory))
        ));
        assert!(matches!(
            stored(with_status(Status::ValueTooLarge), &[Status::KeyExists]),
            Err(ClientError::Status(Status::ValueTooLarge))
        ));
    }

    #[test]
    fn expected_status_is_false() {
        assert!(!stored(with_status(Status::KeyExists), &[Status::KeyExists]).unwrap());
        assert!(stored(OperationResult::success(), &[Status::KeyExists]).unwrap());
    }

    #[test]
    fn hit_without_item_is_protocol_error() {
        assert!(matches!(item_or_miss(OperationResult::success()), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn long_key_rejected_before_sending() {
        assert!(matches!(to_key(&[b'k'; 300]), Err(ClientError::KeyTooLong { len: 300 })));
    }
}
