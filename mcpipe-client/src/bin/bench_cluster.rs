//! # Cluster Benchmark Harness
//!
//! Purpose: Drive a live memcached cluster with a repeatable workload so
//! pipelined throughput can be compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Pipelining Depth**: Keep `window` operations in flight to measure the
//!    engine rather than round-trip latency.
//!
//! Usage: `bench_cluster [endpoints] [keys] [ops] [value_size] [window]`
//! where `endpoints` is a comma-separated list (default `127.0.0.1:11211`).
//! Set `RUST_LOG=mcpipe_client=debug` to watch node lifecycle events.

use std::collections::VecDeque;
use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use mcpipe_client::ops::{GetOperation, StoreMode, StoreOperation};
use mcpipe_client::{ClusterBuilder, Key, OperationFuture};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ENDPOINTS: &str = "127.0.0.1:11211";
const DEFAULT_KEY_COUNT: usize = 1 << 14;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const DEFAULT_WINDOW: usize = 256;

struct BenchConfig {
    endpoints: Vec<String>,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    value_size: usize,
    window: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let endpoints = args
            .next()
            .unwrap_or_else(|| DEFAULT_ENDPOINTS.to_string())
            .split(',')
            .map(|endpoint| endpoint.trim().to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        let key_count = parse_usize(args.next(), DEFAULT_KEY_COUNT).max(1).next_power_of_two();

        BenchConfig {
            endpoints,
            key_count,
            key_mask: key_count - 1,
            op_count: parse_usize(args.next(), DEFAULT_OP_COUNT),
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE),
            window: parse_usize(args.next(), DEFAULT_WINDOW).max(1),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; keeps the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_keys(count: usize) -> Result<Vec<Key>> {
    (0..count)
        .map(|i| Key::new(format!("bench:{i:08}")).context("building key"))
        .collect()
}

fn build_values(count: usize, size: usize, seed: u64) -> Vec<Bytes> {
    (0..count)
        .map(|i| {
            let mut value = vec![0u8; size];
            let bytes = (seed ^ i as u64).to_le_bytes();
            let copy_len = size.min(bytes.len());
            value[..copy_len].copy_from_slice(&bytes[..copy_len]);
            Bytes::from(value)
        })
        .collect()
}

/// Keeps at most `window` futures outstanding, counting failures.
struct Window {
    limit: usize,
    pending: VecDeque<OperationFuture>,
    failures: usize,
}

impl Window {
    fn new(limit: usize) -> Self {
        Window {
            limit,
            pending: VecDeque::with_capacity(limit),
            failures: 0,
        }
    }

    fn push(&mut self, future: OperationFuture) {
        if self.pending.len() >= self.limit {
            self.settle_one();
        }
        self.pending.push_back(future);
    }

    fn drain(&mut self) -> usize {
        while !self.pending.is_empty() {
            self.settle_one();
        }
        std::mem::take(&mut self.failures)
    }

    fn settle_one(&mut self) {
        if let Some(future) = self.pending.pop_front() {
            match future.wait() {
                Ok(result) => {
                    black_box(result);
                }
                Err(_) => self.failures += 1,
            }
        }
    }
}

fn report(label: &str, ops: usize, failures: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.2} us/op, {failures} failed)"
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("bench_cluster failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args();
    if config.endpoints.is_empty() {
        bail!("no endpoints given");
    }

    let cluster = ClusterBuilder::new()
        .endpoints(config.endpoints.iter().cloned())
        .connect_timeout(Duration::from_secs(2))
        .start()
        .context("starting cluster")?;
    info!(endpoints = ?config.endpoints, "cluster ready");

    let keys = build_keys(config.key_count)?;
    let values = build_values(config.key_count, config.value_size, 0x5A5A_5A5A_5A5A_5A5A);

    println!(
        "keys={}, ops={}, value_size={}, window={}",
        config.key_count, config.op_count, config.value_size, config.window
    );

    let mut window = Window::new(config.window);
    let start = Instant::now();
    for (key, value) in keys.iter().zip(&values) {
        window.push(cluster.execute(Box::new(StoreOperation::new(StoreMode::Set, key.clone(), value.clone()))));
    }
    let failures = window.drain();
    report("LOAD", config.key_count, failures, start.elapsed());

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        window.push(cluster.execute(Box::new(GetOperation::new(keys[idx].clone()))));
    }
    let failures = window.drain();
    report("GET", config.op_count, failures, start.elapsed());

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        let op = StoreOperation::new(StoreMode::Set, keys[idx].clone(), values[idx].clone()).quiet();
        window.push(cluster.execute(Box::new(op)));
    }
    let failures = window.drain();
    report("SETQ", config.op_count, failures, start.elapsed());

    cluster.shutdown();
    Ok(())
}
