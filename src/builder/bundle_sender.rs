use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, TransactionRequest, H256, U256,
};
use parking_lot::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use super::key_pool::{KeyPool, KeyPoolError};
use crate::{
    common::{
        eth::ProviderLike,
        handle::Task,
        math,
        simulation::BundleSimulator,
        types::{handle_ops_calldata, UserOperation},
    },
    op_pool::{PoolOperation, UoPool},
};

// Overhead on gas estimates to account for inaccuracies.
const GAS_ESTIMATE_OVERHEAD_PERCENT: u64 = 10;

// Number of failed bundle simulations after which an operation is evicted.
const MAX_BUNDLE_SIMULATION_FAILURES: u32 = 3;

/// Bundle sender settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub interval: Duration,
    pub max_bundle_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_bundle_size: 5,
        }
    }
}

/// Pause control over a running bundle sender.
pub trait BundlerControl: Send + Sync + 'static {
    fn pause(&self);
    fn unpause(&self);
    fn is_paused(&self) -> bool;
}

/// Outcome of a single bundling pass.
#[derive(Debug)]
pub enum SendBundleResult {
    Success {
        tx_hash: H256,
        op_count: usize,
        key: Address,
    },
    NoOperations,
    Paused,
    SimulationFailed {
        reason: String,
        evicted: usize,
    },
    Cancelled,
    Error(anyhow::Error),
}

/// Periodically drains a prefix of one mempool into a `handleOps`
/// transaction.
///
/// Each tick simulates the prefix, submits it through the key pool, and
/// removes it from the mempool on success. Ticks run strictly sequentially.
pub struct BundleSender<S, P> {
    entry_point: Address,
    beneficiary: Address,
    mempool: Arc<UoPool>,
    key_pool: Arc<KeyPool<P>>,
    simulator: S,
    settings: Settings,
    paused: AtomicBool,
    // Failed-simulation counts by operation hash, bundle-granular: a failed
    // simulation cannot attribute fault to a single operation, so every
    // operation of the failed bundle is charged.
    sim_failures: Mutex<HashMap<H256, u32>>,
}

impl<S, P> BundleSender<S, P>
where
    S: BundleSimulator,
    P: ProviderLike,
{
    pub fn new(
        beneficiary: Address,
        mempool: Arc<UoPool>,
        key_pool: Arc<KeyPool<P>>,
        simulator: S,
        settings: Settings,
    ) -> Self {
        Self {
            entry_point: mempool.entry_point(),
            beneficiary,
            mempool,
            key_pool,
            simulator,
            settings,
            paused: AtomicBool::new(false),
            sim_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Loops until cancelled, attempting to form and send a bundle on each
    /// tick. Ticks never overlap; a long submission delays the next tick.
    pub async fn send_bundles_in_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting bundle sender for entry point {:?} with {:?} interval",
            self.entry_point, self.settings.interval
        );

        let mut ticker = time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Bundle sender for entry point {:?} stopped", self.entry_point);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.send_bundle(&shutdown).await {
                SendBundleResult::Success {
                    tx_hash,
                    op_count,
                    key,
                } => {
                    BuilderMetrics::increment_bundle_txns_success();
                    info!("Bundle with {op_count} ops submitted as {tx_hash:?} from key {key:?}");
                }
                SendBundleResult::NoOperations => trace!("No operations to bundle"),
                SendBundleResult::Paused => trace!("Bundle sender is paused"),
                SendBundleResult::SimulationFailed { reason, evicted } => {
                    warn!("Bundle simulation failed: {reason} ({evicted} ops evicted)");
                }
                SendBundleResult::Cancelled => {
                    info!("Bundle sender for entry point {:?} stopped", self.entry_point);
                    return;
                }
                SendBundleResult::Error(err) => {
                    BuilderMetrics::increment_bundle_txns_failed();
                    error!("Failed to send bundle. Will retry next tick: {err:#}");
                }
            }
        }
    }

    /// Runs one bundling pass.
    pub async fn send_bundle(&self, shutdown: &CancellationToken) -> SendBundleResult {
        match self.send_bundle_inner(shutdown).await {
            Ok(result) => result,
            Err(error) => SendBundleResult::Error(error),
        }
    }

    /// Helper function returning `Result` to be able to use `?`.
    async fn send_bundle_inner(
        &self,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<SendBundleResult> {
        if self.is_paused() {
            return Ok(SendBundleResult::Paused);
        }

        let ops = self.mempool.bundle_prefix(self.settings.max_bundle_size);
        if ops.is_empty() {
            return Ok(SendBundleResult::NoOperations);
        }
        let op_count = ops.len();
        let uos = ops.iter().map(|op| op.uo.clone()).collect::<Vec<_>>();

        let sim_result = self
            .simulator
            .simulate_bundle(self.entry_point, &uos)
            .await?;
        if !sim_result.success {
            let reason = sim_result
                .error
                .unwrap_or_else(|| "unknown simulation failure".to_owned());
            let evicted = self.record_simulation_failure(&ops);
            return Ok(SendBundleResult::SimulationFailed { reason, evicted });
        }

        let tx = self.bundle_transaction(&uos, sim_result.gas_used);
        BuilderMetrics::increment_bundle_txns_sent();
        let (tx_hash, key) = match self.key_pool.submit_transaction(shutdown, tx).await {
            Ok(sent) => sent,
            Err(KeyPoolError::Cancelled) => return Ok(SendBundleResult::Cancelled),
            Err(err) => return Err(anyhow::Error::from(err)),
        };

        // The submitted prefix leaves the pool before the key goes back, even
        // if the removal itself fails.
        let removed = self.mempool.remove_by_index_range(0, op_count);
        self.key_pool.release_key(key);
        if let Err(err) = removed {
            warn!("Failed to remove submitted ops from mempool: {err}");
        }
        self.forget_failures(&ops);

        Ok(SendBundleResult::Success {
            tx_hash,
            op_count,
            key,
        })
    }

    fn bundle_transaction(&self, uos: &[Arc<UserOperation>], gas_used: u64) -> TypedTransaction {
        let packed = uos.iter().map(|uo| uo.pack()).collect::<Vec<_>>();
        let calldata = handle_ops_calldata(&packed, self.beneficiary);
        let gas = math::increase_by_percent(U256::from(gas_used), GAS_ESTIMATE_OVERHEAD_PERCENT);
        TransactionRequest::new()
            .to(self.entry_point)
            .gas(gas)
            .data(calldata)
            .into()
    }

    /// Charges every operation of a failed bundle and evicts the ones that
    /// reached the failure limit. Returns the number of evicted operations.
    fn record_simulation_failure(&self, ops: &[PoolOperation]) -> usize {
        let over_limit = {
            let mut failures = self.sim_failures.lock();
            ops.iter()
                .filter(|op| {
                    let count = failures.entry(op.hash).or_insert(0);
                    *count += 1;
                    *count >= MAX_BUNDLE_SIMULATION_FAILURES
                })
                .map(|op| op.hash)
                .collect::<HashSet<_>>()
        };
        if over_limit.is_empty() {
            return 0;
        }

        // Walk indexes back to front so earlier removals do not shift later
        // ones.
        let indexes = self
            .mempool
            .get_all()
            .iter()
            .enumerate()
            .filter(|(_, op)| over_limit.contains(&op.hash))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let mut evicted = 0;
        for index in indexes.into_iter().rev() {
            match self.mempool.remove_by_index(index) {
                Ok(op) => {
                    warn!(
                        "Evicting userOp {:?} after {MAX_BUNDLE_SIMULATION_FAILURES} failed simulations",
                        op.hash
                    );
                    self.sim_failures.lock().remove(&op.hash);
                    BuilderMetrics::increment_ops_evicted();
                    evicted += 1;
                }
                Err(err) => warn!("Failed to evict userOp: {err}"),
            }
        }
        evicted
    }

    fn forget_failures(&self, ops: &[PoolOperation]) {
        let mut failures = self.sim_failures.lock();
        for op in ops {
            failures.remove(&op.hash);
        }
    }
}

impl<S, P> BundlerControl for BundleSender<S, P>
where
    S: BundleSimulator,
    P: ProviderLike,
{
    fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Bundle sender for entry point {:?} paused", self.entry_point);
        }
    }

    fn unpause(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(
                "Bundle sender for entry point {:?} unpaused",
                self.entry_point
            );
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Task adapter running a bundle sender under the process shutdown umbrella.
pub struct BundlerTask<S, P> {
    sender: Arc<BundleSender<S, P>>,
}

impl<S, P> BundlerTask<S, P> {
    pub fn new(sender: Arc<BundleSender<S, P>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S, P> Task for BundlerTask<S, P>
where
    S: BundleSimulator,
    P: ProviderLike,
{
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        self.sender.send_bundles_in_loop(shutdown_token).await;
        Ok(())
    }
}

struct BuilderMetrics {}

impl BuilderMetrics {
    fn increment_bundle_txns_sent() {
        metrics::increment_counter!("builder_bundle_txns_sent");
    }

    fn increment_bundle_txns_success() {
        metrics::increment_counter!("builder_bundle_txns_success");
    }

    fn increment_bundle_txns_failed() {
        metrics::increment_counter!("builder_bundle_txns_failed");
    }

    fn increment_ops_evicted() {
        metrics::increment_counter!("builder_ops_evicted");
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::U256;

    use super::*;
    use crate::common::{
        eth::MockProviderLike,
        simulation::{MockBundleSimulator, SimulationResult},
        types::EntryPointVersion,
    };

    const KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn create_op(nonce: u64) -> UserOperation {
        UserOperation {
            sender: Address::random(),
            nonce: nonce.into(),
            call_gas_limit: 10_000.into(),
            verification_gas_limit: 100_000.into(),
            pre_verification_gas: 100.into(),
            max_fee_per_gas: 99_999.into(),
            signature: "0x00".parse().unwrap(),
            ..UserOperation::default()
        }
    }

    fn filled_pool(count: u64) -> Arc<UoPool> {
        let pool = Arc::new(UoPool::new(EntryPointVersion::V0_7, 1337));
        for nonce in 0..count {
            pool.add_operation(create_op(nonce)).unwrap();
        }
        pool
    }

    fn submitting_key_pool() -> Arc<KeyPool<MockProviderLike>> {
        let mut provider = MockProviderLike::new();
        provider
            .expect_transaction_count()
            .returning(|_| Ok(U256::zero()));
        provider.expect_gas_price().returning(|| Ok(U256::from(1)));
        provider
            .expect_send_raw_transaction()
            .returning(|_| Ok(H256::random()));
        Arc::new(KeyPool::new(&[KEY_0.to_owned()], Arc::new(provider), 1337).unwrap())
    }

    fn passing_simulator() -> MockBundleSimulator {
        let mut simulator = MockBundleSimulator::new();
        simulator.expect_simulate_bundle().returning(|_, _| {
            Ok(SimulationResult {
                success: true,
                gas_used: 1_000_000,
                error: None,
            })
        });
        simulator
    }

    fn failing_simulator() -> MockBundleSimulator {
        let mut simulator = MockBundleSimulator::new();
        simulator.expect_simulate_bundle().returning(|_, _| {
            Ok(SimulationResult {
                success: false,
                gas_used: 0,
                error: Some("AA25 invalid account nonce".to_owned()),
            })
        });
        simulator
    }

    fn sender(
        mempool: Arc<UoPool>,
        simulator: MockBundleSimulator,
    ) -> BundleSender<MockBundleSimulator, MockProviderLike> {
        BundleSender::new(
            Address::random(),
            mempool,
            submitting_key_pool(),
            simulator,
            Settings {
                interval: Duration::from_millis(10),
                max_bundle_size: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_submits_and_removes_prefix() {
        let mempool = filled_pool(7);
        let before = mempool.get_all();
        let bundler = sender(mempool.clone(), passing_simulator());

        match bundler.send_bundle(&CancellationToken::new()).await {
            SendBundleResult::Success { op_count, .. } => assert_eq!(op_count, 5),
            other => panic!("expected success, got {other:?}"),
        }

        // ops 5 and 6 survive, in order, and the key is back in the pool
        let after = mempool.get_all();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], before[5]);
        assert_eq!(after[1], before[6]);
        assert_eq!(bundler.key_pool.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_mempool_skips() {
        let bundler = sender(filled_pool(0), MockBundleSimulator::new());

        assert!(matches!(
            bundler.send_bundle(&CancellationToken::new()).await,
            SendBundleResult::NoOperations
        ));
    }

    #[tokio::test]
    async fn test_paused_skips() {
        let mempool = filled_pool(3);
        let bundler = sender(mempool.clone(), MockBundleSimulator::new());

        bundler.pause();
        bundler.pause();
        assert!(bundler.is_paused());
        assert!(matches!(
            bundler.send_bundle(&CancellationToken::new()).await,
            SendBundleResult::Paused
        ));
        assert_eq!(mempool.size(), 3);

        bundler.unpause();
        bundler.unpause();
        assert!(!bundler.is_paused());
    }

    #[tokio::test]
    async fn test_simulation_failure_retains_bundle() {
        let mempool = filled_pool(3);
        let bundler = sender(mempool.clone(), failing_simulator());

        match bundler.send_bundle(&CancellationToken::new()).await {
            SendBundleResult::SimulationFailed { reason, evicted } => {
                assert!(reason.contains("AA25"));
                assert_eq!(evicted, 0);
            }
            other => panic!("expected simulation failure, got {other:?}"),
        }
        assert_eq!(mempool.size(), 3);
        assert_eq!(bundler.key_pool.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_simulation_failures_evict() {
        let mempool = filled_pool(3);
        let bundler = sender(mempool.clone(), failing_simulator());
        let shutdown = CancellationToken::new();

        for _ in 0..MAX_BUNDLE_SIMULATION_FAILURES - 1 {
            match bundler.send_bundle(&shutdown).await {
                SendBundleResult::SimulationFailed { evicted, .. } => assert_eq!(evicted, 0),
                other => panic!("expected simulation failure, got {other:?}"),
            }
        }
        assert_eq!(mempool.size(), 3);

        match bundler.send_bundle(&shutdown).await {
            SendBundleResult::SimulationFailed { evicted, .. } => assert_eq!(evicted, 3),
            other => panic!("expected simulation failure, got {other:?}"),
        }
        assert_eq!(mempool.size(), 0);
    }

    #[tokio::test]
    async fn test_submission_success_resets_failure_counts() {
        let mempool = filled_pool(1);
        let mut simulator = MockBundleSimulator::new();
        let mut outcomes = vec![false, false, true].into_iter();
        simulator.expect_simulate_bundle().returning(move |_, _| {
            let success = outcomes.next().unwrap_or(true);
            Ok(SimulationResult {
                success,
                gas_used: 1_000_000,
                error: (!success).then(|| "transient".to_owned()),
            })
        });
        let bundler = sender(mempool.clone(), simulator);
        let shutdown = CancellationToken::new();

        // two failures, then a success clears the slate
        assert!(matches!(
            bundler.send_bundle(&shutdown).await,
            SendBundleResult::SimulationFailed { evicted: 0, .. }
        ));
        assert!(matches!(
            bundler.send_bundle(&shutdown).await,
            SendBundleResult::SimulationFailed { evicted: 0, .. }
        ));
        assert!(matches!(
            bundler.send_bundle(&shutdown).await,
            SendBundleResult::Success { op_count: 1, .. }
        ));
        assert_eq!(mempool.size(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_retains_bundle_and_releases_key() {
        let mut provider = MockProviderLike::new();
        provider
            .expect_transaction_count()
            .returning(|_| Ok(U256::zero()));
        provider.expect_gas_price().returning(|| Ok(U256::from(1)));
        provider
            .expect_send_raw_transaction()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));
        let key_pool =
            Arc::new(KeyPool::new(&[KEY_0.to_owned()], Arc::new(provider), 1337).unwrap());

        let mempool = filled_pool(2);
        let bundler = BundleSender::new(
            Address::random(),
            mempool.clone(),
            key_pool.clone(),
            passing_simulator(),
            Settings::default(),
        );

        assert!(matches!(
            bundler.send_bundle(&CancellationToken::new()).await,
            SendBundleResult::Error(_)
        ));
        assert_eq!(mempool.size(), 2);
        assert_eq!(key_pool.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancellation() {
        let mempool = filled_pool(0);
        let bundler = Arc::new(sender(mempool, MockBundleSimulator::new()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(bundler.send_bundles_in_loop(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop promptly after cancellation")
            .unwrap();
    }
}
