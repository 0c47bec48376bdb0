use ethers::{types::{Address, H256}, utils::to_checksum};
use parking_lot::RwLock;

use super::{error::MempoolResult, pool::PoolInner, PoolOperation};
use crate::common::types::{EntryPointVersion, UserOperation};

/// User operation mempool for a single entry point.
///
/// Wrapper around a pool object that implements thread-safety via a RwLock.
/// Safe to call from multiple threads; mutations block on the write lock, and
/// validation plus duplicate detection run under it so a concurrent add of
/// the same operation cannot slip through.
pub struct UoPool {
    version: EntryPointVersion,
    entry_point: Address,
    state: RwLock<PoolInner>,
}

impl UoPool {
    pub fn new(version: EntryPointVersion, chain_id: u64) -> Self {
        let entry_point = version.address();
        Self {
            version,
            entry_point,
            state: RwLock::new(PoolInner::new(entry_point, chain_id)),
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn version(&self) -> EntryPointVersion {
        self.version
    }

    /// Validates and appends an operation, returning its canonical hash.
    pub fn add_operation(&self, op: UserOperation) -> MempoolResult<H256> {
        let mut state = self.state.write();
        let hash = state.add_operation(op)?;
        self.record_size(state.size());
        Ok(hash)
    }

    pub fn remove_by_index(&self, index: usize) -> MempoolResult<PoolOperation> {
        let mut state = self.state.write();
        let op = state.remove_by_index(index)?;
        self.record_size(state.size());
        Ok(op)
    }

    /// Removes `[begin, end)`, preserving the relative order of survivors.
    pub fn remove_by_index_range(&self, begin: usize, end: usize) -> MempoolResult<usize> {
        let mut state = self.state.write();
        let removed = state.remove_by_index_range(begin, end)?;
        self.record_size(state.size());
        Ok(removed)
    }

    pub fn get_by_index(&self, index: usize) -> MempoolResult<PoolOperation> {
        self.state.read().get_by_index(index)
    }

    pub fn get_all(&self) -> Vec<PoolOperation> {
        self.state.read().get_all()
    }

    pub fn get_range(&self, begin: usize, end: usize) -> MempoolResult<Vec<PoolOperation>> {
        self.state.read().get_range(begin, end)
    }

    /// Copies out the first `min(max, size)` operations under a single lock
    /// acquisition, so the clamp cannot race a concurrent clear.
    pub fn bundle_prefix(&self, max: usize) -> Vec<PoolOperation> {
        let state = self.state.read();
        let end = max.min(state.size());
        state
            .get_range(0, end)
            .expect("prefix range is clamped to pool size")
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.clear();
        self.record_size(0);
    }

    pub fn size(&self) -> usize {
        self.state.read().size()
    }

    fn record_size(&self, size: usize) {
        metrics::gauge!(
            "op_pool_size",
            size as f64,
            "entry_point" => to_checksum(&self.entry_point, None)
        );
    }
}
