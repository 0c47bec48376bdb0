use std::{collections::HashMap, sync::Arc};

use ethers::types::{Address, H256};

use super::{
    error::{MempoolError, MempoolResult},
    PoolOperation,
};
use crate::common::types::UserOperation;

/// Pool of user operations for a single entry point.
///
/// Keeps an insertion-ordered sequence alongside a hash index. The two are
/// only ever updated together; `ops.len() == by_hash.len()` at every return.
#[derive(Debug)]
pub(crate) struct PoolInner {
    // Address of the entry point this pool targets
    entry_point: Address,
    // Chain ID this pool targets
    chain_id: u64,
    // Operations in insertion order
    ops: Vec<PoolOperation>,
    // Operations by canonical hash
    by_hash: HashMap<H256, Arc<UserOperation>>,
}

impl PoolInner {
    pub(crate) fn new(entry_point: Address, chain_id: u64) -> Self {
        Self {
            entry_point,
            chain_id,
            ops: Vec::new(),
            by_hash: HashMap::new(),
        }
    }

    /// Validates the operation, rejects duplicates by canonical hash, and
    /// appends it to the pool.
    pub(crate) fn add_operation(&mut self, op: UserOperation) -> MempoolResult<H256> {
        op.validate()?;

        let hash = op.op_hash(self.entry_point, self.chain_id);
        if self.by_hash.contains_key(&hash) {
            return Err(MempoolError::DuplicateOperation(hash));
        }

        let uo = Arc::new(op);
        self.by_hash.insert(hash, uo.clone());
        self.ops.push(PoolOperation { hash, uo });
        debug_assert_eq!(self.ops.len(), self.by_hash.len());

        Ok(hash)
    }

    pub(crate) fn remove_by_index(&mut self, index: usize) -> MempoolResult<PoolOperation> {
        if index >= self.ops.len() {
            return Err(MempoolError::IndexOutOfRange(index, self.ops.len()));
        }
        let op = self.ops.remove(index);
        self.by_hash.remove(&op.hash);
        debug_assert_eq!(self.ops.len(), self.by_hash.len());
        Ok(op)
    }

    /// Removes `[begin, end)`, preserving the relative order of survivors.
    pub(crate) fn remove_by_index_range(
        &mut self,
        begin: usize,
        end: usize,
    ) -> MempoolResult<usize> {
        self.check_range(begin, end)?;
        let Self { ops, by_hash, .. } = self;
        let mut removed = 0;
        for op in ops.drain(begin..end) {
            by_hash.remove(&op.hash);
            removed += 1;
        }
        debug_assert_eq!(self.ops.len(), self.by_hash.len());
        Ok(removed)
    }

    pub(crate) fn get_by_index(&self, index: usize) -> MempoolResult<PoolOperation> {
        self.ops
            .get(index)
            .cloned()
            .ok_or(MempoolError::IndexOutOfRange(index, self.ops.len()))
    }

    pub(crate) fn get_all(&self) -> Vec<PoolOperation> {
        self.ops.clone()
    }

    pub(crate) fn get_range(&self, begin: usize, end: usize) -> MempoolResult<Vec<PoolOperation>> {
        self.check_range(begin, end)?;
        Ok(self.ops[begin..end].to_vec())
    }

    pub(crate) fn clear(&mut self) {
        self.ops.clear();
        self.by_hash.clear();
    }

    pub(crate) fn size(&self) -> usize {
        self.ops.len()
    }

    fn check_range(&self, begin: usize, end: usize) -> MempoolResult<()> {
        if begin > end || end > self.ops.len() {
            return Err(MempoolError::InvalidRange(begin, end, self.ops.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Bytes;

    use super::*;
    use crate::common::types::UserOpViolation;

    const ENTRY_POINT: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";
    const CHAIN_ID: u64 = 1337;

    fn new_pool() -> PoolInner {
        PoolInner::new(ENTRY_POINT.parse().unwrap(), CHAIN_ID)
    }

    fn create_op(sender: Address, nonce: u64) -> UserOperation {
        UserOperation {
            sender,
            nonce: nonce.into(),
            call_gas_limit: 10_000.into(),
            verification_gas_limit: 100_000.into(),
            pre_verification_gas: 100.into(),
            max_fee_per_gas: 99_999.into(),
            max_priority_fee_per_gas: 9_999.into(),
            signature: "0x00".parse().unwrap(),
            ..UserOperation::default()
        }
    }

    #[test]
    fn test_add_single_op() {
        let mut pool = new_pool();
        let op = create_op(Address::random(), 0);

        let hash = pool.add_operation(op.clone()).unwrap();

        assert_eq!(hash, op.op_hash(ENTRY_POINT.parse().unwrap(), CHAIN_ID));
        assert_eq!(pool.size(), 1);
        assert_eq!(*pool.get_by_index(0).unwrap().uo, op);
    }

    #[test]
    fn test_add_preserves_insertion_order() {
        let mut pool = new_pool();
        let ops = (0..5).map(|i| create_op(Address::random(), i)).collect::<Vec<_>>();
        for op in &ops {
            pool.add_operation(op.clone()).unwrap();
        }

        let all = pool.get_all();
        assert_eq!(all.len(), ops.len());
        for (stored, expected) in all.iter().zip(&ops) {
            assert_eq!(*stored.uo, *expected);
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pool = new_pool();
        let op = create_op(Address::random(), 0);

        pool.add_operation(op.clone()).unwrap();
        match pool.add_operation(op) {
            Err(MempoolError::DuplicateOperation(_)) => {}
            other => panic!("expected duplicate error, got {other:?}"),
        }
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_invalid_op_rejected() {
        let mut pool = new_pool();
        let mut op = create_op(Address::random(), 0);
        op.signature = Bytes::new();

        match pool.add_operation(op) {
            Err(MempoolError::InvalidOperation(UserOpViolation::EmptySignature)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_remove_by_index() {
        let mut pool = new_pool();
        let ops = (0..3).map(|i| create_op(Address::random(), i)).collect::<Vec<_>>();
        for op in &ops {
            pool.add_operation(op.clone()).unwrap();
        }

        let removed = pool.remove_by_index(1).unwrap();
        assert_eq!(*removed.uo, ops[1]);
        assert_eq!(pool.size(), 2);
        assert_eq!(*pool.get_by_index(0).unwrap().uo, ops[0]);
        assert_eq!(*pool.get_by_index(1).unwrap().uo, ops[2]);

        // removed hash is free for re-insertion
        pool.add_operation(ops[1].clone()).unwrap();
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_remove_by_index_out_of_range() {
        let mut pool = new_pool();
        pool.add_operation(create_op(Address::random(), 0)).unwrap();

        match pool.remove_by_index(1) {
            Err(MempoolError::IndexOutOfRange(1, 1)) => {}
            other => panic!("expected out of range error, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_prefix_preserves_survivor_order() {
        let mut pool = new_pool();
        let ops = (0..7).map(|i| create_op(Address::random(), i)).collect::<Vec<_>>();
        for op in &ops {
            pool.add_operation(op.clone()).unwrap();
        }

        assert_eq!(pool.remove_by_index_range(0, 5).unwrap(), 5);
        assert_eq!(pool.size(), 2);
        let survivors = pool.get_all();
        assert_eq!(*survivors[0].uo, ops[5]);
        assert_eq!(*survivors[1].uo, ops[6]);
    }

    #[test]
    fn test_remove_range_bounds() {
        let mut pool = new_pool();
        for i in 0..3 {
            pool.add_operation(create_op(Address::random(), i)).unwrap();
        }

        assert!(matches!(
            pool.remove_by_index_range(2, 1),
            Err(MempoolError::InvalidRange(2, 1, 3))
        ));
        assert!(matches!(
            pool.remove_by_index_range(0, 4),
            Err(MempoolError::InvalidRange(0, 4, 3))
        ));
        // empty range is a no-op
        assert_eq!(pool.remove_by_index_range(1, 1).unwrap(), 0);
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_get_range() {
        let mut pool = new_pool();
        let ops = (0..4).map(|i| create_op(Address::random(), i)).collect::<Vec<_>>();
        for op in &ops {
            pool.add_operation(op.clone()).unwrap();
        }

        let range = pool.get_range(1, 3).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(*range[0].uo, ops[1]);
        assert_eq!(*range[1].uo, ops[2]);

        assert!(pool.get_range(3, 5).is_err());
        // reads do not mutate
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn test_clear_resets_both_indexes() {
        let mut pool = new_pool();
        let op = create_op(Address::random(), 0);
        pool.add_operation(op.clone()).unwrap();

        pool.clear();
        assert_eq!(pool.size(), 0);
        assert!(pool.get_all().is_empty());

        // cleared hashes are free for re-insertion
        pool.add_operation(op).unwrap();
        assert_eq!(pool.size(), 1);
    }
}
