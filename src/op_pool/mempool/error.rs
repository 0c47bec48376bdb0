use ethers::types::H256;

use crate::common::types::UserOpViolation;

/// Mempool result type.
pub type MempoolResult<T> = std::result::Result<T, MempoolError>;

/// Mempool error type.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// The operation violates a structural field constraint.
    #[error("userOp validation failed: {0}")]
    InvalidOperation(#[from] UserOpViolation),
    /// An operation with the same canonical hash is already pooled.
    #[error("duplicate userOp: {0:?}")]
    DuplicateOperation(H256),
    #[error("index {0} out of range for pool of size {1}")]
    IndexOutOfRange(usize, usize),
    #[error("invalid range bounds: begin={0}, end={1}, size={2}")]
    InvalidRange(usize, usize, usize),
}
