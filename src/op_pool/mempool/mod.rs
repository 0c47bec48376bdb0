mod error;
mod pool;
mod uo_pool;

use std::sync::Arc;

pub use error::{MempoolError, MempoolResult};
use ethers::types::H256;
pub use uo_pool::UoPool;

use crate::common::types::UserOperation;

/// A pooled user operation together with its canonical hash.
///
/// The position in the pool's ordered sequence is the operation's implicit
/// insertion index. The operation itself is handed out behind an `Arc`, so
/// holders cannot mutate pool state through it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolOperation {
    pub hash: H256,
    pub uo: Arc<UserOperation>,
}
