pub mod mempool;

pub use mempool::{MempoolError, MempoolResult, PoolOperation, UoPool};
