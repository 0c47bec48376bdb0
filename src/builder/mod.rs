mod bundle_sender;
mod key_pool;

pub use bundle_sender::{
    BundleSender, BundlerControl, BundlerTask, SendBundleResult, Settings,
};
pub use key_pool::{KeyPool, KeyPoolError, KeyPoolResult};
