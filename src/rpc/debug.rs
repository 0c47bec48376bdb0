use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ethers::types::Address;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{RpcAddress, RpcUserOperation};
use crate::{builder::BundlerControl, op_pool::UoPool};

/// Debug API, only registered when the process runs in DEBUG mode.
#[rpc(client, server, namespace = "debug")]
pub trait DebugApi {
    /// Dumps every mempool with its pooled operations.
    #[method(name = "mempools")]
    async fn mempools(&self) -> RpcResult<Vec<RpcMempoolDump>>;

    /// Toggles the pause state of all bundle senders.
    #[method(name = "pause")]
    async fn pause(&self) -> RpcResult<PauseStatus>;

    /// Clears all mempools.
    #[method(name = "clear")]
    async fn clear(&self) -> RpcResult<ClearStatus>;
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RpcMempoolDump {
    pub label: String,
    pub address: RpcAddress,
    pub size: usize,
    pub userops: Vec<RpcUserOperation>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PauseStatus {
    pub paused: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ClearStatus {
    pub cleared: usize,
}

pub struct DebugApi {
    mempools: Arc<HashMap<Address, Arc<UoPool>>>,
    bundlers: Vec<Arc<dyn BundlerControl>>,
}

impl DebugApi {
    pub fn new(
        mempools: Arc<HashMap<Address, Arc<UoPool>>>,
        bundlers: Vec<Arc<dyn BundlerControl>>,
    ) -> Self {
        Self { mempools, bundlers }
    }
}

#[async_trait]
impl DebugApiServer for DebugApi {
    async fn mempools(&self) -> RpcResult<Vec<RpcMempoolDump>> {
        let mut dumps = self
            .mempools
            .values()
            .map(|mempool| RpcMempoolDump {
                label: mempool.version().mempool_label().to_owned(),
                address: mempool.entry_point().into(),
                size: mempool.size(),
                userops: mempool
                    .get_all()
                    .into_iter()
                    .map(|op| RpcUserOperation::from((*op.uo).clone()))
                    .collect(),
            })
            .collect::<Vec<_>>();
        dumps.sort_by_key(|dump| Address::from(dump.address));
        Ok(dumps)
    }

    async fn pause(&self) -> RpcResult<PauseStatus> {
        let paused = self
            .bundlers
            .first()
            .map(|bundler| bundler.is_paused())
            .unwrap_or(false);

        for bundler in &self.bundlers {
            if paused {
                bundler.unpause();
            } else {
                bundler.pause();
            }
        }
        info!(
            "All bundle senders {}",
            if paused { "unpaused" } else { "paused" }
        );

        Ok(PauseStatus { paused: !paused })
    }

    async fn clear(&self) -> RpcResult<ClearStatus> {
        let mut cleared = 0;
        for mempool in self.mempools.values() {
            mempool.clear();
            cleared += 1;
        }
        info!("Cleared {cleared} mempools");

        Ok(ClearStatus { cleared })
    }
}
