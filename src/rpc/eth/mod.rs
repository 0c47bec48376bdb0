mod error;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
pub use error::EthRpcError;
use ethers::{
    types::{Address, H256, U256},
    utils::to_checksum,
};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use tracing::info;

use super::{RpcAddress, RpcUserOperation};
use crate::op_pool::UoPool;

/// Eth API
#[rpc(client, server, namespace = "eth")]
pub trait EthApi {
    /// Validates a user operation and adds it to the mempool bound to the
    /// given entry point, returning the canonical operation hash.
    #[method(name = "sendUserOperation")]
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: RpcAddress,
    ) -> RpcResult<H256>;

    #[method(name = "supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<RpcAddress>>;

    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U256>;
}

pub struct EthApi {
    // configured order, used for the supported entry points response
    entry_points: Vec<Address>,
    mempools: Arc<HashMap<Address, Arc<UoPool>>>,
    chain_id: u64,
}

impl EthApi {
    pub fn new(
        entry_points: Vec<Address>,
        mempools: Arc<HashMap<Address, Arc<UoPool>>>,
        chain_id: u64,
    ) -> Self {
        Self {
            entry_points,
            mempools,
            chain_id,
        }
    }
}

#[async_trait]
impl EthApiServer for EthApi {
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: RpcAddress,
    ) -> RpcResult<H256> {
        let entry_point: Address = entry_point.into();
        let Some(mempool) = self.mempools.get(&entry_point) else {
            let known = self
                .entry_points
                .iter()
                .map(|addr| to_checksum(addr, None))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(
                EthRpcError::UnsupportedEntryPoint(to_checksum(&entry_point, None), known).into(),
            );
        };

        let hash = mempool
            .add_operation(op.into())
            .map_err(EthRpcError::from)?;

        info!(
            "UserOp {hash:?} validated and added to mempool for {}. Mempool size: {}",
            to_checksum(&entry_point, None),
            mempool.size()
        );
        Ok(hash)
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<RpcAddress>> {
        Ok(self
            .entry_points
            .iter()
            .map(|addr| RpcAddress::from(*addr))
            .collect())
    }

    async fn chain_id(&self) -> RpcResult<U256> {
        Ok(self.chain_id.into())
    }
}
