use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use ethers::types::Address;
use jsonrpsee::{
    server::{middleware::proxy_get_request::ProxyGetRequestLayer, ServerBuilder},
    RpcModule,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    debug::{DebugApi, DebugApiServer},
    eth::{EthApi, EthApiServer},
    health::{HealthChecker, SystemApiServer},
    ApiNamespace,
};
use crate::{builder::BundlerControl, common::handle::Task, op_pool::UoPool};

#[derive(Clone, Debug)]
pub struct Args {
    pub host: String,
    pub port: u16,
    pub chain_id: u64,
    pub entry_points: Vec<Address>,
    pub api_namespaces: Vec<ApiNamespace>,
    pub rpc_timeout: Duration,
    pub max_connections: u32,
}

/// The JSON-RPC server task.
///
/// Owns the mempools and exposes them to clients; bundle senders only see
/// them through their shared references.
pub struct RpcTask {
    args: Args,
    mempools: Arc<HashMap<Address, Arc<UoPool>>>,
    bundlers: Vec<Arc<dyn BundlerControl>>,
}

#[async_trait]
impl Task for RpcTask {
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.args.host, self.args.port)
            .parse()
            .context("should parse RPC listen address")?;
        if self.args.entry_points.is_empty() {
            bail!("No entry points provided");
        }

        let module = self.module()?;

        // Proxy `GET /health` requests to the internal `system_health`
        // method and bound request handling time.
        let service_builder = tower::ServiceBuilder::new()
            .layer(ProxyGetRequestLayer::new("/health", "system_health")?)
            .timeout(self.args.rpc_timeout);

        let server = ServerBuilder::default()
            .set_middleware(service_builder)
            .max_connections(self.args.max_connections)
            .http_only()
            .build(addr)
            .await?;
        let handle = server.start(module)?;

        info!("Started RPC server on {addr}");

        tokio::select! {
            _ = handle.stopped() => {
                bail!("RPC server stopped unexpectedly")
            }
            _ = shutdown_token.cancelled() => {
                info!("RPC server shutting down");
                Ok(())
            }
        }
    }
}

impl RpcTask {
    pub fn new(
        args: Args,
        mempools: Arc<HashMap<Address, Arc<UoPool>>>,
        bundlers: Vec<Arc<dyn BundlerControl>>,
    ) -> Self {
        Self {
            args,
            mempools,
            bundlers,
        }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }

    /// Builds the method table. Namespaces that are not listed, notably
    /// `debug` outside of DEBUG mode, are never registered, so calling them
    /// is indistinguishable from calling an unknown method.
    pub fn module(&self) -> anyhow::Result<RpcModule<()>> {
        let mut module = RpcModule::new(());
        for api in &self.args.api_namespaces {
            match api {
                ApiNamespace::Eth => module.merge(
                    EthApi::new(
                        self.args.entry_points.clone(),
                        self.mempools.clone(),
                        self.args.chain_id,
                    )
                    .into_rpc(),
                )?,
                ApiNamespace::Debug => module
                    .merge(DebugApi::new(self.mempools.clone(), self.bundlers.clone()).into_rpc())?,
            }
        }
        module.merge(HealthChecker.into_rpc())?;

        Ok(module)
    }
}
