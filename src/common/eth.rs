use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use ethers::{
    providers::{
        Http, HttpRateLimitRetryPolicy, Middleware, Provider, RetryClient, RetryClientBuilder,
    },
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, H256, U256,
    },
};
#[cfg(test)]
use mockall::automock;
use url::Url;

/// The node operations the bundler needs, abstracted for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderLike: Send + Sync + 'static {
    async fn chain_id(&self) -> anyhow::Result<U256>;

    /// Pending-block transaction count, used as the next nonce for a key.
    async fn transaction_count(&self, address: Address) -> anyhow::Result<U256>;

    async fn gas_price(&self) -> anyhow::Result<U256>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> anyhow::Result<U256>;

    async fn send_raw_transaction(&self, tx: Bytes) -> anyhow::Result<H256>;
}

#[async_trait]
impl<M> ProviderLike for M
where
    M: Middleware + 'static,
{
    async fn chain_id(&self) -> anyhow::Result<U256> {
        Middleware::get_chainid(self)
            .await
            .context("should get chain id")
    }

    async fn transaction_count(&self, address: Address) -> anyhow::Result<U256> {
        Middleware::get_transaction_count(self, address, Some(BlockNumber::Pending.into()))
            .await
            .context("should get transaction count")
    }

    async fn gas_price(&self) -> anyhow::Result<U256> {
        Middleware::get_gas_price(self)
            .await
            .context("should get gas price")
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> anyhow::Result<U256> {
        Middleware::estimate_gas(self, tx, None)
            .await
            .context("should estimate gas")
    }

    async fn send_raw_transaction(&self, tx: Bytes) -> anyhow::Result<H256> {
        let pending = Middleware::send_raw_transaction(self, tx)
            .await
            .context("should send raw transaction to node")?;
        Ok(pending.tx_hash())
    }
}

/// Creates a provider over a retrying HTTP client.
///
/// Retries on rate limiting and dubious connectivity, not on reverts.
pub fn new_provider(url: &str) -> anyhow::Result<Arc<Provider<RetryClient<Http>>>> {
    let parsed_url = Url::parse(url).context("invalid RPC URL")?;
    let client = RetryClientBuilder::default()
        .rate_limit_retries(10)
        .timeout_retries(3)
        .initial_backoff(Duration::from_millis(500))
        .build(
            Http::new(parsed_url),
            Box::<HttpRateLimitRetryPolicy>::default(),
        );
    Ok(Arc::new(Provider::new(client)))
}
