use std::sync::Arc;

use anyhow::{bail, Context};
use ethers::{
    signers::{LocalWallet, Signer, WalletError},
    types::{transaction::eip2718::TypedTransaction, Address, H256},
    utils::to_checksum,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::eth::ProviderLike;

/// Key pool result type.
pub type KeyPoolResult<T> = std::result::Result<T, KeyPoolError>;

/// Key pool error type.
#[derive(Debug, thiserror::Error)]
pub enum KeyPoolError {
    /// Shutdown arrived while waiting for a key to become available.
    #[error("transaction submission cancelled while waiting for a signing key")]
    Cancelled,
    #[error("failed to sign transaction: {0}")]
    Signature(#[from] WalletError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A signing key and its lease state.
#[derive(Debug)]
struct PooledKey {
    signer: LocalWallet,
    address: Address,
    in_flight: bool,
}

/// A bounded set of signing keys with at most one in-flight transaction per
/// key.
///
/// Acquisition scans keys in load order and suspends when every key is
/// leased; a release wakes exactly one waiter. The lock is never held across
/// a node call.
#[derive(Debug)]
pub struct KeyPool<P> {
    keys: Mutex<Vec<PooledKey>>,
    available: Notify,
    provider: Arc<P>,
    chain_id: u64,
}

impl<P: ProviderLike> KeyPool<P> {
    /// Parses the given hex private keys (optional `0x` prefix, surrounding
    /// whitespace tolerated) and derives their addresses. At least one key is
    /// required.
    pub fn new(private_keys: &[String], provider: Arc<P>, chain_id: u64) -> anyhow::Result<Self> {
        if private_keys.is_empty() {
            bail!("no private keys provided");
        }

        let mut keys = Vec::with_capacity(private_keys.len());
        for (index, raw) in private_keys.iter().enumerate() {
            let signer = raw
                .trim()
                .trim_start_matches("0x")
                .parse::<LocalWallet>()
                .with_context(|| format!("invalid private key at index {index}"))?
                .with_chain_id(chain_id);
            let address = signer.address();
            info!("Loaded key {}: {}", index, to_checksum(&address, None));
            keys.push(PooledKey {
                signer,
                address,
                in_flight: false,
            });
        }
        info!("Key pool initialized with {} keys", keys.len());

        Ok(Self {
            keys: Mutex::new(keys),
            available: Notify::new(),
            provider,
            chain_id,
        })
    }

    /// Signs and submits a transaction with the next available key, waiting
    /// for one if every key is in flight.
    ///
    /// On success the key stays leased and its address is returned with the
    /// transaction hash; the caller must call [`Self::release_key`] once the
    /// transaction has been observed onchain or abandoned. On failure the key
    /// is released before the error propagates.
    pub async fn submit_transaction(
        &self,
        shutdown: &CancellationToken,
        tx: TypedTransaction,
    ) -> KeyPoolResult<(H256, Address)> {
        let (signer, address) = self.acquire_key(shutdown).await?;

        match self.sign_and_send(&signer, address, tx).await {
            Ok(tx_hash) => {
                info!(
                    "Transaction submitted: {:?} from key: {}",
                    tx_hash,
                    to_checksum(&address, None)
                );
                Ok((tx_hash, address))
            }
            Err(err) => {
                self.release_key(address);
                Err(err)
            }
        }
    }

    /// Returns a leased key to the pool and wakes one waiter. Releasing a key
    /// that is not in flight is a no-op.
    pub fn release_key(&self, address: Address) {
        let mut keys = self.keys.lock();
        let Some(key) = keys.iter_mut().find(|key| key.address == address) else {
            return;
        };
        if key.in_flight {
            key.in_flight = false;
            debug!("Key released: {}", to_checksum(&address, None));
            self.available.notify_one();
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys.lock().iter().map(|key| key.address).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.keys.lock().iter().filter(|key| key.in_flight).count()
    }

    /// First-fit scan over the keys in load order, suspending until a release
    /// or cancellation when the pool is saturated. Fairness among waiters is
    /// not guaranteed.
    async fn acquire_key(
        &self,
        shutdown: &CancellationToken,
    ) -> KeyPoolResult<(LocalWallet, Address)> {
        loop {
            // Register for a release signal before scanning so a release
            // between the scan and the await is not lost.
            let notified = self.available.notified();
            {
                let mut keys = self.keys.lock();
                if let Some(key) = keys.iter_mut().find(|key| !key.in_flight) {
                    key.in_flight = true;
                    metrics::increment_counter!("key_pool_leases");
                    return Ok((key.signer.clone(), key.address));
                }
            }

            debug!("All keys are in flight, waiting for an available key");
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return Err(KeyPoolError::Cancelled),
            }
        }
    }

    async fn sign_and_send(
        &self,
        signer: &LocalWallet,
        address: Address,
        mut tx: TypedTransaction,
    ) -> KeyPoolResult<H256> {
        tx.set_from(address);
        tx.set_chain_id(self.chain_id);

        let nonce = self
            .provider
            .transaction_count(address)
            .await
            .context("should get nonce for signing key")?;
        tx.set_nonce(nonce);

        if tx.gas_price().is_none() {
            let gas_price = self
                .provider
                .gas_price()
                .await
                .context("should get gas price")?;
            tx.set_gas_price(gas_price);
        }

        let signature = signer.sign_transaction_sync(&tx)?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self.provider.send_raw_transaction(raw).await?;
        Ok(tx_hash)
    }
}
