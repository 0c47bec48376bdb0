use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, TransactionRequest};
#[cfg(test)]
use mockall::automock;

use super::{
    eth::ProviderLike,
    types::{handle_ops_calldata, UserOperation},
};

/// Outcome of simulating a bundle against the entry point.
#[derive(Clone, Debug)]
pub struct SimulationResult {
    pub success: bool,
    pub gas_used: u64,
    pub error: Option<String>,
}

/// Decides whether a bundle is worth submitting. The bundle sender owns when
/// and what to simulate; implementations own how.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleSimulator: Send + Sync + 'static {
    async fn simulate_bundle(
        &self,
        entry_point: Address,
        ops: &[Arc<UserOperation>],
    ) -> anyhow::Result<SimulationResult>;
}

/// Simulates a bundle by estimating gas for the `handleOps` call.
///
/// A revert during estimation surfaces as an unsuccessful result rather than
/// an error, so a bad bundle is a normal outcome and not a fault.
pub struct GasEstimateSimulator<P> {
    provider: Arc<P>,
    beneficiary: Address,
}

impl<P> GasEstimateSimulator<P> {
    pub fn new(provider: Arc<P>, beneficiary: Address) -> Self {
        Self {
            provider,
            beneficiary,
        }
    }
}

#[async_trait]
impl<P: ProviderLike> BundleSimulator for GasEstimateSimulator<P> {
    async fn simulate_bundle(
        &self,
        entry_point: Address,
        ops: &[Arc<UserOperation>],
    ) -> anyhow::Result<SimulationResult> {
        let packed = ops.iter().map(|op| op.pack()).collect::<Vec<_>>();
        let calldata = handle_ops_calldata(&packed, self.beneficiary);
        let tx = TransactionRequest::new()
            .to(entry_point)
            .data(calldata)
            .into();

        match self.provider.estimate_gas(&tx).await {
            Ok(gas) => Ok(SimulationResult {
                success: true,
                gas_used: gas.low_u64(),
                error: None,
            }),
            Err(err) => Ok(SimulationResult {
                success: false,
                gas_used: 0,
                error: Some(format!("{err:#}")),
            }),
        }
    }
}
