mod debug;
mod eth;
mod health;
mod task;

pub use debug::{ClearStatus, DebugApi, DebugApiClient, DebugApiServer, PauseStatus, RpcMempoolDump};
pub use eth::{EthApi, EthApiClient, EthApiServer, EthRpcError};
use ethers::{
    types::{Address, Bytes, H160, U128, U256},
    utils::to_checksum,
};
pub use health::{HealthChecker, SystemApiClient, SystemApiServer};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
pub use task::{Args, RpcTask};

use crate::common::types::UserOperation;

/// API namespace
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ApiNamespace {
    Eth,
    Debug,
}

/// A 20-byte address on the wire.
///
/// Decodes leniently the way nodes do: `0x` optional, shorter values are
/// left-padded, longer values keep their low 20 bytes. Encodes in EIP-55
/// mixed-case checksum form.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RpcAddress(H160);

impl RpcAddress {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Serialize for RpcAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_checksum(&self.0, None))
    }
}

impl<'de> Deserialize<'de> for RpcAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_address(&raw)
            .map(RpcAddress)
            .map_err(de::Error::custom)
    }
}

impl From<RpcAddress> for Address {
    fn from(rpc_addr: RpcAddress) -> Self {
        rpc_addr.0
    }
}

impl From<Address> for RpcAddress {
    fn from(addr: Address) -> Self {
        RpcAddress(addr)
    }
}

fn parse_address(raw: &str) -> Result<Address, String> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid hex in address: {raw}"));
    }
    // normalize to exactly 40 digits: low 20 bytes of longer values, zero
    // extension of shorter ones
    let digits = if digits.len() > 40 {
        &digits[digits.len() - 40..]
    } else {
        digits
    };
    let padded = format!("{digits:0>40}");
    let bytes = (0..20)
        .map(|i| u8::from_str_radix(&padded[2 * i..2 * i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid hex in address: {err}"))?;
    Ok(Address::from_slice(&bytes))
}

/// User operation definition for RPC.
///
/// All numeric fields are `0x`-prefixed hex strings; absent factory and
/// paymaster are the zero address.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    sender: RpcAddress,
    nonce: U256,
    factory: RpcAddress,
    factory_data: Bytes,
    call_data: Bytes,
    call_gas_limit: U128,
    verification_gas_limit: U128,
    pre_verification_gas: U256,
    max_fee_per_gas: U128,
    max_priority_fee_per_gas: U128,
    paymaster: RpcAddress,
    paymaster_verification_gas_limit: U128,
    paymaster_post_op_gas_limit: U128,
    paymaster_data: Bytes,
    signature: Bytes,
}

impl From<UserOperation> for RpcUserOperation {
    fn from(op: UserOperation) -> Self {
        RpcUserOperation {
            sender: op.sender.into(),
            nonce: op.nonce,
            factory: op.factory.unwrap_or_default().into(),
            factory_data: op.factory_data,
            call_data: op.call_data,
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster: op.paymaster.unwrap_or_default().into(),
            paymaster_verification_gas_limit: op.paymaster_verification_gas_limit,
            paymaster_post_op_gas_limit: op.paymaster_post_op_gas_limit,
            paymaster_data: op.paymaster_data,
            signature: op.signature,
        }
    }
}

impl From<RpcUserOperation> for UserOperation {
    fn from(def: RpcUserOperation) -> Self {
        UserOperation {
            sender: def.sender.into(),
            nonce: def.nonce,
            factory: Some(def.factory.into()).filter(|addr: &Address| !addr.is_zero()),
            factory_data: def.factory_data,
            call_data: def.call_data,
            call_gas_limit: def.call_gas_limit,
            verification_gas_limit: def.verification_gas_limit,
            pre_verification_gas: def.pre_verification_gas,
            max_fee_per_gas: def.max_fee_per_gas,
            max_priority_fee_per_gas: def.max_priority_fee_per_gas,
            paymaster: Some(def.paymaster.into()).filter(|addr: &Address| !addr.is_zero()),
            paymaster_verification_gas_limit: def.paymaster_verification_gas_limit,
            paymaster_post_op_gas_limit: def.paymaster_post_op_gas_limit,
            paymaster_data: def.paymaster_data,
            signature: def.signature,
        }
    }
}
