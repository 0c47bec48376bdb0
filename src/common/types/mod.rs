mod entry_point;

use ethers::{
    abi::{encode, Token},
    types::{Address, Bytes, H256, U128, U256},
    utils::keccak256,
};
pub use entry_point::*;

/// EIP-712 type string of the packed user operation, as hashed by the
/// entry point's `getUserOpHash`.
const PACKED_USER_OPERATION_TYPE: &[u8] = b"PackedUserOperation(address sender,uint256 nonce,bytes initCode,bytes callData,bytes32 accountGasLimits,uint256 preVerificationGas,bytes32 gasFees,bytes paymasterAndData)";

/// User operation for entry point v0.7.
///
/// Offchain, unpacked representation. The six 128-bit gas and fee fields use
/// `U128` so that values that cannot be packed are unrepresentable.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserOperation {
    /// Sender account
    pub sender: Address,
    /// Semi-abstracted nonce
    ///
    /// The first 192 bits are the nonce key, the last 64 bits are the nonce
    /// value. Treated as opaque here; replay protection is the entry point's.
    pub nonce: U256,
    /// Factory, populated if deploying a new sender contract
    pub factory: Option<Address>,
    /// Factory data, non-empty exactly when a factory is set
    pub factory_data: Bytes,
    /// Calldata
    pub call_data: Bytes,
    /// Call gas limit
    pub call_gas_limit: U128,
    /// Verification gas limit
    pub verification_gas_limit: U128,
    /// Pre-verification gas
    pub pre_verification_gas: U256,
    /// Max fee per gas
    pub max_fee_per_gas: U128,
    /// Max priority fee per gas
    pub max_priority_fee_per_gas: U128,
    /// Paymaster, populated if a third party sponsors gas
    pub paymaster: Option<Address>,
    /// Paymaster verification gas limit
    pub paymaster_verification_gas_limit: U128,
    /// Paymaster post-op gas limit
    pub paymaster_post_op_gas_limit: U128,
    /// Paymaster data
    pub paymaster_data: Bytes,
    /// Signature
    pub signature: Bytes,
}

/// Packed user operation, the onchain v0.7 representation and the preimage
/// of the canonical user operation hash.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    /// `factory ++ factory_data`, empty when no factory is set
    pub init_code: Bytes,
    pub call_data: Bytes,
    /// High 16 bytes verification gas limit, low 16 bytes call gas limit
    pub account_gas_limits: [u8; 32],
    pub pre_verification_gas: U256,
    /// High 16 bytes max priority fee, low 16 bytes max fee
    pub gas_fees: [u8; 32],
    /// `paymaster ++ verification_gas_limit ++ post_op_gas_limit ++ data`,
    /// empty when no paymaster is set
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// A violation of the structural constraints on a user operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum UserOpViolation {
    #[error("sender must not be the zero address")]
    ZeroSender,
    #[error("{0} must be greater than zero")]
    ZeroGasField(&'static str),
    #[error("maxPriorityFeePerGas must not exceed maxFeePerGas")]
    PriorityFeeTooHigh,
    #[error("signature must not be empty")]
    EmptySignature,
    #[error("factoryData must be non-empty exactly when a factory is set")]
    FactoryDataMismatch,
    #[error("paymasterVerificationGasLimit must be greater than zero when a paymaster is set")]
    ZeroPaymasterVerificationGas,
}

impl UserOperation {
    /// Checks the structural constraints that hold for every pooled
    /// operation, independent of chain state.
    pub fn validate(&self) -> Result<(), UserOpViolation> {
        if self.sender.is_zero() {
            return Err(UserOpViolation::ZeroSender);
        }
        if self.call_gas_limit.is_zero() {
            return Err(UserOpViolation::ZeroGasField("callGasLimit"));
        }
        if self.verification_gas_limit.is_zero() {
            return Err(UserOpViolation::ZeroGasField("verificationGasLimit"));
        }
        if self.pre_verification_gas.is_zero() {
            return Err(UserOpViolation::ZeroGasField("preVerificationGas"));
        }
        if self.max_fee_per_gas.is_zero() {
            return Err(UserOpViolation::ZeroGasField("maxFeePerGas"));
        }
        if self.max_priority_fee_per_gas > self.max_fee_per_gas {
            return Err(UserOpViolation::PriorityFeeTooHigh);
        }
        if self.signature.is_empty() {
            return Err(UserOpViolation::EmptySignature);
        }
        if self.factory.is_some() == self.factory_data.is_empty() {
            return Err(UserOpViolation::FactoryDataMismatch);
        }
        if self.paymaster.is_some() && self.paymaster_verification_gas_limit.is_zero() {
            return Err(UserOpViolation::ZeroPaymasterVerificationGas);
        }
        Ok(())
    }

    /// Packs the user operation to its onchain representation.
    pub fn pack(&self) -> PackedUserOperation {
        let init_code = if let Some(factory) = self.factory {
            let mut init_code = factory.as_bytes().to_vec();
            init_code.extend_from_slice(&self.factory_data);
            Bytes::from(init_code)
        } else {
            Bytes::new()
        };

        let account_gas_limits = concat_128(
            self.verification_gas_limit.as_u128().to_be_bytes(),
            self.call_gas_limit.as_u128().to_be_bytes(),
        );

        let gas_fees = concat_128(
            self.max_priority_fee_per_gas.as_u128().to_be_bytes(),
            self.max_fee_per_gas.as_u128().to_be_bytes(),
        );

        let paymaster_and_data = if let Some(paymaster) = self.paymaster {
            let mut paymaster_and_data = paymaster.as_bytes().to_vec();
            paymaster_and_data.extend_from_slice(
                &self.paymaster_verification_gas_limit.as_u128().to_be_bytes(),
            );
            paymaster_and_data
                .extend_from_slice(&self.paymaster_post_op_gas_limit.as_u128().to_be_bytes());
            paymaster_and_data.extend_from_slice(&self.paymaster_data);
            Bytes::from(paymaster_and_data)
        } else {
            Bytes::new()
        };

        PackedUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            init_code,
            call_data: self.call_data.clone(),
            account_gas_limits,
            pre_verification_gas: self.pre_verification_gas,
            gas_fees,
            paymaster_and_data,
            signature: self.signature.clone(),
        }
    }

    /// Hash a user operation with the given entry point and chain ID.
    ///
    /// The hash uniquely identifies a user operation in the entry point and
    /// matches the contract's `getUserOpHash` so that clients can derive it
    /// independently. It does not cover the signature field.
    pub fn op_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        hash_packed_user_operation(&self.pack(), entry_point, chain_id)
    }
}

fn hash_packed_user_operation(
    puo: &PackedUserOperation,
    entry_point: Address,
    chain_id: u64,
) -> H256 {
    let hash_init_code = keccak256(&puo.init_code);
    let hash_call_data = keccak256(&puo.call_data);
    let hash_paymaster_and_data = keccak256(&puo.paymaster_and_data);

    let hashed = keccak256(encode(&[
        Token::FixedBytes(keccak256(PACKED_USER_OPERATION_TYPE).to_vec()),
        Token::Address(puo.sender),
        Token::Uint(puo.nonce),
        Token::FixedBytes(hash_init_code.to_vec()),
        Token::FixedBytes(hash_call_data.to_vec()),
        Token::FixedBytes(puo.account_gas_limits.to_vec()),
        Token::Uint(puo.pre_verification_gas),
        Token::FixedBytes(puo.gas_fees.to_vec()),
        Token::FixedBytes(hash_paymaster_and_data.to_vec()),
    ]));

    keccak256(encode(&[
        Token::FixedBytes(hashed.to_vec()),
        Token::Address(entry_point),
        Token::Uint(chain_id.into()),
    ]))
    .into()
}

fn concat_128(a: [u8; 16], b: [u8; 16]) -> [u8; 32] {
    std::array::from_fn(|i| {
        if let Some(i) = i.checked_sub(a.len()) {
            b[i]
        } else {
            a[i]
        }
    })
}
