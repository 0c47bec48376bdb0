use ethers::{
    abi::{encode, Token},
    types::{Address, Bytes},
    utils::keccak256,
};

use super::PackedUserOperation;

/// `handleOps(PackedUserOperation[] ops, address beneficiary)` with the v0.7
/// packed operation tuple layout.
const HANDLE_OPS_SIGNATURE: &str =
    "handleOps((address,uint256,bytes,bytes,bytes32,uint256,bytes32,bytes,bytes)[],address)";

/// The supported entry point contract versions.
///
/// Each version is a singleton contract at a well-known address. All three
/// currently share the v0.7 operation packing; this enum is the branch point
/// for the day v0.6's legacy layout is added.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EntryPointVersion {
    V0_6,
    V0_7,
    V0_8,
}

impl EntryPointVersion {
    /// Canonical deployment address of this entry point version.
    pub fn address(self) -> Address {
        let addr = match self {
            EntryPointVersion::V0_6 => "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            EntryPointVersion::V0_7 => "0x0000000071727De22E5E9d8BAf0edAc6f37da032",
            EntryPointVersion::V0_8 => "0x4337084D9E255Ff0702461CF8895CE9E3b5Ff108",
        };
        addr.parse().expect("entry point address should parse")
    }

    /// Resolves a canonical deployment address back to its version.
    pub fn from_address(address: Address) -> Option<Self> {
        [
            EntryPointVersion::V0_6,
            EntryPointVersion::V0_7,
            EntryPointVersion::V0_8,
        ]
        .into_iter()
        .find(|version| version.address() == address)
    }

    /// Label used when dumping this version's mempool.
    pub fn mempool_label(self) -> &'static str {
        match self {
            EntryPointVersion::V0_6 => "MempoolV06",
            EntryPointVersion::V0_7 => "MempoolV07",
            EntryPointVersion::V0_8 => "MempoolV08",
        }
    }
}

/// ABI-encodes a call to `handleOps` for the given bundle and beneficiary.
pub fn handle_ops_calldata(ops: &[PackedUserOperation], beneficiary: Address) -> Bytes {
    let selector = &keccak256(HANDLE_OPS_SIGNATURE.as_bytes())[..4];
    let args = encode(&[
        Token::Array(ops.iter().map(packed_op_token).collect()),
        Token::Address(beneficiary),
    ]);
    [selector, &args].concat().into()
}

fn packed_op_token(op: &PackedUserOperation) -> Token {
    Token::Tuple(vec![
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::FixedBytes(op.account_gas_limits.to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.to_vec()),
        Token::Bytes(op.paymaster_and_data.to_vec()),
        Token::Bytes(op.signature.to_vec()),
    ])
}
