use jsonrpsee::{
    core::Error as RpcError,
    types::{
        error::{CallError, INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
        ErrorObject,
    },
};

use crate::op_pool::MempoolError;

/// Error returned by the RPC server eth namespace.
#[derive(Debug, thiserror::Error)]
pub enum EthRpcError {
    /// Invalid parameters
    #[error("{0}")]
    InvalidParams(String),
    /// The entry point address is not in the configured set.
    #[error("no mempool for entry point {0}; known entry points: [{1}]")]
    UnsupportedEntryPoint(String, String),
    /// Other internal errors
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<MempoolError> for EthRpcError {
    fn from(error: MempoolError) -> Self {
        match error {
            MempoolError::InvalidOperation(_) | MempoolError::DuplicateOperation(_) => {
                EthRpcError::InvalidParams(format!("failed adding userOp to mempool: {error}"))
            }
            other => EthRpcError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<EthRpcError> for RpcError {
    fn from(error: EthRpcError) -> Self {
        let msg = error.to_string();

        match error {
            EthRpcError::InvalidParams(_) | EthRpcError::UnsupportedEntryPoint(_, _) => {
                rpc_err(INVALID_PARAMS_CODE, msg)
            }
            EthRpcError::Internal(_) => rpc_err(INTERNAL_ERROR_CODE, msg),
        }
    }
}

fn rpc_err(code: i32, msg: impl Into<String>) -> RpcError {
    RpcError::Call(CallError::Custom(ErrorObject::owned(
        code,
        msg.into(),
        None::<()>,
    )))
}
