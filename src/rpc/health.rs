use async_trait::async_trait;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

#[rpc(client, server, namespace = "system")]
pub trait SystemApi {
    #[method(name = "health")]
    async fn get_health(&self) -> RpcResult<String>;
}

/// Liveness probe target. `GET /health` is proxied onto `system_health` by
/// the server middleware.
pub struct HealthChecker;

#[async_trait]
impl SystemApiServer for HealthChecker {
    async fn get_health(&self) -> RpcResult<String> {
        Ok("OK".to_owned())
    }
}
