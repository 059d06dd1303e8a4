pub mod gateway;
pub mod retry;

use evoflow_core::config::GatewayConfig;
use evoflow_core::traits::ModelClient;

pub use gateway::GatewayClient;
pub use retry::RetryingClient;

/// Create the model client described by the gateway config, wrapped in
/// retries when a `[gateway.retry]` section is present.
pub fn create_client(config: &GatewayConfig) -> Box<dyn ModelClient> {
    let client = GatewayClient::new(config);
    match &config.retry {
        Some(retry) => Box::new(RetryingClient::new(Box::new(client), retry.clone())),
        None => Box::new(client),
    }
}
