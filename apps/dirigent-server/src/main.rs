use anyhow::Context;
use tracing_subscriber::EnvFilter;

use dirigent_config::{load_backend_map, load_policy, ConfigPaths, ServerConfig};
use dirigent_core::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().context("read server configuration")?;
    let paths = ConfigPaths::default();
    let policy = load_policy(&paths.policy).context("load policy config")?;
    let backends = load_backend_map(&paths.backends).context("load backends config")?;
    let secrets = load_backend_map(&paths.secrets).context("load secrets config")?;

    // Translators and adapters are registered by embedders; the stock binary
    // starts with an empty registry.
    let registry = Registry::new();

    dirigent_server::run_server(config, policy, backends, secrets, registry).await
}
