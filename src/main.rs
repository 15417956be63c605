use pg_gateway::{config::Config, telemetry, QueryGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = Config::from_env()?;
    let gateway_config = config.gateway_config()?;
    tracing::info!(
        target_db = %gateway_config.redacted_target(),
        tls_mode = %gateway_config.tls_mode,
        max_connections = gateway_config.max_connections,
        "Starting query gateway"
    );

    let gateway = QueryGateway::connect_lazy(&gateway_config)?;
    if !gateway.test_connection().await {
        tracing::warn!("Database unreachable at startup, connections will be opened on demand");
    }

    tokio::signal::ctrl_c().await?;

    gateway.shutdown().await;
    tracing::info!(stats = ?gateway.stats(), "Query gateway stopped");
    Ok(())
}
