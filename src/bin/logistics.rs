use acl_marketplace::{
    config::AppConfig, ledger::SqliteLedger, model::AgentIdentity, server::serve, telemetry::init_tracing,
    AgentClient, CapabilityType, HttpChannel, LogisticsCoordinator,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "logistics")]
#[command(about = "Logistics center batching orders into lots and negotiating transport")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    directory: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_with_env_overrides(&args.config)?;
    if let Some(directory) = args.directory {
        config.directory.address = directory;
    }
    config.validate()?;
    init_tracing(&config.logging);

    let ledger = SqliteLedger::new(&config.ledger.url, config.ledger.max_connections.unwrap_or(5))
        .await
        .context("could not open the order ledger")?;

    let port = config.agent_port(args.port, 9003);
    let identity = AgentIdentity::served_at(
        config.agent_name("LogisticsCenter"),
        CapabilityType::LogisticsCenter,
        &config.agent.host,
        port,
    );
    let channel = Arc::new(HttpChannel::new(config.request_timeout())?);
    let client = Arc::new(AgentClient::new(identity, channel).with_retry(config.retry_policy()));

    let coordinator = Arc::new(LogisticsCoordinator::new(
        client,
        config.directory.address.clone(),
        Arc::new(ledger),
        config.dispatch_policy(),
    ));
    coordinator
        .directory()
        .register()
        .await
        .context("could not register with the directory")?;

    let sweep = coordinator.clone().spawn_dispatch_loop(config.sweep_interval());
    let result = serve(coordinator, &config.bind_address(port)).await;
    sweep.abort();
    result.context("logistics server failed")?;

    Ok(())
}
