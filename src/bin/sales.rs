use acl_marketplace::{
    config::AppConfig, ledger::SqliteLedger, model::AgentIdentity, sales::SalesProcessor, server::serve,
    telemetry::init_tracing, AgentClient, CapabilityType, HttpChannel, SqliteCatalog,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sales")]
#[command(about = "Order intake agent: purchases, product catalog and returns")]
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
    let catalog = SqliteCatalog::with_pool(ledger.pool().clone())
        .await
        .context("could not open the product catalog")?;

    let port = config.agent_port(args.port, 9001);
    let identity = AgentIdentity::served_at(
        config.agent_name("SalesProcessor"),
        CapabilityType::SalesProcessor,
        &config.agent.host,
        port,
    );
    let channel = Arc::new(HttpChannel::new(config.request_timeout())?);
    let client = Arc::new(AgentClient::new(identity, channel).with_retry(config.retry_policy()));

    let sales = Arc::new(SalesProcessor::new(
        client,
        config.directory.address.clone(),
        Arc::new(ledger),
        Arc::new(catalog),
        config.sales_policy(),
    ));
    sales
        .directory()
        .register()
        .await
        .context("could not register with the directory")?;

    serve(sales, &config.bind_address(port))
        .await
        .context("sales server failed")?;

    Ok(())
}
