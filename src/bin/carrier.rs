use acl_marketplace::{
    carrier::{BidPolicy, TransportBidder},
    config::AppConfig,
    model::AgentIdentity,
    server::serve,
    telemetry::init_tracing,
    AgentClient, CapabilityType, DirectoryClient, HttpChannel,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "carrier")]
#[command(about = "Transport provider that bids on shipment lots")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long)]
    port: Option<u16>,

    /// Agent name; run several carriers under different names.
    #[arg(short, long)]
    name: Option<String>,

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

    let port = config.agent_port(args.port, 9002);
    let name = args.name.unwrap_or_else(|| config.agent_name("TransportistaA"));
    let identity = AgentIdentity::served_at(name, CapabilityType::TransportProvider, &config.agent.host, port);
    let channel = Arc::new(HttpChannel::new(config.request_timeout())?);
    let client = Arc::new(AgentClient::new(identity, channel).with_retry(config.retry_policy()));

    DirectoryClient::new(client.clone(), &config.directory.address)
        .register()
        .await
        .context("could not register with the directory")?;

    let bidder = Arc::new(TransportBidder::new(client, BidPolicy::from(&config.carrier)));
    serve(bidder, &config.bind_address(port))
        .await
        .context("carrier server failed")?;

    Ok(())
}
