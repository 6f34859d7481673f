use acl_marketplace::{
    config::AppConfig, model::AgentIdentity, server::serve, telemetry::init_tracing, treasury::Treasurer,
    AgentClient, CapabilityType, DirectoryClient, HttpChannel,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "treasurer")]
#[command(about = "Settlement agent journaling charges, carrier payments and refunds")]
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

    let port = config.agent_port(args.port, 9004);
    let identity = AgentIdentity::served_at(
        config.agent_name("Treasurer"),
        CapabilityType::Treasurer,
        &config.agent.host,
        port,
    );
    let channel = Arc::new(HttpChannel::new(config.request_timeout())?);
    let client = Arc::new(AgentClient::new(identity, channel).with_retry(config.retry_policy()));

    DirectoryClient::new(client.clone(), &config.directory.address)
        .register()
        .await
        .context("could not register with the directory")?;

    let treasurer = Arc::new(Treasurer::new(client, config.treasury.store_account.clone()));
    serve(treasurer.clone(), &config.bind_address(port))
        .await
        .context("treasurer server failed")?;

    tracing::info!("Journal holds {} transfer(s) at shutdown", treasurer.journal().len());
    Ok(())
}
