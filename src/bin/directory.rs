use acl_marketplace::{
    config::AppConfig, model::AgentIdentity, server::serve, telemetry::init_tracing, AgentClient,
    CapabilityType, DirectoryService, HttpChannel,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "directory")]
#[command(about = "Capability directory where agents register and look each other up")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_with_env_overrides(&args.config)?;
    config.validate()?;
    init_tracing(&config.logging);

    let port = config.agent_port(args.port, 9000);
    let identity = AgentIdentity::served_at(
        config.agent_name("Directory"),
        CapabilityType::Directory,
        &config.agent.host,
        port,
    );
    let channel = Arc::new(HttpChannel::new(config.request_timeout())?);
    let client = Arc::new(AgentClient::new(identity, channel).with_retry(config.retry_policy()));

    let directory = Arc::new(DirectoryService::new(client));
    serve(directory, &config.bind_address(port))
        .await
        .context("directory server failed")?;

    Ok(())
}
