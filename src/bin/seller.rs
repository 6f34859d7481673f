use acl_marketplace::{
    acl::ProductRegistration,
    config::AppConfig,
    model::{AgentIdentity, Product},
    telemetry::init_tracing,
    AgentClient, CapabilityType, Content, DirectoryClient, HttpChannel, Performative,
};
use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "seller")]
#[command(about = "External seller listing its products in the store catalog")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long)]
    directory: Option<String>,

    /// Store name shown next to the listed products.
    #[arg(long)]
    name: String,

    /// Product as `name:brand:type:price:weight`; repeat for more products.
    #[arg(long = "product", value_parser = parse_product, required = true)]
    products: Vec<Product>,
}

fn parse_product(value: &str) -> Result<Product, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [name, brand, product_type, price, weight] = parts.as_slice() else {
        return Err(format!("expected name:brand:type:price:weight, got `{}`", value));
    };
    Ok(Product {
        id: uuid::Uuid::new_v4(),
        name: name.to_string(),
        brand: brand.to_string(),
        product_type: product_type.to_string(),
        price: price.parse().map_err(|e| format!("bad price `{}`: {}", price, e))?,
        weight: weight.parse().map_err(|e| format!("bad weight `{}`: {}", weight, e))?,
        seller: None,
    })
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

    let port = config.agent_port(None, 9006);
    let identity = AgentIdentity::served_at(&args.name, CapabilityType::ExternalSeller, &config.agent.host, port);
    let channel = Arc::new(HttpChannel::new(config.request_timeout())?);
    let client = Arc::new(AgentClient::new(identity, channel).with_retry(config.retry_policy()));

    let directory = DirectoryClient::new(client.clone(), &config.directory.address);
    let Some(sales) = directory
        .search_one(CapabilityType::SalesProcessor)
        .await
        .context("directory lookup failed")?
    else {
        bail!("no sales processor is registered");
    };

    let mut refused = 0;
    for mut product in args.products {
        product.seller = Some(args.name.clone());
        let name = product.name.clone();
        let request = client.message(
            Performative::Request,
            Some(sales.uri.as_str()),
            Some(Content::RegisterProduct(ProductRegistration { product })),
        );
        let reply = client
            .request(&sales.comm_address, &request)
            .await
            .context("product registration failed")?;
        if reply.is(Performative::InformDone) {
            info!("Listed {}", name);
        } else {
            warn!("Sales processor answered {} for {}", reply.performative, name);
            refused += 1;
        }
    }

    if refused > 0 {
        bail!("{} product(s) were not listed", refused);
    }
    Ok(())
}
