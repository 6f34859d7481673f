use acl_marketplace::{
    acl::{PurchaseRequest, ReturnRequest},
    config::AppConfig,
    model::{AgentIdentity, LineItem, PriorityClass, ReturnReason},
    telemetry::init_tracing,
    AgentClient, CapabilityType, Content, DirectoryClient, HttpChannel, Performative, ProductFilter,
};
use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "shopper")]
#[command(about = "End-user agent that searches, buys and returns products through the sales processor")]
struct Args {
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, global = true)]
    directory: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place one purchase
    Buy {
        #[arg(long)]
        city: String,

        #[arg(long, default_value = "standard", value_parser = parse_priority)]
        priority: PriorityClass,

        /// Account the purchase is charged to.
        #[arg(long)]
        account: String,

        /// Line item as `name:price:weight`; repeat for more items.
        #[arg(long = "item", value_parser = parse_line_item, required = true)]
        items: Vec<LineItem>,
    },
    /// Search the product catalog
    Search(SearchArgs),
    /// Return one item of a delivered order
    Return {
        #[arg(long)]
        order: uuid::Uuid,

        #[arg(long)]
        item: String,

        /// defective, wrong or unsatisfactory
        #[arg(long, value_parser = parse_reason)]
        reason: ReturnReason,
    },
}

#[derive(ClapArgs)]
struct SearchArgs {
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    brand: Option<String>,

    #[arg(long = "type")]
    product_type: Option<String>,

    #[arg(long)]
    min_price: Option<f64>,

    #[arg(long)]
    max_price: Option<f64>,

    /// Leave out the store's own stock.
    #[arg(long)]
    no_internal: bool,

    /// Leave out products listed by external sellers.
    #[arg(long)]
    no_external: bool,
}

impl From<SearchArgs> for ProductFilter {
    fn from(args: SearchArgs) -> Self {
        ProductFilter {
            name: args.name,
            brand: args.brand,
            product_type: args.product_type,
            min_price: args.min_price,
            max_price: args.max_price,
            include_internal: !args.no_internal,
            include_external: !args.no_external,
        }
    }
}

fn parse_priority(value: &str) -> Result<PriorityClass, String> {
    PriorityClass::parse(value).map_err(|e| e.to_string())
}

fn parse_reason(value: &str) -> Result<ReturnReason, String> {
    ReturnReason::parse(value).map_err(|e| e.to_string())
}

fn parse_line_item(value: &str) -> Result<LineItem, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [name, price, weight] = parts.as_slice() else {
        return Err(format!("expected name:price:weight, got `{}`", value));
    };
    Ok(LineItem {
        name: name.to_string(),
        brand: None,
        price: price.parse().map_err(|e| format!("bad price `{}`: {}", price, e))?,
        weight: weight.parse().map_err(|e| format!("bad weight `{}`: {}", weight, e))?,
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

    let port = config.agent_port(None, 9005);
    let identity = AgentIdentity::served_at(
        config.agent_name("Shopper"),
        CapabilityType::UserAgent,
        &config.agent.host,
        port,
    );
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

    let content = match args.command {
        Command::Buy {
            city,
            priority,
            account,
            items,
        } => Content::ProcessPurchase(PurchaseRequest {
            destination_city: city,
            priority,
            payment_ref: account,
            line_items: items,
        }),
        Command::Search(search) => Content::SearchProducts(search.into()),
        Command::Return { order, item, reason } => Content::ReturnProduct(ReturnRequest {
            order_id: order,
            item_name: item,
            reason,
        }),
    };

    let request = client.message(Performative::Request, Some(sales.uri.as_str()), Some(content));
    let reply = client
        .request(&sales.comm_address, &request)
        .await
        .context("request to the sales processor failed")?;

    match (reply.performative, reply.content) {
        (Performative::InformResult, Some(Content::PurchaseReceipt(receipt))) => {
            println!("Order {} placed", receipt.order_id);
            println!("  total:              {:.2}", receipt.total_price);
            println!("  estimated delivery: {}", receipt.estimated_delivery);
        }
        (Performative::InformResult, Some(Content::ProductList(products))) => {
            if products.is_empty() {
                println!("No products match");
            }
            for product in products.into_inner() {
                println!(
                    "{:<24} {:<16} {:<12} {:>9.2}  {}",
                    product.name,
                    product.brand,
                    product.product_type,
                    product.price,
                    product.seller.as_deref().unwrap_or("-")
                );
            }
        }
        (Performative::AcceptProposal | Performative::RejectProposal, Some(Content::ReturnVerdict(verdict))) => {
            let outcome = if verdict.accepted { "accepted" } else { "declined" };
            println!("Return of {} {}: {}", verdict.item_name, outcome, verdict.message);
            if verdict.accepted {
                println!("  refund: {:.2}", verdict.refund);
            }
        }
        (performative, _) => bail!("sales processor answered with {}", performative),
    }

    Ok(())
}
