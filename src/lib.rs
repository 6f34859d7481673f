//! # ACL Marketplace
//!
//! A marketplace of autonomous agents that cooperate over request/reply
//! HTTP by exchanging speech-act tagged envelopes.
//!
//! ## Architecture
//!
//! - **Directory**: capability registry; register, first-match search, all-match search
//! - **Sales processor**: order intake and product catalog; records orders, hands them to
//!   logistics, registers seller products and settles returns
//! - **Logistics center**: batches orders into lots and procures transport by competitive bidding
//! - **Carrier**: transport bidder answering solicitations and counter-offers
//! - **Treasurer**: settlement sink for shipment charges and refunds
//! - **Shopper**: end-user agent searching, buying and returning products
//! - **Seller**: external seller listing products in the catalog

pub mod acl;
pub mod carrier;
pub mod catalog;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod logistics;
pub mod model;
pub mod sales;
pub mod server;
pub mod telemetry;
pub mod treasury;

pub use acl::{Content, Decoded, Envelope, Performative};
pub use catalog::{ProductCatalog, ProductFilter, SqliteCatalog};
pub use client::{AgentClient, HttpChannel, LocalChannel, MessageChannel, RetryPolicy};
pub use config::AppConfig;
pub use directory::{DirectoryClient, DirectoryService};
pub use error::{AgentError, DecodeError, Result};
pub use logistics::LogisticsCoordinator;
pub use model::{AgentIdentity, CapabilityType, Order, PriorityClass, Product, ShipmentLot};
pub use server::MessageHandler;

pub type OrderId = uuid::Uuid;
pub type LotId = uuid::Uuid;
pub type ProductId = uuid::Uuid;
