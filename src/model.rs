use crate::{AgentError, LotId, OrderId, ProductId, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace every agent URI lives under.
pub const AGENT_NS: &str = "http://www.agentes.org#";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapabilityType {
    Directory,
    LogisticsCenter,
    SalesProcessor,
    Treasurer,
    TransportProvider,
    ExternalSeller,
    UserAgent,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Directory => "Directory",
            CapabilityType::LogisticsCenter => "LogisticsCenter",
            CapabilityType::SalesProcessor => "SalesProcessor",
            CapabilityType::Treasurer => "Treasurer",
            CapabilityType::TransportProvider => "TransportProvider",
            CapabilityType::ExternalSeller => "ExternalSeller",
            CapabilityType::UserAgent => "UserAgent",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an agent is and where to reach it. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub uri: String,
    pub capability: CapabilityType,
    pub comm_address: String,
    pub control_address: Option<String>,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, capability: CapabilityType, comm_address: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uri: format!("{}{}", AGENT_NS, name),
            name,
            capability,
            comm_address: comm_address.into(),
            control_address: None,
        }
    }

    /// Identity for an agent served at `http://{host}:{port}`.
    pub fn served_at(name: impl Into<String>, capability: CapabilityType, host: &str, port: u16) -> Self {
        let mut identity = Self::new(name, capability, format!("http://{}:{}/comm", host, port));
        identity.control_address = Some(format!("http://{}:{}/stop", host, port));
        identity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Urgent,
    Standard,
}

impl PriorityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Urgent => "urgent",
            PriorityClass::Standard => "standard",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "urgent" => Ok(PriorityClass::Urgent),
            "standard" => Ok(PriorityClass::Standard),
            other => Err(AgentError::Validation(format!("Unknown priority class: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub name: String,
    pub brand: Option<String>,
    pub price: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Placed,
    ReadyToCharge,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::ReadyToCharge => "ready_to_charge",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "placed" => Ok(OrderStatus::Placed),
            "ready_to_charge" => Ok(OrderStatus::ReadyToCharge),
            other => Err(AgentError::Validation(format!("Unknown order status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub destination_city: String,
    pub priority: PriorityClass,
    pub total_weight: f64,
    pub total_price: f64,
    pub payment_ref: String,
    pub line_items: Vec<LineItem>,
    pub placed_at: DateTime<Utc>,
    pub delivery_deadline: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(
        destination_city: String,
        priority: PriorityClass,
        payment_ref: String,
        line_items: Vec<LineItem>,
    ) -> Self {
        let total_weight = line_items.iter().map(|item| item.weight).sum();
        let total_price = line_items.iter().map(|item| item.price).sum();
        Self {
            id: Uuid::new_v4(),
            destination_city,
            priority,
            total_weight,
            total_price,
            payment_ref,
            line_items,
            placed_at: Utc::now(),
            delivery_deadline: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.line_items.is_empty() {
            return Err(AgentError::Validation("Order must contain at least one line item".to_string()));
        }
        if self.destination_city.trim().is_empty() {
            return Err(AgentError::Validation("Destination city cannot be empty".to_string()));
        }
        if self.total_weight <= 0.0 {
            return Err(AgentError::Validation("Total weight must be greater than 0".to_string()));
        }
        if self.payment_ref.trim().is_empty() {
            return Err(AgentError::Validation("Payment reference cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn lot_key(&self) -> LotKey {
        LotKey {
            destination_city: self.destination_city.clone(),
            priority: self.priority,
        }
    }
}

/// Grouping key shared by every order in a lot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LotKey {
    pub destination_city: String,
    pub priority: PriorityClass,
}

impl fmt::Display for LotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination_city, self.priority.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentLot {
    pub id: LotId,
    pub key: LotKey,
    pub member_orders: Vec<Order>,
    pub created_at: DateTime<Utc>,
}

impl ShipmentLot {
    pub fn new(key: LotKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            member_orders: vec![],
            created_at: Utc::now(),
        }
    }

    pub fn push(&mut self, order: Order) -> Result<()> {
        if order.lot_key() != self.key {
            return Err(AgentError::Validation(format!(
                "Order {} for {} does not belong to lot {}",
                order.id,
                order.lot_key(),
                self.key
            )));
        }
        self.member_orders.push(order);
        Ok(())
    }

    pub fn total_weight(&self) -> f64 {
        self.member_orders.iter().map(|order| order.total_weight).sum()
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        self.member_orders.iter().map(|order| order.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.member_orders.is_empty()
    }
}

/// Catalog entry. Products without a seller are the store's own stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub brand: String,
    pub product_type: String,
    pub price: f64,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller: Option<String>,
}

impl Product {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Validation("Product name cannot be empty".to_string()));
        }
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(AgentError::Validation("Product price must be greater than 0".to_string()));
        }
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(AgentError::Validation("Product weight must be greater than 0".to_string()));
        }
        if self.seller.as_deref().is_some_and(|seller| seller.trim().is_empty()) {
            return Err(AgentError::Validation("Seller name cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn is_external(&self) -> bool {
        self.seller.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnReason {
    Defective,
    Wrong,
    Unsatisfactory,
}

impl ReturnReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnReason::Defective => "defective",
            ReturnReason::Wrong => "wrong",
            ReturnReason::Unsatisfactory => "unsatisfactory",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "defective" => Ok(ReturnReason::Defective),
            "wrong" => Ok(ReturnReason::Wrong),
            "unsatisfactory" => Ok(ReturnReason::Unsatisfactory),
            other => Err(AgentError::Validation(format!("Unknown return reason: {}", other))),
        }
    }
}

/// One proposal collected during a solicitation round.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub bidder: AgentIdentity,
    pub price: f64,
    pub promised_date: DateTime<Utc>,
}

/// Delivery lead time for a priority class.
#[derive(Debug, Clone, Copy)]
pub struct LeadTimes {
    pub urgent: Duration,
    pub standard: Duration,
}

impl LeadTimes {
    pub fn for_priority(&self, priority: PriorityClass) -> Duration {
        match priority {
            PriorityClass::Urgent => self.urgent,
            PriorityClass::Standard => self.standard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(weight: f64, price: f64) -> LineItem {
        LineItem {
            name: "kettle".to_string(),
            brand: Some("Acme".to_string()),
            price,
            weight,
        }
    }

    #[test]
    fn order_totals_come_from_line_items() {
        let order = Order::new(
            "Barcelona".to_string(),
            PriorityClass::Urgent,
            "ES00-1234".to_string(),
            vec![item(2.0, 10.0), item(3.5, 4.5)],
        );
        assert_eq!(order.total_weight, 5.5);
        assert_eq!(order.total_price, 14.5);
        assert!(order.validate().is_ok());
    }

    #[test]
    fn empty_order_is_invalid() {
        let order = Order::new("Girona".to_string(), PriorityClass::Standard, "acc".to_string(), vec![]);
        assert!(order.validate().is_err());
    }

    #[test]
    fn lot_rejects_orders_for_other_destinations() {
        let order = Order::new("Lleida".to_string(), PriorityClass::Standard, "acc".to_string(), vec![item(1.0, 1.0)]);
        let mut lot = ShipmentLot::new(LotKey {
            destination_city: "Tarragona".to_string(),
            priority: PriorityClass::Standard,
        });
        assert!(lot.push(order).is_err());
        assert!(lot.is_empty());
    }

    #[test]
    fn product_needs_a_name_price_and_weight() {
        let mut product = Product {
            id: Uuid::new_v4(),
            name: "Toaster".to_string(),
            brand: "Acme".to_string(),
            product_type: "kitchen".to_string(),
            price: 30.0,
            weight: 1.8,
            seller: Some("BotigaExterna".to_string()),
        };
        assert!(product.validate().is_ok());
        assert!(product.is_external());

        product.price = 0.0;
        assert!(product.validate().is_err());
        product.price = 30.0;
        product.seller = Some(" ".to_string());
        assert!(product.validate().is_err());
    }

    #[test]
    fn identity_uri_is_namespaced() {
        let identity = AgentIdentity::served_at("CarrierA", CapabilityType::TransportProvider, "localhost", 9002);
        assert_eq!(identity.uri, "http://www.agentes.org#CarrierA");
        assert_eq!(identity.comm_address, "http://localhost:9002/comm");
        assert_eq!(identity.control_address.as_deref(), Some("http://localhost:9002/stop"));
    }
}
