//! Speech-act message envelope and its wire encoding.
//!
//! A wire document is a JSON object:
//!
//! ```json
//! {
//!   "performative": "call-for-proposal",
//!   "sender": "http://www.agentes.org#LogisticsCenter",
//!   "receiver": "http://www.agentes.org#CarrierA",
//!   "conversationSeq": 7,
//!   "contentRef": "LogisticsCenter-call-for-transport-7",
//!   "contentBody": {
//!     "LogisticsCenter-call-for-transport-7": {
//!       "action": "call-for-transport", "weight": 12.5, "maxDeliveryDate": "..."
//!     }
//!   }
//! }
//! ```
//!
//! `contentBody` is a set of nodes keyed by reference; `contentRef` names the
//! node holding the payload. The payload node is decoded into a typed
//! [`Content`] keyed by its `action` tag.

use crate::{
    catalog::ProductFilter,
    error::{AgentError, DecodeError, Result},
    model::{CapabilityType, LineItem, Order, PriorityClass, Product, ReturnReason},
    LotId, OrderId,
};
use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Performative {
    Request,
    Propose,
    CallForProposal,
    Accept,
    AcceptProposal,
    Reject,
    RejectProposal,
    Agree,
    Refuse,
    Confirm,
    Inform,
    InformDone,
    InformResult,
    NotUnderstood,
}

impl Performative {
    pub const ALL: [Performative; 14] = [
        Performative::Request,
        Performative::Propose,
        Performative::CallForProposal,
        Performative::Accept,
        Performative::AcceptProposal,
        Performative::Reject,
        Performative::RejectProposal,
        Performative::Agree,
        Performative::Refuse,
        Performative::Confirm,
        Performative::Inform,
        Performative::InformDone,
        Performative::InformResult,
        Performative::NotUnderstood,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Performative::Request => "request",
            Performative::Propose => "propose",
            Performative::CallForProposal => "call-for-proposal",
            Performative::Accept => "accept",
            Performative::AcceptProposal => "accept-proposal",
            Performative::Reject => "reject",
            Performative::RejectProposal => "reject-proposal",
            Performative::Agree => "agree",
            Performative::Refuse => "refuse",
            Performative::Confirm => "confirm",
            Performative::Inform => "inform",
            Performative::InformDone => "inform-done",
            Performative::InformResult => "inform-result",
            Performative::NotUnderstood => "not-understood",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == value)
    }
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered collection carried on the wire as `{"0": .., "1": .., ...}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexedCollection<T>(pub Vec<T>);

impl<T> IndexedCollection<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Serialize> Serialize for IndexedCollection<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (index, item) in self.0.iter().enumerate() {
            map.serialize_entry(&index.to_string(), item)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for IndexedCollection<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IndexedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for IndexedVisitor<T> {
            type Value = IndexedCollection<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map keyed by ordinals 0..n-1")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut items: Vec<(usize, T)> = Vec::new();
                while let Some(key) = access.next_key::<String>()? {
                    let index = key
                        .parse::<usize>()
                        .map_err(|_| de::Error::custom(format!("non-ordinal key `{}`", key)))?;
                    items.push((index, access.next_value()?));
                }
                items.sort_by_key(|(index, _)| *index);
                for (expected, (index, _)) in items.iter().enumerate() {
                    if expected != *index {
                        return Err(de::Error::custom(format!("missing ordinal {}", expected)));
                    }
                }
                Ok(IndexedCollection(items.into_iter().map(|(_, item)| item).collect()))
            }
        }

        deserializer.deserialize_map(IndexedVisitor(PhantomData))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub uri: String,
    pub name: String,
    pub address: String,
    pub capability_type: CapabilityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityQuery {
    pub capability_type: CapabilityType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub uri: String,
    pub address: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSolicitation {
    pub lot_id: LotId,
    pub destination_city: String,
    pub weight: f64,
    pub max_delivery_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOffer {
    pub price: f64,
    pub promised_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterOffer {
    pub original_price: f64,
    pub counter_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipOrder {
    pub order: Order,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub destination_city: String,
    pub priority: PriorityClass,
    pub payment_ref: String,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub order_id: OrderId,
    pub total_price: f64,
    pub estimated_delivery: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCharge {
    pub order_id: OrderId,
    pub account: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentSettlement {
    pub lot_id: LotId,
    pub carrier: String,
    pub shipping_price: f64,
    pub charges: IndexedCollection<OrderCharge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundInstruction {
    pub order_id: OrderId,
    pub account: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRegistration {
    pub product: Product,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequest {
    pub order_id: OrderId,
    /// Line item name as it appears on the order.
    pub item_name: String,
    pub reason: ReturnReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnVerdict {
    pub order_id: OrderId,
    pub item_name: String,
    pub accepted: bool,
    /// Amount refunded; zero when the return is declined.
    pub refund: f64,
    pub message: String,
}

/// Payload node, tagged by the action it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Content {
    Register(Registration),
    Search(CapabilityQuery),
    SearchAll(CapabilityQuery),
    DirectoryEntry(DirectoryEntry),
    DirectoryListing(IndexedCollection<DirectoryEntry>),
    CallForTransport(TransportSolicitation),
    TransportOffer(TransportOffer),
    CounterOffer(CounterOffer),
    ShipOrder(ShipOrder),
    ProcessPurchase(PurchaseRequest),
    PurchaseReceipt(PurchaseReceipt),
    SettleShipment(ShipmentSettlement),
    Refund(RefundInstruction),
    SearchProducts(ProductFilter),
    ProductList(IndexedCollection<Product>),
    RegisterProduct(ProductRegistration),
    ReturnProduct(ReturnRequest),
    ReturnVerdict(ReturnVerdict),
    /// Any action tag this build has no type for.
    #[serde(other)]
    Unrecognized,
}

impl Content {
    pub fn action(&self) -> &'static str {
        match self {
            Content::Register(_) => "register",
            Content::Search(_) => "search",
            Content::SearchAll(_) => "search-all",
            Content::DirectoryEntry(_) => "directory-entry",
            Content::DirectoryListing(_) => "directory-listing",
            Content::CallForTransport(_) => "call-for-transport",
            Content::TransportOffer(_) => "transport-offer",
            Content::CounterOffer(_) => "counter-offer",
            Content::ShipOrder(_) => "ship-order",
            Content::ProcessPurchase(_) => "process-purchase",
            Content::PurchaseReceipt(_) => "purchase-receipt",
            Content::SettleShipment(_) => "settle-shipment",
            Content::Refund(_) => "refund",
            Content::SearchProducts(_) => "search-products",
            Content::ProductList(_) => "product-list",
            Content::RegisterProduct(_) => "register-product",
            Content::ReturnProduct(_) => "return-product",
            Content::ReturnVerdict(_) => "return-verdict",
            Content::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub performative: Performative,
    pub sender: String,
    pub receiver: Option<String>,
    pub conversation_seq: u64,
    pub content_ref: Option<String>,
    pub content: Option<Content>,
}

impl Envelope {
    pub fn new(performative: Performative, sender: impl Into<String>, conversation_seq: u64) -> Self {
        Self {
            performative,
            sender: sender.into(),
            receiver: None,
            conversation_seq,
            content_ref: None,
            content: None,
        }
    }

    pub fn to(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_content(mut self, content_ref: impl Into<String>, content: Content) -> Self {
        self.content_ref = Some(content_ref.into());
        self.content = Some(content);
        self
    }

    pub fn is(&self, performative: Performative) -> bool {
        self.performative == performative
    }
}

/// Outcome of [`decode`]. A document without a recognizable performative is
/// not an error: the owning agent answers it with `not-understood`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Envelope),
    Unparseable,
}

pub fn encode(envelope: &Envelope) -> Result<Value> {
    let mut doc = Map::new();
    doc.insert("performative".into(), Value::String(envelope.performative.as_str().into()));
    doc.insert("sender".into(), Value::String(envelope.sender.clone()));
    if let Some(receiver) = &envelope.receiver {
        doc.insert("receiver".into(), Value::String(receiver.clone()));
    }
    doc.insert("conversationSeq".into(), Value::from(envelope.conversation_seq));

    match (&envelope.content_ref, &envelope.content) {
        (Some(reference), Some(content)) => {
            let mut body = Map::new();
            body.insert(reference.clone(), serde_json::to_value(content)?);
            doc.insert("contentRef".into(), Value::String(reference.clone()));
            doc.insert("contentBody".into(), Value::Object(body));
        }
        (None, None) => {}
        (Some(reference), None) => {
            return Err(AgentError::Validation(format!(
                "content reference `{}` without a content node",
                reference
            )))
        }
        (None, Some(content)) => {
            return Err(AgentError::Validation(format!(
                "`{}` content without a reference",
                content.action()
            )))
        }
    }

    Ok(Value::Object(doc))
}

pub fn decode(doc: &Value) -> std::result::Result<Decoded, DecodeError> {
    let Some(fields) = doc.as_object() else {
        return Ok(Decoded::Unparseable);
    };
    let Some(performative) = fields
        .get("performative")
        .and_then(Value::as_str)
        .and_then(Performative::parse)
    else {
        return Ok(Decoded::Unparseable);
    };

    let sender = match fields.get("sender") {
        Some(Value::String(sender)) => sender.clone(),
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "sender",
                reason: format!("expected a URI string, got {}", other),
            })
        }
        None => return Err(DecodeError::MissingField("sender")),
    };

    let receiver = match fields.get("receiver") {
        Some(Value::String(receiver)) => Some(receiver.clone()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "receiver",
                reason: format!("expected a URI string, got {}", other),
            })
        }
    };

    let conversation_seq = fields
        .get("conversationSeq")
        .ok_or(DecodeError::MissingField("conversationSeq"))?
        .as_u64()
        .ok_or_else(|| DecodeError::InvalidField {
            field: "conversationSeq",
            reason: "expected a non-negative integer".to_string(),
        })?;

    let (content_ref, content) = match fields.get("contentRef") {
        Some(Value::String(reference)) => {
            let node = fields
                .get("contentBody")
                .and_then(Value::as_object)
                .and_then(|body| body.get(reference))
                .ok_or_else(|| DecodeError::DanglingContentRef(reference.clone()))?;
            let content = Content::deserialize(node)
                .map_err(|e| DecodeError::MalformedContent(e.to_string()))?;
            (Some(reference.clone()), Some(content))
        }
        Some(Value::Null) | None => (None, None),
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "contentRef",
                reason: format!("expected a node reference, got {}", other),
            })
        }
    };

    Ok(Decoded::Message(Envelope {
        performative,
        sender,
        receiver,
        conversation_seq,
        content_ref,
        content,
    }))
}

/// Decodes raw bytes; anything that is not JSON is unparseable.
pub fn decode_slice(bytes: &[u8]) -> std::result::Result<Decoded, DecodeError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(doc) => decode(&doc),
        Err(_) => Ok(Decoded::Unparseable),
    }
}
