use crate::{
    acl::{Content, CounterOffer, Envelope, Performative, TransportOffer, TransportSolicitation},
    client::AgentClient,
    config::CarrierConfig,
    server::MessageHandler,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// Discount (percent) below which a counter-offer is accepted outright.
pub const ACCEPT_BELOW_PCT: f64 = 6.0;
/// Discount (percent) from which a counter-offer is rejected.
pub const REJECT_FROM_PCT: f64 = 11.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterOfferResponse {
    Accept,
    /// Meet halfway at this price.
    Recounter(f64),
    Reject,
}

impl CounterOfferResponse {
    pub fn performative(&self) -> Performative {
        match self {
            CounterOfferResponse::Accept => Performative::Accept,
            CounterOfferResponse::Recounter(_) => Performative::Propose,
            CounterOfferResponse::Reject => Performative::Reject,
        }
    }
}

/// Requested concession in percent, rounded to six decimals so that values
/// such as `100 -> 89` land exactly on their band edge.
pub fn discount_pct(offer: &CounterOffer) -> f64 {
    let raw = 100.0 * (1.0 - offer.counter_price / offer.original_price);
    (raw * 1e6).round() / 1e6
}

pub fn evaluate_counter_offer(offer: &CounterOffer) -> CounterOfferResponse {
    if offer.original_price <= 0.0 || !offer.counter_price.is_finite() {
        return CounterOfferResponse::Reject;
    }
    let discount = discount_pct(offer);
    if discount < ACCEPT_BELOW_PCT {
        CounterOfferResponse::Accept
    } else if discount < REJECT_FROM_PCT {
        CounterOfferResponse::Recounter(offer.original_price * (1.0 - discount / 200.0))
    } else {
        CounterOfferResponse::Reject
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BidPolicy {
    pub lead_time: Duration,
    pub price_factor_min: f64,
    pub price_factor_max: f64,
}

impl Default for BidPolicy {
    fn default() -> Self {
        Self::from(&CarrierConfig::default())
    }
}

impl From<&CarrierConfig> for BidPolicy {
    fn from(config: &CarrierConfig) -> Self {
        Self {
            lead_time: Duration::days(config.lead_days),
            price_factor_min: config.price_factor_min,
            price_factor_max: config.price_factor_max,
        }
    }
}

/// External transport provider. Keeps no state between requests besides
/// its conversation counter.
pub struct TransportBidder {
    client: Arc<AgentClient>,
    policy: BidPolicy,
}

impl TransportBidder {
    pub fn new(client: Arc<AgentClient>, policy: BidPolicy) -> Self {
        Self { client, policy }
    }

    /// `None` when the deadline cannot be met. An empty factor range prices
    /// at `price_factor_min`.
    pub fn quote(&self, solicitation: &TransportSolicitation) -> Option<TransportOffer> {
        let promised_date = Utc::now() + self.policy.lead_time;
        if promised_date > solicitation.max_delivery_date {
            return None;
        }
        let factor = if self.policy.price_factor_min < self.policy.price_factor_max {
            rand::thread_rng().gen_range(self.policy.price_factor_min..self.policy.price_factor_max)
        } else {
            self.policy.price_factor_min
        };
        Some(TransportOffer {
            price: solicitation.weight * factor,
            promised_date,
        })
    }

    fn on_solicitation(&self, request: &Envelope, solicitation: &TransportSolicitation) -> Envelope {
        match self.quote(solicitation) {
            Some(offer) => {
                info!(
                    "{} bids {:.2} for lot {} to {}",
                    self.client.identity().name,
                    offer.price,
                    solicitation.lot_id,
                    solicitation.destination_city
                );
                self.client
                    .reply_to(request, Performative::Propose, Some(Content::TransportOffer(offer)))
            }
            None => {
                info!(
                    "{} cannot deliver lot {} by {}",
                    self.client.identity().name,
                    solicitation.lot_id,
                    solicitation.max_delivery_date
                );
                self.client.reply_to(request, Performative::Refuse, None)
            }
        }
    }

    fn on_counter_offer(&self, request: &Envelope, offer: &CounterOffer) -> Envelope {
        let response = evaluate_counter_offer(offer);
        debug!(
            "{} answers counter-offer {:.2} -> {:.2} with {:?}",
            self.client.identity().name,
            offer.original_price,
            offer.counter_price,
            response
        );
        let content = match response {
            CounterOfferResponse::Recounter(price) => Some(Content::CounterOffer(CounterOffer {
                original_price: offer.original_price,
                counter_price: price,
            })),
            _ => None,
        };
        self.client.reply_to(request, response.performative(), content)
    }
}

#[async_trait]
impl MessageHandler for TransportBidder {
    fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        match (envelope.performative, &envelope.content) {
            (Performative::CallForProposal, Some(Content::CallForTransport(solicitation))) => {
                self.on_solicitation(&envelope, solicitation)
            }
            (Performative::Request, Some(Content::CounterOffer(offer))) => self.on_counter_offer(&envelope, offer),
            (Performative::AcceptProposal, _) | (Performative::RejectProposal, _) | (Performative::Inform, _) => {
                debug!(
                    "{} acknowledges {} from {}",
                    self.client.identity().name,
                    envelope.performative,
                    envelope.sender
                );
                self.client.reply_to(&envelope, Performative::Inform, None)
            }
            _ => self.not_understood(Some(envelope.sender.as_str())),
        }
    }
}
