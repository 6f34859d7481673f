//! Per-lot negotiation state and the pure decisions taken along the way.

use crate::{
    acl::{Content, CounterOffer, Envelope, Performative},
    model::{Bid, ShipmentLot},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Accumulating,
    Soliciting,
    Evaluating,
    CounterOffering,
    Accepted,
    Rejected,
    Settling,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Accumulating => "ACCUMULATING",
            NegotiationState::Soliciting => "SOLICITING",
            NegotiationState::Evaluating => "EVALUATING",
            NegotiationState::CounterOffering => "COUNTER_OFFERING",
            NegotiationState::Accepted => "ACCEPTED",
            NegotiationState::Rejected => "REJECTED",
            NegotiationState::Settling => "SETTLING",
            NegotiationState::Closed => "CLOSED",
        }
    }

    fn can_advance_to(&self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        matches!(
            (self, next),
            (Accumulating, Soliciting)
                | (Soliciting, Evaluating)
                | (Evaluating, CounterOffering)
                | (Evaluating, Accumulating)
                | (CounterOffering, Accepted)
                | (CounterOffering, Rejected)
                | (Accepted, Settling)
                | (Rejected, Settling)
                | (Settling, Closed)
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient state of one lot while it is out of the store. Never persisted.
#[derive(Debug)]
pub struct NegotiationSession {
    pub lot: ShipmentLot,
    pub delivery_deadline: DateTime<Utc>,
    pub bids: Vec<Bid>,
    pub winner: Option<Bid>,
    pub counter_price: Option<f64>,
    pub final_price: Option<f64>,
    state: NegotiationState,
}

impl NegotiationSession {
    pub fn new(lot: ShipmentLot, delivery_deadline: DateTime<Utc>) -> Self {
        Self {
            lot,
            delivery_deadline,
            bids: vec![],
            winner: None,
            counter_price: None,
            final_price: None,
            state: NegotiationState::Accumulating,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn advance(&mut self, next: NegotiationState) {
        if !self.state.can_advance_to(next) {
            warn!("Lot {}: unexpected transition {} -> {}", self.lot.id, self.state, next);
        }
        debug!("Lot {}: {} -> {}", self.lot.id, self.state, next);
        self.state = next;
    }
}

/// Index of the strictly cheapest bid; the earliest one wins a tie.
pub fn select_winner(bids: &[Bid]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, bid) in bids.iter().enumerate() {
        match best {
            Some(current) if bids[current].price <= bid.price => {}
            _ => best = Some(index),
        }
    }
    best
}

/// Randomized concession requested from the winning bidder.
#[derive(Debug, Clone, Copy)]
pub struct CounterOfferPolicy {
    pub min_discount_pct: f64,
    pub max_discount_pct: f64,
}

impl Default for CounterOfferPolicy {
    fn default() -> Self {
        Self {
            min_discount_pct: 1.0,
            max_discount_pct: 15.0,
        }
    }
}

impl CounterOfferPolicy {
    /// Asks for `min_discount_pct` flat when the range is empty.
    pub fn counter_offer(&self, price: f64) -> CounterOffer {
        let discount = if self.min_discount_pct < self.max_discount_pct {
            rand::thread_rng().gen_range(self.min_discount_pct..self.max_discount_pct)
        } else {
            self.min_discount_pct
        };
        CounterOffer {
            original_price: price,
            counter_price: price * (1.0 - discount / 100.0),
        }
    }
}

/// Maps the winner's answer to the counter-offer onto an outcome state and
/// the price the lot ships at. `None` means the winner could not be reached.
pub fn resolve_counter_reply(reply: Option<&Envelope>, offer: &CounterOffer) -> (NegotiationState, f64) {
    let Some(reply) = reply else {
        return (NegotiationState::Rejected, offer.original_price);
    };

    match reply.performative {
        Performative::Accept => (NegotiationState::Accepted, offer.counter_price),
        Performative::Propose => {
            let proposed = match &reply.content {
                Some(Content::CounterOffer(counter)) if counter.counter_price.is_finite() => counter.counter_price,
                Some(Content::TransportOffer(transport)) if transport.price.is_finite() => transport.price,
                _ => offer.counter_price,
            };
            (
                NegotiationState::Accepted,
                proposed.max(offer.counter_price).min(offer.original_price),
            )
        }
        Performative::Reject => (NegotiationState::Rejected, offer.original_price),
        other => {
            warn!("Winner answered the counter-offer with {}; keeping the original price", other);
            (NegotiationState::Rejected, offer.original_price)
        }
    }
}
