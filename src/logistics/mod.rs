//! Logistics center: batches orders into shipment lots and buys transport
//! for each lot through a call-for-proposal round followed by one
//! counter-offer to the cheapest bidder.

pub mod lots;
pub mod negotiation;

pub use lots::{Admission, LotStore};
pub use negotiation::{
    resolve_counter_reply, select_winner, CounterOfferPolicy, NegotiationSession, NegotiationState,
};

use crate::{
    acl::{
        Content, CounterOffer, Envelope, IndexedCollection, OrderCharge, Performative, ShipOrder,
        ShipmentSettlement, TransportOffer, TransportSolicitation,
    },
    client::AgentClient,
    directory::DirectoryClient,
    error::Result,
    ledger::OrderLedger,
    model::{AgentIdentity, Bid, CapabilityType, LeadTimes, LotKey, OrderStatus},
    server::MessageHandler,
    LotId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in the host's local time zone.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Daily window `[open, close)` in local time during which lots may ship.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl ServiceWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    pub fn contains(&self, at: &DateTime<FixedOffset>) -> bool {
        let time = at.time();
        time >= self.open && time < self.close
    }
}

impl Default for ServiceWindow {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub window: ServiceWindow,
    pub lead_times: LeadTimes,
    pub counter_offer: CounterOfferPolicy,
    /// How long a single bidder may take to answer a solicitation.
    pub bid_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            window: ServiceWindow::default(),
            lead_times: LeadTimes {
                urgent: ChronoDuration::days(2),
                standard: ChronoDuration::days(6),
            },
            counter_offer: CounterOfferPolicy::default(),
            bid_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettledLot {
    pub lot_id: LotId,
    pub key: LotKey,
    pub carrier: AgentIdentity,
    pub original_price: f64,
    pub final_price: f64,
    /// `Accepted` or `Rejected`, depending on how the counter-offer went.
    pub resolution: NegotiationState,
    pub promised_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Outside the service window; the lot keeps accumulating.
    Deferred,
    /// No lot is open under the key.
    NothingToDispatch,
    /// Nobody bid; the lot went back to the store.
    HeldOver,
    Settled(SettledLot),
}

pub struct LogisticsCoordinator {
    client: Arc<AgentClient>,
    directory: DirectoryClient,
    ledger: Arc<dyn OrderLedger>,
    lots: LotStore,
    clock: Arc<dyn Clock>,
    policy: DispatchPolicy,
}

impl LogisticsCoordinator {
    pub fn new(
        client: Arc<AgentClient>,
        directory_address: impl Into<String>,
        ledger: Arc<dyn OrderLedger>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            directory: DirectoryClient::new(client.clone(), directory_address),
            client,
            ledger,
            lots: LotStore::new(),
            clock: Arc::new(SystemClock),
            policy,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn lots(&self) -> &LotStore {
        &self.lots
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    pub fn window_open(&self) -> bool {
        self.policy.window.contains(&self.clock.now())
    }

    async fn on_ship_order(&self, request: &Envelope, ship: &ShipOrder) -> Envelope {
        let order = ship.order.clone();
        if let Err(e) = order.validate() {
            warn!("Refusing order {}: {}", order.id, e);
            return self.client.reply_to(request, Performative::Refuse, None);
        }
        if let Err(e) = self.ledger.record(&order).await {
            error!("Failed to record order {}: {}", order.id, e);
            return self.client.reply_to(request, Performative::Refuse, None);
        }
        match self.ledger.status(order.id).await {
            Ok(Some(OrderStatus::ReadyToCharge)) => {
                info!("Order {} has already shipped; ignoring resend", order.id);
                return self.client.reply_to(request, Performative::InformDone, None);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read status of order {}: {}", order.id, e);
                return self.client.reply_to(request, Performative::Refuse, None);
            }
        }

        let key = match self.lots.add_order(order) {
            Ok(Admission::Added { key, size }) => {
                info!("Lot {} now holds {} order(s)", key, size);
                key
            }
            Ok(Admission::AlreadyQueued(key)) => {
                info!("Order {} is already queued in lot {}; ignoring resend", ship.order.id, key);
                return self.client.reply_to(request, Performative::InformDone, None);
            }
            Err(e) => {
                error!("Failed to accumulate order: {}", e);
                return self.client.reply_to(request, Performative::Refuse, None);
            }
        };

        match self.dispatch_lot(&key).await {
            Ok(DispatchOutcome::Deferred) => debug!("Service window closed; lot {} keeps accumulating", key),
            Ok(outcome) => debug!("Dispatch of {} finished: {:?}", key, outcome),
            Err(e) => warn!("Dispatch of {} failed: {}", key, e),
        }

        self.client.reply_to(request, Performative::InformDone, None)
    }

    /// Runs one negotiation round for the lot under `key` if the service
    /// window is open. Lots nobody bids on are put back.
    pub async fn dispatch_lot(&self, key: &LotKey) -> Result<DispatchOutcome> {
        if !self.window_open() {
            return Ok(DispatchOutcome::Deferred);
        }
        let Some(lot) = self.lots.take(key) else {
            return Ok(DispatchOutcome::NothingToDispatch);
        };
        if lot.is_empty() {
            return Ok(DispatchOutcome::NothingToDispatch);
        }

        let deadline = self.clock.now().with_timezone(&Utc) + self.policy.lead_times.for_priority(lot.key.priority);
        let mut session = NegotiationSession::new(lot, deadline);
        session.advance(NegotiationState::Soliciting);

        let providers = match self.directory.search_all(CapabilityType::TransportProvider).await {
            Ok(providers) => providers,
            Err(e) => {
                self.lots.restore(session.lot);
                return Err(e);
            }
        };
        info!(
            "Soliciting {} transport provider(s) for lot {} ({:.2} kg to {})",
            providers.len(),
            session.lot.id,
            session.lot.total_weight(),
            session.lot.key.destination_city
        );

        session.bids = self.solicit(&session, &providers).await;
        session.advance(NegotiationState::Evaluating);

        let Some(winner_index) = select_winner(&session.bids) else {
            warn!("No bids for lot {}; holding it over", session.lot.id);
            session.advance(NegotiationState::Accumulating);
            self.lots.restore(session.lot);
            return Ok(DispatchOutcome::HeldOver);
        };
        let winner = session.bids[winner_index].clone();
        info!(
            "{} wins lot {} at {:.2} ({} bid(s))",
            winner.bidder.name,
            session.lot.id,
            winner.price,
            session.bids.len()
        );
        self.notify_losers(&session.bids, winner_index).await;
        session.winner = Some(winner.clone());

        session.advance(NegotiationState::CounterOffering);
        let offer = self.policy.counter_offer.counter_offer(winner.price);
        session.counter_price = Some(offer.counter_price);
        let (resolution, final_price) = self.counter_offer(&winner.bidder, &offer).await;
        session.final_price = Some(final_price);
        session.advance(resolution);
        info!(
            "Lot {} {} at {:.2} (asked {:.2}, offered {:.2})",
            session.lot.id, resolution, final_price, offer.counter_price, winner.price
        );

        self.confirm_winner(&winner, final_price).await;

        session.advance(NegotiationState::Settling);
        self.settle(&session, &winner, final_price).await;
        self.lots.release(&session.lot);
        session.advance(NegotiationState::Closed);

        Ok(DispatchOutcome::Settled(SettledLot {
            lot_id: session.lot.id,
            key: session.lot.key.clone(),
            carrier: winner.bidder,
            original_price: winner.price,
            final_price,
            resolution,
            promised_date: winner.promised_date,
        }))
    }

    /// Retries every open lot. Used by the recurring sweep.
    pub async fn dispatch_pending(&self) -> Vec<(LotKey, DispatchOutcome)> {
        let mut outcomes = vec![];
        if !self.window_open() {
            return outcomes;
        }
        for key in self.lots.keys() {
            match self.dispatch_lot(&key).await {
                Ok(outcome) => outcomes.push((key, outcome)),
                Err(e) => warn!("Sweep could not dispatch {}: {}", key, e),
            }
        }
        outcomes
    }

    pub fn spawn_dispatch_loop(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let outcomes = self.dispatch_pending().await;
                if !outcomes.is_empty() {
                    debug!("Dispatch sweep handled {} lot(s)", outcomes.len());
                }
            }
        })
    }

    /// Sends a call-for-proposal to every provider at once. Replies are put
    /// back into directory order; silence and errors count as refusals.
    async fn solicit(&self, session: &NegotiationSession, providers: &[AgentIdentity]) -> Vec<Bid> {
        let solicitation = TransportSolicitation {
            lot_id: session.lot.id,
            destination_city: session.lot.key.destination_city.clone(),
            weight: session.lot.total_weight(),
            max_delivery_date: session.delivery_deadline,
        };

        let mut tasks = JoinSet::new();
        for (index, provider) in providers.iter().cloned().enumerate() {
            let client = self.client.clone();
            let request = client.message(
                Performative::CallForProposal,
                Some(provider.uri.as_str()),
                Some(Content::CallForTransport(solicitation.clone())),
            );
            let timeout = self.policy.bid_timeout;
            tasks.spawn(async move {
                let reply = tokio::time::timeout(timeout, client.request(&provider.comm_address, &request)).await;
                (index, provider, reply)
            });
        }

        let mut bids: Vec<(usize, Bid)> = vec![];
        while let Some(joined) = tasks.join_next().await {
            let (index, provider, reply) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Solicitation task failed: {}", e);
                    continue;
                }
            };
            match reply {
                Ok(Ok(reply)) => match (reply.performative, reply.content) {
                    (Performative::Propose, Some(Content::TransportOffer(TransportOffer { price, promised_date }))) => {
                        debug!("{} proposes {:.2}", provider.name, price);
                        bids.push((
                            index,
                            Bid {
                                bidder: provider,
                                price,
                                promised_date,
                            },
                        ));
                    }
                    (Performative::Refuse, _) => debug!("{} refuses", provider.name),
                    (other, _) => warn!("{} answered the solicitation with {}", provider.name, other),
                },
                Ok(Err(e)) => warn!("{} is unreachable: {}", provider.name, e),
                Err(_) => warn!("{} did not bid within {:?}", provider.name, self.policy.bid_timeout),
            }
        }

        bids.sort_by_key(|(index, _)| *index);
        bids.into_iter().map(|(_, bid)| bid).collect()
    }

    async fn notify_losers(&self, bids: &[Bid], winner_index: usize) {
        for (index, bid) in bids.iter().enumerate() {
            if index == winner_index {
                continue;
            }
            let rejection = self
                .client
                .message(Performative::RejectProposal, Some(bid.bidder.uri.as_str()), None);
            if let Err(e) = self.client.request(&bid.bidder.comm_address, &rejection).await {
                warn!("Could not notify {} of its rejection: {}", bid.bidder.name, e);
            }
        }
    }

    async fn counter_offer(&self, winner: &AgentIdentity, offer: &CounterOffer) -> (NegotiationState, f64) {
        let request = self.client.message(
            Performative::Request,
            Some(winner.uri.as_str()),
            Some(Content::CounterOffer(*offer)),
        );
        match self.client.request(&winner.comm_address, &request).await {
            Ok(reply) => resolve_counter_reply(Some(&reply), offer),
            Err(e) => {
                warn!("Counter-offer to {} failed: {}", winner.name, e);
                resolve_counter_reply(None, offer)
            }
        }
    }

    async fn confirm_winner(&self, winner: &Bid, final_price: f64) {
        let acceptance = self.client.message(
            Performative::AcceptProposal,
            Some(winner.bidder.uri.as_str()),
            Some(Content::TransportOffer(TransportOffer {
                price: final_price,
                promised_date: winner.promised_date,
            })),
        );
        if let Err(e) = self.client.request(&winner.bidder.comm_address, &acceptance).await {
            warn!("Could not confirm lot with {}: {}", winner.bidder.name, e);
        }
    }

    /// Attaches delivery deadlines, marks orders chargeable and tells the
    /// treasurer. Failures here are logged; the lot has already shipped.
    async fn settle(&self, session: &NegotiationSession, winner: &Bid, final_price: f64) {
        let lot = &session.lot;
        for order in &lot.member_orders {
            if let Err(e) = self
                .ledger
                .attach_delivery_deadline(order.id, session.delivery_deadline)
                .await
            {
                warn!("Could not attach deadline to order {}: {}", order.id, e);
            }
        }
        match self.ledger.mark_ready_to_charge(&lot.order_ids()).await {
            Ok(count) => debug!("{} order(s) of lot {} ready to charge", count, lot.id),
            Err(e) => warn!("Could not mark lot {} ready to charge: {}", lot.id, e),
        }

        let treasurer = match self.directory.search_one(CapabilityType::Treasurer).await {
            Ok(Some(treasurer)) => treasurer,
            Ok(None) => {
                warn!("No treasurer registered; lot {} settles without notification", lot.id);
                return;
            }
            Err(e) => {
                warn!("Treasurer lookup failed for lot {}: {}", lot.id, e);
                return;
            }
        };

        let settlement = ShipmentSettlement {
            lot_id: lot.id,
            carrier: winner.bidder.uri.clone(),
            shipping_price: final_price,
            charges: IndexedCollection(
                lot.member_orders
                    .iter()
                    .map(|order| OrderCharge {
                        order_id: order.id,
                        account: order.payment_ref.clone(),
                        amount: order.total_price,
                    })
                    .collect(),
            ),
        };
        let notice = self.client.message(
            Performative::Inform,
            Some(treasurer.uri.as_str()),
            Some(Content::SettleShipment(settlement)),
        );
        match self.client.request(&treasurer.comm_address, &notice).await {
            Ok(reply) if reply.is(Performative::InformDone) => {
                info!("Treasurer acknowledged settlement of lot {}", lot.id)
            }
            Ok(reply) => warn!("Treasurer answered settlement with {}", reply.performative),
            Err(e) => warn!("Could not reach treasurer for lot {}: {}", lot.id, e),
        }
    }
}

#[async_trait]
impl MessageHandler for LogisticsCoordinator {
    fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        match (envelope.performative, &envelope.content) {
            (Performative::Request, Some(Content::ShipOrder(ship))) => self.on_ship_order(&envelope, ship).await,
            _ => self.not_understood(Some(envelope.sender.as_str())),
        }
    }
}
