use acl_marketplace::{
    acl::{ProductRegistration, PurchaseRequest, ReturnRequest, ShipOrder, TransportOffer},
    carrier::{BidPolicy, TransportBidder},
    ledger::{OrderLedger, SqliteLedger},
    logistics::{Clock, DispatchOutcome, DispatchPolicy, NegotiationState},
    model::{AgentIdentity, LineItem, OrderStatus, PriorityClass, Product, ReturnReason},
    sales::{SalesPolicy, SalesProcessor},
    server::MessageHandler,
    treasury::{TransferKind, Treasurer},
    AgentClient, CapabilityType, Content, DirectoryService, Envelope, LocalChannel, LogisticsCoordinator,
    Order, Performative, ProductFilter, RetryPolicy, SqliteCatalog,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

const DIRECTORY: &str = "local://directory";
const LOGISTICS: &str = "local://logistics";

struct TestClock(Mutex<DateTime<FixedOffset>>);

impl TestClock {
    fn at(hour: u32) -> Arc<Self> {
        Arc::new(Self(Mutex::new(local(hour))))
    }

    fn set(&self, hour: u32) {
        *self.0.lock() = local(hour);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.0.lock()
    }
}

/// `hour` o'clock today, so deadlines derived from the clock stay in the future.
fn local(hour: u32) -> DateTime<FixedOffset> {
    let today = Utc::now().date_naive();
    FixedOffset::east_opt(3600)
        .unwrap()
        .with_ymd_and_hms(today.year(), today.month(), today.day(), hour, 0, 0)
        .unwrap()
}

/// Bidder with a fixed price and a fixed answer to counter-offers, recording
/// every performative it receives. With a `bid_delay` it stalls before
/// answering a solicitation.
struct ScriptedBidder {
    client: AgentClient,
    price: Option<f64>,
    counter_answer: Performative,
    bid_delay: Option<std::time::Duration>,
    seen: Mutex<Vec<Performative>>,
}

impl ScriptedBidder {
    fn seen(&self) -> Vec<Performative> {
        self.seen.lock().clone()
    }

    fn count(&self, performative: Performative) -> usize {
        self.seen().iter().filter(|p| **p == performative).count()
    }
}

#[async_trait]
impl MessageHandler for ScriptedBidder {
    fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        self.seen.lock().push(envelope.performative);
        match envelope.performative {
            Performative::CallForProposal => {
                if let Some(delay) = self.bid_delay {
                    tokio::time::sleep(delay).await;
                }
                match self.price {
                    Some(price) => self.client.reply_to(
                        &envelope,
                        Performative::Propose,
                        Some(Content::TransportOffer(TransportOffer {
                            price,
                            promised_date: Utc::now() + Duration::days(1),
                        })),
                    ),
                    None => self.client.reply_to(&envelope, Performative::Refuse, None),
                }
            }
            Performative::Request => self.client.reply_to(&envelope, self.counter_answer, None),
            _ => self.client.reply_to(&envelope, Performative::Inform, None),
        }
    }
}

struct Market {
    channel: LocalChannel,
    directory: Arc<DirectoryService>,
    coordinator: Arc<LogisticsCoordinator>,
    treasurer: Arc<Treasurer>,
    ledger: Arc<SqliteLedger>,
    clock: Arc<TestClock>,
}

impl Market {
    async fn open_at(hour: u32) -> Self {
        let channel = LocalChannel::new();

        let directory = Arc::new(DirectoryService::new(agent_client(&channel, "Directory", CapabilityType::Directory)));
        channel.mount_at(DIRECTORY, directory.clone());

        let treasurer = Arc::new(Treasurer::new(
            agent_client(&channel, "Treasurer", CapabilityType::Treasurer),
            "MiTienda000",
        ));
        directory.register(treasurer.identity().clone());
        channel.mount(treasurer.clone());

        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let clock = TestClock::at(hour);
        let policy = DispatchPolicy {
            bid_timeout: std::time::Duration::from_secs(1),
            ..DispatchPolicy::default()
        };
        let logistics_client = Arc::new(
            AgentClient::new(
                AgentIdentity::new("LogisticsCenter", CapabilityType::LogisticsCenter, LOGISTICS),
                Arc::new(channel.clone()),
            )
            .with_retry(RetryPolicy::no_retry()),
        );
        let coordinator = Arc::new(
            LogisticsCoordinator::new(logistics_client, DIRECTORY, ledger.clone(), policy).with_clock(clock.clone()),
        );
        directory.register(coordinator.identity().clone());
        channel.mount(coordinator.clone());

        Self {
            channel,
            directory,
            coordinator,
            treasurer,
            ledger,
            clock,
        }
    }

    fn bidder(&self, name: &str, price: Option<f64>, counter_answer: Performative) -> Arc<ScriptedBidder> {
        self.mount_bidder(name, price, counter_answer, None)
    }

    /// Bidder that answers solicitations only after `delay`.
    fn slow_bidder(&self, name: &str, price: f64, delay: std::time::Duration) -> Arc<ScriptedBidder> {
        self.mount_bidder(name, Some(price), Performative::Accept, Some(delay))
    }

    fn mount_bidder(
        &self,
        name: &str,
        price: Option<f64>,
        counter_answer: Performative,
        bid_delay: Option<std::time::Duration>,
    ) -> Arc<ScriptedBidder> {
        let bidder = Arc::new(ScriptedBidder {
            client: AgentClient::new(
                AgentIdentity::new(name, CapabilityType::TransportProvider, format!("local://{}", name)),
                Arc::new(self.channel.clone()),
            ),
            price,
            counter_answer,
            bid_delay,
            seen: Mutex::new(vec![]),
        });
        self.directory.register(bidder.identity().clone());
        self.channel.mount(bidder.clone());
        bidder
    }

    async fn ship(&self, order: Order) -> Envelope {
        let sales = agent_client(&self.channel, "SalesProcessor", CapabilityType::SalesProcessor);
        let request = sales.message(
            Performative::Request,
            Some("http://www.agentes.org#LogisticsCenter"),
            Some(Content::ShipOrder(ShipOrder { order })),
        );
        sales.request(LOGISTICS, &request).await.unwrap()
    }
}

fn agent_client(channel: &LocalChannel, name: &str, capability: CapabilityType) -> Arc<AgentClient> {
    Arc::new(AgentClient::new(
        AgentIdentity::new(name, capability, format!("local://{}", name)),
        Arc::new(channel.clone()),
    ))
}

fn order(city: &str, priority: PriorityClass) -> Order {
    Order::new(
        city.to_string(),
        priority,
        "ES91-2100-0418".to_string(),
        vec![
            LineItem {
                name: "Bookshelf".to_string(),
                brand: Some("Fusta".to_string()),
                price: 120.0,
                weight: 18.0,
            },
            LineItem {
                name: "Reading lamp".to_string(),
                brand: None,
                price: 30.0,
                weight: 2.0,
            },
        ],
    )
}

#[tokio::test]
async fn test_lowest_bidder_wins_and_losers_are_rejected() {
    let market = Market::open_at(10).await;
    let x = market.bidder("CarrierX", Some(100.0), Performative::Accept);
    let y = market.bidder("CarrierY", Some(80.0), Performative::Accept);
    let z = market.bidder("CarrierZ", Some(90.0), Performative::Accept);

    let order = order("Girona", PriorityClass::Urgent);
    let order_id = order.id;
    let reply = market.ship(order).await;
    assert!(reply.is(Performative::InformDone));

    assert_eq!(
        y.seen(),
        vec![
            Performative::CallForProposal,
            Performative::Request,
            Performative::AcceptProposal
        ]
    );
    for loser in [&x, &z] {
        assert_eq!(
            loser.seen(),
            vec![Performative::CallForProposal, Performative::RejectProposal]
        );
    }

    let journal = market.treasurer.journal();
    let payment = journal
        .iter()
        .find(|transfer| transfer.kind == TransferKind::CarrierPayment)
        .unwrap();
    assert_eq!(payment.to, "http://www.agentes.org#CarrierY");
    assert!(payment.amount < 80.0 && payment.amount > 80.0 * 0.85);

    let charge = journal
        .iter()
        .find(|transfer| transfer.kind == TransferKind::Charge)
        .unwrap();
    assert_eq!(charge.amount, 150.0);
    assert_eq!(charge.reference, order_id.to_string());

    assert_eq!(
        market.ledger.status(order_id).await.unwrap(),
        Some(OrderStatus::ReadyToCharge)
    );
    let stored = market.ledger.get(order_id).await.unwrap().unwrap();
    let expected_deadline = local(10).with_timezone(&Utc) + Duration::days(2);
    assert_eq!(
        stored.delivery_deadline.map(|deadline| deadline.timestamp_millis()),
        Some(expected_deadline.timestamp_millis())
    );
    assert!(market.coordinator.lots().is_empty());
}

#[tokio::test]
async fn test_orders_outside_window_accumulate_without_solicitation() {
    let market = Market::open_at(22).await;
    let a = market.bidder("CarrierA", Some(50.0), Performative::Accept);
    let b = market.bidder("CarrierB", Some(60.0), Performative::Accept);

    assert!(market.ship(order("Reus", PriorityClass::Standard)).await.is(Performative::InformDone));
    assert!(market.ship(order("Reus", PriorityClass::Standard)).await.is(Performative::InformDone));

    assert!(a.seen().is_empty());
    assert!(b.seen().is_empty());
    assert_eq!(market.coordinator.lots().len(), 1);
    let key = market.coordinator.lots().keys().remove(0);
    assert_eq!(market.coordinator.lots().get(&key).unwrap().member_orders.len(), 2);

    market.clock.set(10);
    let outcomes = market.coordinator.dispatch_pending().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(a.count(Performative::CallForProposal), 1);
    assert_eq!(b.count(Performative::CallForProposal), 1);
    assert!(market.coordinator.lots().is_empty());
    assert!(market.treasurer.journal().iter().filter(|t| t.kind == TransferKind::Charge).count() == 2);
}

#[tokio::test]
async fn test_order_only_dispatches_its_own_lot() {
    let market = Market::open_at(21).await;
    let carrier = market.bidder("CarrierA", Some(40.0), Performative::Accept);

    market.ship(order("Lleida", PriorityClass::Standard)).await;
    market.clock.set(12);
    market.ship(order("Tarragona", PriorityClass::Urgent)).await;

    assert_eq!(carrier.count(Performative::CallForProposal), 1);
    let keys = market.coordinator.lots().keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].destination_city, "Lleida");
}

#[tokio::test]
async fn test_lot_without_bids_is_held_over() {
    let market = Market::open_at(11).await;
    let picky = market.bidder("CarrierSlow", None, Performative::Reject);

    assert!(market.ship(order("Vic", PriorityClass::Urgent)).await.is(Performative::InformDone));
    assert_eq!(picky.seen(), vec![Performative::CallForProposal]);
    assert_eq!(market.coordinator.lots().len(), 1);
    assert!(market.treasurer.journal().is_empty());

    let key = market.coordinator.lots().keys().remove(0);
    let outcome = market.coordinator.dispatch_lot(&key).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::HeldOver);
    assert!(market.coordinator.lots().get(&key).is_some());
}

#[tokio::test]
async fn test_unreachable_bidder_counts_as_refusal() {
    let market = Market::open_at(9).await;
    market.directory.register(AgentIdentity::new(
        "CarrierGone",
        CapabilityType::TransportProvider,
        "local://CarrierGone",
    ));
    let available = market.bidder("CarrierB", Some(70.0), Performative::Accept);

    market.ship(order("Manresa", PriorityClass::Standard)).await;

    assert_eq!(available.count(Performative::AcceptProposal), 1);
    assert!(market.coordinator.lots().is_empty());
}

#[tokio::test]
async fn test_bidder_slower_than_bid_timeout_counts_as_refusal() {
    let market = Market::open_at(22).await;
    let slow = market.slow_bidder("CarrierSnail", 10.0, std::time::Duration::from_secs(3));
    let fast = market.bidder("CarrierFast", Some(70.0), Performative::Accept);

    market.ship(order("Figueres", PriorityClass::Urgent)).await;
    market.clock.set(10);
    let key = market.coordinator.lots().keys().remove(0);
    let DispatchOutcome::Settled(settled) = market.coordinator.dispatch_lot(&key).await.unwrap() else {
        panic!("expected the lot to settle");
    };

    assert_eq!(settled.carrier.name, "CarrierFast");
    assert_eq!(settled.original_price, 70.0);
    assert_eq!(slow.seen(), vec![Performative::CallForProposal]);
    assert_eq!(fast.count(Performative::RejectProposal), 0);
    assert_eq!(fast.count(Performative::AcceptProposal), 1);
}

#[tokio::test]
async fn test_resent_order_is_shipped_and_charged_once() {
    let market = Market::open_at(22).await;
    let carrier = market.bidder("CarrierA", Some(45.0), Performative::Accept);

    let order = order("Blanes", PriorityClass::Standard);
    let order_id = order.id;
    assert!(market.ship(order.clone()).await.is(Performative::InformDone));
    assert!(market.ship(order.clone()).await.is(Performative::InformDone));

    let key = market.coordinator.lots().keys().remove(0);
    assert_eq!(market.coordinator.lots().get(&key).unwrap().member_orders.len(), 1);

    market.clock.set(10);
    market.coordinator.dispatch_pending().await;
    assert!(market.ship(order).await.is(Performative::InformDone));

    let charges = |journal: Vec<acl_marketplace::treasury::Transfer>| {
        journal
            .into_iter()
            .filter(|transfer| transfer.kind == TransferKind::Charge && transfer.reference == order_id.to_string())
            .count()
    };
    assert_eq!(charges(market.treasurer.journal()), 1);
    assert_eq!(carrier.count(Performative::CallForProposal), 1);
    assert!(market.coordinator.lots().is_empty());
}

#[tokio::test]
async fn test_rejected_counter_offer_ships_at_original_price() {
    let market = Market::open_at(20).await;
    let stubborn = market.bidder("CarrierS", Some(64.0), Performative::Reject);

    market.ship(order("Olot", PriorityClass::Standard)).await;
    assert!(stubborn.seen().is_empty());

    market.clock.set(15);
    let key = market.coordinator.lots().keys().remove(0);
    let DispatchOutcome::Settled(settled) = market.coordinator.dispatch_lot(&key).await.unwrap() else {
        panic!("expected the lot to settle");
    };
    assert_eq!(settled.resolution, NegotiationState::Rejected);
    assert_eq!(settled.final_price, 64.0);
    assert_eq!(settled.carrier.name, "CarrierS");
    assert_eq!(stubborn.count(Performative::AcceptProposal), 1);

    let payment = market
        .treasurer
        .journal()
        .into_iter()
        .find(|transfer| transfer.kind == TransferKind::CarrierPayment)
        .unwrap();
    assert_eq!(payment.amount, 64.0);
}

#[tokio::test]
async fn test_purchase_and_return_flow_through_the_treasurer() {
    let market = Market::open_at(12).await;
    for name in ["TransportistaA", "TransportistaB"] {
        let carrier = Arc::new(TransportBidder::new(
            agent_client(&market.channel, name, CapabilityType::TransportProvider),
            BidPolicy::default(),
        ));
        market.directory.register(carrier.identity().clone());
        market.channel.mount(carrier);
    }

    let catalog = SqliteCatalog::with_pool(market.ledger.pool().clone()).await.unwrap();
    let sales = Arc::new(SalesProcessor::new(
        agent_client(&market.channel, "SalesProcessor", CapabilityType::SalesProcessor),
        DIRECTORY,
        market.ledger.clone(),
        Arc::new(catalog),
        SalesPolicy::default(),
    ));
    sales.directory().register().await.unwrap();
    market.channel.mount(sales.clone());

    let seller = agent_client(&market.channel, "Bullidor", CapabilityType::ExternalSeller);
    let listing = seller.message(
        Performative::Request,
        None,
        Some(Content::RegisterProduct(ProductRegistration {
            product: Product {
                id: uuid::Uuid::new_v4(),
                name: "Kettle".to_string(),
                brand: "Bullidor".to_string(),
                product_type: "kitchen".to_string(),
                price: 25.0,
                weight: 1.2,
                seller: Some("Bullidor".to_string()),
            },
        })),
    );
    let reply = seller.request("local://SalesProcessor", &listing).await.unwrap();
    assert!(reply.is(Performative::InformDone));

    let shopper = agent_client(&market.channel, "Shopper", CapabilityType::UserAgent);
    let search = shopper.message(
        Performative::Request,
        None,
        Some(Content::SearchProducts(ProductFilter {
            name: Some("Kettle".to_string()),
            include_external: true,
            ..ProductFilter::default()
        })),
    );
    let reply = shopper.request("local://SalesProcessor", &search).await.unwrap();
    let Some(Content::ProductList(found)) = reply.content else {
        panic!("expected a product list");
    };
    let kettle = found.into_inner().remove(0);

    let request = shopper.message(
        Performative::Request,
        None,
        Some(Content::ProcessPurchase(PurchaseRequest {
            destination_city: "Sitges".to_string(),
            priority: PriorityClass::Urgent,
            payment_ref: "ES12-0049".to_string(),
            line_items: vec![LineItem {
                name: kettle.name.clone(),
                brand: Some(kettle.brand.clone()),
                price: kettle.price,
                weight: kettle.weight,
            }],
        })),
    );
    let reply = shopper.request("local://SalesProcessor", &request).await.unwrap();
    assert!(reply.is(Performative::InformResult));
    let Some(Content::PurchaseReceipt(receipt)) = reply.content else {
        panic!("expected a purchase receipt");
    };

    let ready = market.ledger.ready_to_charge().await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, receipt.order_id);
    assert_eq!(market.treasurer.journal().len(), 2);
    assert!(market.treasurer.balance("MiTienda000") < 25.0);

    let give_back = shopper.message(
        Performative::Request,
        None,
        Some(Content::ReturnProduct(ReturnRequest {
            order_id: receipt.order_id,
            item_name: "Kettle".to_string(),
            reason: ReturnReason::Defective,
        })),
    );
    let reply = shopper.request("local://SalesProcessor", &give_back).await.unwrap();
    assert!(reply.is(Performative::AcceptProposal));

    let refund = market
        .treasurer
        .journal()
        .into_iter()
        .find(|transfer| transfer.kind == TransferKind::Refund)
        .unwrap();
    assert_eq!(refund.to, "ES12-0049");
    assert_eq!(refund.amount, 25.0);
    assert_eq!(market.treasurer.balance("ES12-0049"), 0.0);
}
