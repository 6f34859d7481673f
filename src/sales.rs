use crate::{
    acl::{
        Content, Envelope, IndexedCollection, Performative, ProductRegistration, PurchaseReceipt, PurchaseRequest,
        RefundInstruction, ReturnRequest, ReturnVerdict, ShipOrder,
    },
    catalog::{ProductCatalog, ProductFilter},
    client::AgentClient,
    directory::DirectoryClient,
    error::{AgentError, Result},
    ledger::OrderLedger,
    model::{CapabilityType, LeadTimes, Order, ReturnReason},
    server::MessageHandler,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SalesPolicy {
    pub lead_times: LeadTimes,
    /// How long after the expected delivery an unsatisfactory item may be returned.
    pub return_window: Duration,
}

impl Default for SalesPolicy {
    fn default() -> Self {
        Self {
            lead_times: LeadTimes {
                urgent: Duration::days(2),
                standard: Duration::days(6),
            },
            return_window: Duration::days(15),
        }
    }
}

/// Defective and wrong items can always be returned. Unsatisfactory ones only
/// until the return window after the expected delivery closes.
pub fn return_accepted(reason: ReturnReason, order: &Order, policy: &SalesPolicy, now: DateTime<Utc>) -> bool {
    match reason {
        ReturnReason::Defective | ReturnReason::Wrong => true,
        ReturnReason::Unsatisfactory => {
            now <= order.placed_at + policy.lead_times.for_priority(order.priority) + policy.return_window
        }
    }
}

/// Order intake and storefront: records purchases and hands them to the
/// logistics center, lists seller products and settles returns.
pub struct SalesProcessor {
    client: Arc<AgentClient>,
    directory: DirectoryClient,
    ledger: Arc<dyn OrderLedger>,
    catalog: Arc<dyn ProductCatalog>,
    policy: SalesPolicy,
}

impl SalesProcessor {
    pub fn new(
        client: Arc<AgentClient>,
        directory_address: impl Into<String>,
        ledger: Arc<dyn OrderLedger>,
        catalog: Arc<dyn ProductCatalog>,
        policy: SalesPolicy,
    ) -> Self {
        Self {
            directory: DirectoryClient::new(client.clone(), directory_address),
            client,
            ledger,
            catalog,
            policy,
        }
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    async fn place(&self, purchase: &PurchaseRequest) -> Result<PurchaseReceipt> {
        let order = Order::new(
            purchase.destination_city.clone(),
            purchase.priority,
            purchase.payment_ref.clone(),
            purchase.line_items.clone(),
        );
        order.validate()?;
        self.ledger.record(&order).await?;

        let logistics = self
            .directory
            .search_one(CapabilityType::LogisticsCenter)
            .await?
            .ok_or_else(|| AgentError::NotFound("no logistics center registered".to_string()))?;

        let receipt = PurchaseReceipt {
            order_id: order.id,
            total_price: order.total_price,
            estimated_delivery: order.placed_at + self.policy.lead_times.for_priority(order.priority),
        };

        let request = self.client.message(
            Performative::Request,
            Some(logistics.uri.as_str()),
            Some(Content::ShipOrder(ShipOrder { order })),
        );
        let reply = self.client.request(&logistics.comm_address, &request).await?;
        if !reply.is(Performative::InformDone) {
            return Err(AgentError::Protocol(format!(
                "logistics center answered ship-order with {}",
                reply.performative
            )));
        }

        Ok(receipt)
    }

    async fn on_purchase(&self, request: &Envelope, purchase: &PurchaseRequest) -> Envelope {
        match self.place(purchase).await {
            Ok(receipt) => {
                info!(
                    "Order {} placed for {} ({:.2}), delivery by {}",
                    receipt.order_id, purchase.destination_city, receipt.total_price, receipt.estimated_delivery
                );
                self.client
                    .reply_to(request, Performative::InformResult, Some(Content::PurchaseReceipt(receipt)))
            }
            Err(e) => {
                warn!("Purchase from {} refused: {}", request.sender, e);
                self.client.reply_to(request, Performative::Refuse, None)
            }
        }
    }

    async fn on_search(&self, request: &Envelope, filter: &ProductFilter) -> Envelope {
        match self.catalog.search(filter).await {
            Ok(products) => {
                debug!("Product search from {} matched {} item(s)", request.sender, products.len());
                self.client.reply_to(
                    request,
                    Performative::InformResult,
                    Some(Content::ProductList(IndexedCollection(products))),
                )
            }
            Err(e) => {
                warn!("Product search from {} failed: {}", request.sender, e);
                self.client.reply_to(request, Performative::Refuse, None)
            }
        }
    }

    async fn on_register_product(&self, request: &Envelope, registration: &ProductRegistration) -> Envelope {
        let product = &registration.product;
        if let Err(e) = product.validate() {
            warn!("Refusing product {} from {}: {}", product.id, request.sender, e);
            return self.client.reply_to(request, Performative::Refuse, None);
        }
        match self.catalog.add(product).await {
            Ok(true) => info!(
                "Listed {} ({}) from {}",
                product.name,
                product.id,
                product.seller.as_deref().unwrap_or("store stock")
            ),
            Ok(false) => debug!("Product {} is already listed", product.id),
            Err(e) => {
                warn!("Could not list product {}: {}", product.id, e);
                return self.client.reply_to(request, Performative::Refuse, None);
            }
        }
        self.client.reply_to(request, Performative::InformDone, None)
    }

    /// Decides on a return and, when it is accepted, has the treasurer
    /// refund the item price to the order's payment account.
    async fn settle_return(&self, request: &ReturnRequest) -> Result<ReturnVerdict> {
        let order = self
            .ledger
            .get(request.order_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("order {}", request.order_id)))?;
        let item = order
            .line_items
            .iter()
            .find(|item| item.name == request.item_name)
            .ok_or_else(|| {
                AgentError::NotFound(format!("item `{}` on order {}", request.item_name, order.id))
            })?;

        let declined = |message: &str| ReturnVerdict {
            order_id: order.id,
            item_name: item.name.clone(),
            accepted: false,
            refund: 0.0,
            message: message.to_string(),
        };

        if !return_accepted(request.reason, &order, &self.policy, Utc::now()) {
            return Ok(declined("The return period for this item has expired."));
        }
        if !self.ledger.claim_return(order.id, &item.name, request.reason).await? {
            return Ok(declined("This item has already been returned."));
        }

        let refund = RefundInstruction {
            order_id: order.id,
            account: order.payment_ref.clone(),
            amount: item.price,
        };
        if let Err(e) = self.request_refund(refund).await {
            if let Err(release) = self.ledger.release_return(order.id, &item.name).await {
                warn!("Could not release return of {} on order {}: {}", item.name, order.id, release);
            }
            return Err(e);
        }

        Ok(ReturnVerdict {
            order_id: order.id,
            item_name: item.name.clone(),
            accepted: true,
            refund: item.price,
            message: "A courier will collect the item next Monday.".to_string(),
        })
    }

    async fn request_refund(&self, refund: RefundInstruction) -> Result<()> {
        let treasurer = self
            .directory
            .search_one(CapabilityType::Treasurer)
            .await?
            .ok_or_else(|| AgentError::NotFound("no treasurer registered".to_string()))?;
        let request = self.client.message(
            Performative::Request,
            Some(treasurer.uri.as_str()),
            Some(Content::Refund(refund)),
        );
        let reply = self.client.request(&treasurer.comm_address, &request).await?;
        if !reply.is(Performative::InformDone) {
            return Err(AgentError::Protocol(format!(
                "treasurer answered refund with {}",
                reply.performative
            )));
        }
        Ok(())
    }

    async fn on_return(&self, request: &Envelope, return_request: &ReturnRequest) -> Envelope {
        match self.settle_return(return_request).await {
            Ok(verdict) => {
                info!(
                    "Return of {} on order {} ({}): {}",
                    verdict.item_name,
                    verdict.order_id,
                    return_request.reason.as_str(),
                    if verdict.accepted { "accepted" } else { "declined" }
                );
                let performative = if verdict.accepted {
                    Performative::AcceptProposal
                } else {
                    Performative::RejectProposal
                };
                self.client
                    .reply_to(request, performative, Some(Content::ReturnVerdict(verdict)))
            }
            Err(e) => {
                warn!("Return from {} refused: {}", request.sender, e);
                self.client.reply_to(request, Performative::Refuse, None)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for SalesProcessor {
    fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        if !envelope.is(Performative::Request) {
            return self.not_understood(Some(envelope.sender.as_str()));
        }
        match &envelope.content {
            Some(Content::ProcessPurchase(purchase)) => self.on_purchase(&envelope, purchase).await,
            Some(Content::SearchProducts(filter)) => self.on_search(&envelope, filter).await,
            Some(Content::RegisterProduct(registration)) => self.on_register_product(&envelope, registration).await,
            Some(Content::ReturnProduct(return_request)) => self.on_return(&envelope, return_request).await,
            _ => self.not_understood(Some(envelope.sender.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::client::LocalChannel;
    use crate::directory::DirectoryService;
    use crate::ledger::SqliteLedger;
    use crate::model::{AgentIdentity, LineItem, PriorityClass, Product};
    use crate::treasury::{TransferKind, Treasurer};

    const DIRECTORY: &str = "local://directory";

    /// Logistics stand-in that accepts every shipment.
    struct AcceptAll {
        client: AgentClient,
    }

    #[async_trait]
    impl MessageHandler for AcceptAll {
        fn client(&self) -> &AgentClient {
            &self.client
        }

        async fn handle(&self, envelope: Envelope) -> Envelope {
            self.client.reply_to(&envelope, Performative::InformDone, None)
        }
    }

    struct Store {
        channel: LocalChannel,
        directory: Arc<DirectoryService>,
        sales: SalesProcessor,
        ledger: Arc<SqliteLedger>,
        treasurer: Arc<Treasurer>,
    }

    impl Store {
        fn shopper(&self) -> Arc<AgentClient> {
            client(&self.channel, "Shopper", CapabilityType::UserAgent)
        }

        fn open_treasury(&self) {
            self.directory.register(self.treasurer.identity().clone());
            self.channel.mount(self.treasurer.clone());
        }

        async fn request(&self, content: Content) -> Envelope {
            self.sales
                .handle(self.shopper().message(Performative::Request, None, Some(content)))
                .await
        }

        /// Records a delivered order placed `days_ago`.
        async fn delivered_order(&self, priority: PriorityClass, days_ago: i64) -> Order {
            let mut order = Order::new(
                "Cornella".to_string(),
                priority,
                "ES77-2100".to_string(),
                vec![lamp(), kettle()],
            );
            order.placed_at = Utc::now() - Duration::days(days_ago);
            self.ledger.record(&order).await.unwrap();
            order
        }

        fn refunds(&self) -> Vec<crate::treasury::Transfer> {
            self.treasurer
                .journal()
                .into_iter()
                .filter(|transfer| transfer.kind == TransferKind::Refund)
                .collect()
        }
    }

    fn client(channel: &LocalChannel, name: &str, capability: CapabilityType) -> Arc<AgentClient> {
        Arc::new(AgentClient::new(
            AgentIdentity::new(name, capability, format!("local://{}", name)),
            Arc::new(channel.clone()),
        ))
    }

    async fn setup(with_logistics: bool, with_treasurer: bool) -> Store {
        let channel = LocalChannel::new();
        let directory = Arc::new(DirectoryService::new(client(&channel, "Directory", CapabilityType::Directory)));
        channel.mount_at(DIRECTORY, directory.clone());

        if with_logistics {
            let logistics = client(&channel, "LogisticsCenter", CapabilityType::LogisticsCenter);
            directory.register(logistics.identity().clone());
            channel.mount(Arc::new(AcceptAll {
                client: AgentClient::new(logistics.identity().clone(), Arc::new(channel.clone())),
            }));
        }

        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let sales = SalesProcessor::new(
            client(&channel, "SalesProcessor", CapabilityType::SalesProcessor),
            DIRECTORY,
            ledger.clone(),
            catalog,
            SalesPolicy::default(),
        );
        let treasurer = Arc::new(Treasurer::new(
            client(&channel, "Treasurer", CapabilityType::Treasurer),
            "MiTienda000",
        ));
        let store = Store {
            channel,
            directory,
            sales,
            ledger,
            treasurer,
        };
        if with_treasurer {
            store.open_treasury();
        }
        store
    }

    fn purchase(line_items: Vec<LineItem>) -> Content {
        Content::ProcessPurchase(PurchaseRequest {
            destination_city: "Cornella".to_string(),
            priority: PriorityClass::Standard,
            payment_ref: "ES77-2100".to_string(),
            line_items,
        })
    }

    fn lamp() -> LineItem {
        LineItem {
            name: "Lamp".to_string(),
            brand: Some("Lumen".to_string()),
            price: 20.0,
            weight: 2.0,
        }
    }

    fn kettle() -> LineItem {
        LineItem {
            name: "Kettle".to_string(),
            brand: Some("Bullidor".to_string()),
            price: 35.0,
            weight: 1.2,
        }
    }

    fn listing(name: &str, brand: &str, price: f64, seller: Option<&str>) -> Content {
        Content::RegisterProduct(ProductRegistration {
            product: Product {
                id: uuid::Uuid::new_v4(),
                name: name.to_string(),
                brand: brand.to_string(),
                product_type: "home".to_string(),
                price,
                weight: 1.0,
                seller: seller.map(str::to_string),
            },
        })
    }

    fn give_back(order: &Order, item: &str, reason: ReturnReason) -> Content {
        Content::ReturnProduct(ReturnRequest {
            order_id: order.id,
            item_name: item.to_string(),
            reason,
        })
    }

    fn verdict(reply: &Envelope) -> &ReturnVerdict {
        match &reply.content {
            Some(Content::ReturnVerdict(verdict)) => verdict,
            other => panic!("expected a return verdict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn purchase_is_recorded_and_forwarded() {
        let store = setup(true, false).await;

        let reply = store.request(purchase(vec![lamp(), lamp()])).await;
        assert!(reply.is(Performative::InformResult));

        let Some(Content::PurchaseReceipt(receipt)) = reply.content else {
            panic!("expected a receipt");
        };
        assert_eq!(receipt.total_price, 40.0);
        let order = store.ledger.get(receipt.order_id).await.unwrap().unwrap();
        assert_eq!(order.total_weight, 4.0);
        assert_eq!((receipt.estimated_delivery - order.placed_at).num_days(), 6);
    }

    #[tokio::test]
    async fn empty_purchase_is_refused() {
        let store = setup(true, false).await;
        assert!(store.request(purchase(vec![])).await.is(Performative::Refuse));
    }

    #[tokio::test]
    async fn missing_logistics_center_is_refused() {
        let store = setup(false, false).await;
        assert!(store.request(purchase(vec![lamp()])).await.is(Performative::Refuse));
    }

    #[tokio::test]
    async fn seller_products_are_listed_and_searchable() {
        let store = setup(false, false).await;
        for content in [
            listing("Vase", "Terrissa", 18.0, Some("CeramicaPujol")),
            listing("Bowl", "Terrissa", 9.5, Some("CeramicaPujol")),
            listing("Rug", "Llana", 70.0, None),
        ] {
            assert!(store.request(content).await.is(Performative::InformDone));
        }

        let reply = store
            .request(Content::SearchProducts(ProductFilter {
                brand: Some("Terrissa".to_string()),
                include_external: true,
                ..ProductFilter::default()
            }))
            .await;
        assert!(reply.is(Performative::InformResult));
        let Some(Content::ProductList(found)) = reply.content else {
            panic!("expected a product list");
        };
        let names: Vec<String> = found.into_inner().into_iter().map(|product| product.name).collect();
        assert_eq!(names, vec!["Bowl".to_string(), "Vase".to_string()]);

        let reply = store
            .request(Content::SearchProducts(ProductFilter {
                max_price: Some(50.0),
                ..ProductFilter::all()
            }))
            .await;
        let Some(Content::ProductList(found)) = reply.content else {
            panic!("expected a product list");
        };
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn invalid_product_is_refused() {
        let store = setup(false, false).await;
        let reply = store.request(listing("Ghost", "Nobody", -3.0, Some("Fantasma"))).await;
        assert!(reply.is(Performative::Refuse));

        let reply = store.request(Content::SearchProducts(ProductFilter::all())).await;
        let Some(Content::ProductList(found)) = reply.content else {
            panic!("expected a product list");
        };
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn defective_item_is_refunded_once() {
        let store = setup(false, true).await;
        let order = store.delivered_order(PriorityClass::Standard, 60).await;

        let reply = store.request(give_back(&order, "Kettle", ReturnReason::Defective)).await;
        assert!(reply.is(Performative::AcceptProposal));
        assert!(verdict(&reply).accepted);
        assert_eq!(verdict(&reply).refund, 35.0);

        let refunds = store.refunds();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].to, "ES77-2100");
        assert_eq!(refunds[0].amount, 35.0);
        assert_eq!(refunds[0].reference, order.id.to_string());

        let again = store.request(give_back(&order, "Kettle", ReturnReason::Defective)).await;
        assert!(again.is(Performative::RejectProposal));
        assert!(!verdict(&again).accepted);
        assert_eq!(store.refunds().len(), 1);
    }

    #[tokio::test]
    async fn unsatisfactory_return_depends_on_the_window() {
        let store = setup(false, true).await;

        let recent = store.delivered_order(PriorityClass::Urgent, 10).await;
        let reply = store.request(give_back(&recent, "Lamp", ReturnReason::Unsatisfactory)).await;
        assert!(reply.is(Performative::AcceptProposal));

        let old = store.delivered_order(PriorityClass::Standard, 30).await;
        let reply = store.request(give_back(&old, "Lamp", ReturnReason::Unsatisfactory)).await;
        assert!(reply.is(Performative::RejectProposal));
        assert_eq!(verdict(&reply).refund, 0.0);

        assert_eq!(store.refunds().len(), 1);
    }

    #[tokio::test]
    async fn unknown_order_or_item_is_refused() {
        let store = setup(false, true).await;
        let order = store.delivered_order(PriorityClass::Urgent, 1).await;

        let reply = store.request(give_back(&order, "Sofa", ReturnReason::Wrong)).await;
        assert!(reply.is(Performative::Refuse));

        let stranger = Order::new("Sitges".to_string(), PriorityClass::Urgent, "ES00".to_string(), vec![lamp()]);
        let reply = store.request(give_back(&stranger, "Lamp", ReturnReason::Wrong)).await;
        assert!(reply.is(Performative::Refuse));
        assert!(store.refunds().is_empty());
    }

    #[tokio::test]
    async fn failed_refund_can_be_retried() {
        let store = setup(false, false).await;
        let order = store.delivered_order(PriorityClass::Standard, 3).await;

        let reply = store.request(give_back(&order, "Lamp", ReturnReason::Wrong)).await;
        assert!(reply.is(Performative::Refuse));

        store.open_treasury();
        let reply = store.request(give_back(&order, "Lamp", ReturnReason::Wrong)).await;
        assert!(reply.is(Performative::AcceptProposal));
        assert_eq!(store.refunds().len(), 1);
    }

    #[tokio::test]
    async fn other_actions_are_not_understood() {
        let store = setup(true, true).await;
        let reply = store.request(Content::Unrecognized).await;
        assert!(reply.is(Performative::NotUnderstood));

        let inform = store.shopper().message(Performative::Inform, None, None);
        assert!(store.sales.handle(inform).await.is(Performative::NotUnderstood));
    }

    #[test]
    fn return_window_follows_priority_lead_time() {
        let policy = SalesPolicy::default();
        let mut order = Order::new("Vic".to_string(), PriorityClass::Urgent, "ES".to_string(), vec![lamp()]);
        let now = order.placed_at;

        assert!(return_accepted(ReturnReason::Unsatisfactory, &order, &policy, now + Duration::days(17)));
        assert!(!return_accepted(ReturnReason::Unsatisfactory, &order, &policy, now + Duration::days(18)));
        assert!(return_accepted(ReturnReason::Defective, &order, &policy, now + Duration::days(400)));

        order.priority = PriorityClass::Standard;
        assert!(return_accepted(ReturnReason::Unsatisfactory, &order, &policy, now + Duration::days(21)));
        assert!(!return_accepted(ReturnReason::Unsatisfactory, &order, &policy, now + Duration::days(22)));
    }
}
