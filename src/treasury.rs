use crate::{
    acl::{Content, Envelope, Performative, RefundInstruction, ShipmentSettlement},
    client::AgentClient,
    server::MessageHandler,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Charge,
    CarrierPayment,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: uuid::Uuid,
    pub kind: TransferKind,
    pub from: String,
    pub to: String,
    pub amount: f64,
    /// Order or lot the transfer belongs to.
    pub reference: String,
    pub executed_at: DateTime<Utc>,
}

/// Settlement sink. Money movements are only journaled, never executed.
pub struct Treasurer {
    client: Arc<AgentClient>,
    store_account: String,
    journal: RwLock<Vec<Transfer>>,
}

impl Treasurer {
    pub fn new(client: Arc<AgentClient>, store_account: impl Into<String>) -> Self {
        Self {
            client,
            store_account: store_account.into(),
            journal: RwLock::new(vec![]),
        }
    }

    pub fn store_account(&self) -> &str {
        &self.store_account
    }

    pub fn journal(&self) -> Vec<Transfer> {
        self.journal.read().clone()
    }

    /// Net amount received by `account` across the journal.
    pub fn balance(&self, account: &str) -> f64 {
        self.journal
            .read()
            .iter()
            .map(|transfer| {
                let mut net = 0.0;
                if transfer.to == account {
                    net += transfer.amount;
                }
                if transfer.from == account {
                    net -= transfer.amount;
                }
                net
            })
            .sum()
    }

    fn transfer(&self, kind: TransferKind, from: &str, to: &str, amount: f64, reference: String) -> Transfer {
        Transfer {
            id: uuid::Uuid::new_v4(),
            kind,
            from: from.to_string(),
            to: to.to_string(),
            amount,
            reference,
            executed_at: Utc::now(),
        }
    }

    fn on_settlement(&self, request: &Envelope, settlement: &ShipmentSettlement) -> Envelope {
        let mut transfers: Vec<Transfer> = settlement
            .charges
            .0
            .iter()
            .map(|charge| {
                self.transfer(
                    TransferKind::Charge,
                    &charge.account,
                    &self.store_account,
                    charge.amount,
                    charge.order_id.to_string(),
                )
            })
            .collect();
        transfers.push(self.transfer(
            TransferKind::CarrierPayment,
            &self.store_account,
            &settlement.carrier,
            settlement.shipping_price,
            settlement.lot_id.to_string(),
        ));

        info!(
            "Settled lot {}: {} charge(s), {:.2} to {}",
            settlement.lot_id,
            settlement.charges.len(),
            settlement.shipping_price,
            settlement.carrier
        );
        self.journal.write().extend(transfers);
        self.client.reply_to(request, Performative::InformDone, None)
    }

    fn on_refund(&self, request: &Envelope, refund: &RefundInstruction) -> Envelope {
        if refund.amount <= 0.0 || refund.account.trim().is_empty() {
            warn!("Refusing refund for order {}: invalid instruction", refund.order_id);
            return self.client.reply_to(request, Performative::Refuse, None);
        }
        let transfer = self.transfer(
            TransferKind::Refund,
            &self.store_account,
            &refund.account,
            refund.amount,
            refund.order_id.to_string(),
        );
        info!("Refunded {:.2} to {} for order {}", refund.amount, refund.account, refund.order_id);
        self.journal.write().push(transfer);
        self.client.reply_to(request, Performative::InformDone, None)
    }
}

#[async_trait]
impl MessageHandler for Treasurer {
    fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        match (envelope.performative, &envelope.content) {
            (Performative::Request | Performative::Inform, Some(Content::SettleShipment(settlement))) => {
                self.on_settlement(&envelope, settlement)
            }
            (Performative::Request, Some(Content::Refund(refund))) => self.on_refund(&envelope, refund),
            _ => self.not_understood(Some(envelope.sender.as_str())),
        }
    }
}
