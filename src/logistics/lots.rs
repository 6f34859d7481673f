use crate::{
    error::Result,
    model::{LotKey, Order, ShipmentLot},
    OrderId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// What happened to an order handed to [`LotStore::add_order`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Appended; `size` is the lot size after the append.
    Added { key: LotKey, size: usize },
    /// The order already sits in an open lot or in one out for dispatch.
    AlreadyQueued(LotKey),
}

#[derive(Default)]
struct Lots {
    open: BTreeMap<LotKey, ShipmentLot>,
    /// Members of lots taken out for dispatch and not yet restored or released.
    dispatching: HashSet<OrderId>,
}

impl Lots {
    fn holds(&self, key: &LotKey, id: OrderId) -> bool {
        self.dispatching.contains(&id)
            || self
                .open
                .get(key)
                .is_some_and(|lot| lot.member_orders.iter().any(|order| order.id == id))
    }
}

/// Open lots keyed by destination and priority. A lot leaves the store while
/// it is being dispatched, so two dispatches can never race on it.
#[derive(Default)]
pub struct LotStore {
    lots: Mutex<Lots>,
}

impl LotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `order` to the lot for its key, opening one if needed. An
    /// order that is already queued is left where it is.
    pub fn add_order(&self, order: Order) -> Result<Admission> {
        let key = order.lot_key();
        let mut lots = self.lots.lock();
        if lots.holds(&key, order.id) {
            return Ok(Admission::AlreadyQueued(key));
        }
        let lot = lots
            .open
            .entry(key.clone())
            .or_insert_with(|| ShipmentLot::new(key.clone()));
        lot.push(order)?;
        let size = lot.member_orders.len();
        Ok(Admission::Added { key, size })
    }

    /// Takes the lot out for dispatch. Its orders stay known to the store
    /// until the lot is restored or released.
    pub fn take(&self, key: &LotKey) -> Option<ShipmentLot> {
        let mut lots = self.lots.lock();
        let lot = lots.open.remove(key)?;
        lots.dispatching.extend(lot.order_ids());
        Some(lot)
    }

    /// Puts a held-over lot back. Orders that arrived for the same key while
    /// it was out are appended after the original members.
    pub fn restore(&self, mut lot: ShipmentLot) {
        let mut lots = self.lots.lock();
        for id in lot.order_ids() {
            lots.dispatching.remove(&id);
        }
        if let Some(newer) = lots.open.remove(&lot.key) {
            lot.member_orders.extend(newer.member_orders);
        }
        lots.open.insert(lot.key.clone(), lot);
    }

    /// Forgets the orders of a lot that finished dispatching.
    pub fn release(&self, lot: &ShipmentLot) {
        let mut lots = self.lots.lock();
        for order in &lot.member_orders {
            lots.dispatching.remove(&order.id);
        }
    }

    pub fn keys(&self) -> Vec<LotKey> {
        self.lots.lock().open.keys().cloned().collect()
    }

    pub fn get(&self, key: &LotKey) -> Option<ShipmentLot> {
        self.lots.lock().open.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lots.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.lock().open.is_empty()
    }
}
