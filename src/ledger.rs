use crate::{
    error::Result,
    model::{Order, OrderStatus, PriorityClass, ReturnReason},
    OrderId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::str::FromStr;

/// Persistent record of placed orders.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Stores a new order. Recording the same id again is a no-op.
    async fn record(&self, order: &Order) -> Result<()>;

    async fn get(&self, id: OrderId) -> Result<Option<Order>>;

    async fn status(&self, id: OrderId) -> Result<Option<OrderStatus>>;

    async fn attach_delivery_deadline(&self, id: OrderId, deadline: DateTime<Utc>) -> Result<()>;

    /// Returns how many orders changed status.
    async fn mark_ready_to_charge(&self, ids: &[OrderId]) -> Result<u64>;

    async fn ready_to_charge(&self) -> Result<Vec<Order>>;

    /// Records a return of `item` from the order. Returns `false` if that
    /// item was already returned.
    async fn claim_return(&self, id: OrderId, item: &str, reason: ReturnReason) -> Result<bool>;

    /// Drops a claimed return whose refund did not go through.
    async fn release_return(&self, id: OrderId, item: &str) -> Result<()>;
}

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(SqliteConnectOptions::from_str(database_url)?.create_if_missing(true))
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                destination_city TEXT NOT NULL,
                priority TEXT NOT NULL,
                total_weight REAL NOT NULL,
                total_price REAL NOT NULL,
                payment_ref TEXT NOT NULL,
                line_items TEXT NOT NULL,
                status TEXT NOT NULL,
                placed_at DATETIME NOT NULL,
                delivery_deadline DATETIME
            );

            CREATE TABLE IF NOT EXISTS returns (
                order_id TEXT NOT NULL,
                item_name TEXT NOT NULL,
                reason TEXT NOT NULL,
                requested_at DATETIME NOT NULL,
                PRIMARY KEY (order_id, item_name)
            );

            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn order_from_row(row: &SqliteRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::parse_str(&row.get::<String, _>(0))?,
            destination_city: row.get(1),
            priority: PriorityClass::parse(&row.get::<String, _>(2))?,
            total_weight: row.get(3),
            total_price: row.get(4),
            payment_ref: row.get(5),
            line_items: serde_json::from_str(&row.get::<String, _>(6))?,
            placed_at: row.get(7),
            delivery_deadline: row.get(8),
        })
    }
}

const ORDER_COLUMNS: &str = "id, destination_city, priority, total_weight, total_price, payment_ref, line_items, placed_at, delivery_deadline";

#[async_trait]
impl OrderLedger for SqliteLedger {
    async fn record(&self, order: &Order) -> Result<()> {
        let line_items = serde_json::to_string(&order.line_items)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO orders (id, destination_city, priority, total_weight, total_price, payment_ref, line_items, status, placed_at, delivery_deadline)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(&order.destination_city)
        .bind(order.priority.as_str())
        .bind(order.total_weight)
        .bind(order.total_price)
        .bind(&order.payment_ref)
        .bind(line_items)
        .bind(OrderStatus::Placed.as_str())
        .bind(order.placed_at)
        .bind(order.delivery_deadline)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn status(&self, id: OrderId) -> Result<Option<OrderStatus>> {
        let row = sqlx::query("SELECT status FROM orders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| OrderStatus::parse(&row.get::<String, _>(0))).transpose()
    }

    async fn attach_delivery_deadline(&self, id: OrderId, deadline: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE orders SET delivery_deadline = ? WHERE id = ?")
            .bind(deadline)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_ready_to_charge(&self, ids: &[OrderId]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for id in ids {
            changed += sqlx::query("UPDATE orders SET status = ? WHERE id = ? AND status = ?")
                .bind(OrderStatus::ReadyToCharge.as_str())
                .bind(id.to_string())
                .bind(OrderStatus::Placed.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(changed)
    }

    async fn ready_to_charge(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE status = ? ORDER BY placed_at",
            ORDER_COLUMNS
        ))
        .bind(OrderStatus::ReadyToCharge.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::order_from_row).collect()
    }

    async fn claim_return(&self, id: OrderId, item: &str, reason: ReturnReason) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO returns (order_id, item_name, reason, requested_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(item)
        .bind(reason.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn release_return(&self, id: OrderId, item: &str) -> Result<()> {
        sqlx::query("DELETE FROM returns WHERE order_id = ? AND item_name = ?")
            .bind(id.to_string())
            .bind(item)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
