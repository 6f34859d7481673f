use crate::{error::Result, model::Product, ProductId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::str::FromStr;

/// Attribute filters for a catalog search. Text filters match exactly and
/// price bounds are inclusive. At least one of the origin flags must be set
/// for anything to match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProductFilter {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub product_type: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Store's own stock.
    pub include_internal: bool,
    /// Products listed by external sellers.
    pub include_external: bool,
}

impl ProductFilter {
    /// Matches every product of either origin.
    pub fn all() -> Self {
        Self {
            include_internal: true,
            include_external: true,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Lists a product. Returns `false` if a product with the same id exists.
    async fn add(&self, product: &Product) -> Result<bool>;

    async fn get(&self, id: ProductId) -> Result<Option<Product>>;

    /// Matching products ordered by name, case-insensitively.
    async fn search(&self, filter: &ProductFilter) -> Result<Vec<Product>>;
}

pub struct SqliteCatalog {
    pool: SqlitePool,
}

const PRODUCT_COLUMNS: &str = "id, name, brand, product_type, price, weight, seller";

impl SqliteCatalog {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(SqliteConnectOptions::from_str(database_url)?.create_if_missing(true))
            .await?;
        Self::with_pool(pool).await
    }

    /// Shares an existing pool, e.g. the order ledger's.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:", 1).await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                brand TEXT NOT NULL,
                product_type TEXT NOT NULL,
                price REAL NOT NULL,
                weight REAL NOT NULL,
                seller TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn product_from_row(row: &SqliteRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::parse_str(&row.get::<String, _>(0))?,
            name: row.get(1),
            brand: row.get(2),
            product_type: row.get(3),
            price: row.get(4),
            weight: row.get(5),
            seller: row.get(6),
        })
    }
}

#[async_trait]
impl ProductCatalog for SqliteCatalog {
    async fn add(&self, product: &Product) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO products (id, name, brand, product_type, price, weight, seller)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(product.id.to_string())
        .bind(&product.name)
        .bind(&product.brand)
        .bind(&product.product_type)
        .bind(product.price)
        .bind(product.weight)
        .bind(&product.seller)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn get(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(&format!("SELECT {} FROM products WHERE id = ?", PRODUCT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::product_from_row).transpose()
    }

    async fn search(&self, filter: &ProductFilter) -> Result<Vec<Product>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM products WHERE ", PRODUCT_COLUMNS));
        match (filter.include_internal, filter.include_external) {
            (true, true) => query.push("1 = 1"),
            (true, false) => query.push("seller IS NULL"),
            (false, true) => query.push("seller IS NOT NULL"),
            (false, false) => return Ok(vec![]),
        };

        if let Some(name) = &filter.name {
            query.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(brand) = &filter.brand {
            query.push(" AND brand = ").push_bind(brand.clone());
        }
        if let Some(product_type) = &filter.product_type {
            query.push(" AND product_type = ").push_bind(product_type.clone());
        }
        if let Some(min_price) = filter.min_price {
            query.push(" AND price >= ").push_bind(min_price);
        }
        if let Some(max_price) = filter.max_price {
            query.push(" AND price <= ").push_bind(max_price);
        }
        query.push(" ORDER BY UPPER(name), id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::product_from_row).collect()
    }
}
