//! 购物车仓储（PostgreSQL）
//!
//! 每个用户一行，明细以 JSONB 存储。

use async_trait::async_trait;
use bookstore_shared::Money;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{debug, warn};

use super::traits::CartRepositoryTrait;
use crate::error::Result;
use crate::models::{Cart, CartItem};

#[derive(Debug, sqlx::FromRow)]
struct CartRow {
    user_id: String,
    items: Json<Vec<CartItem>>,
    total_amount: i64,
    currency: String,
    decimal_places: i32,
    updated_at: DateTime<Utc>,
}

impl From<CartRow> for Cart {
    fn from(row: CartRow) -> Self {
        Cart {
            user_id: row.user_id,
            items: row.items.0,
            total: Money::new(row.total_amount, row.currency)
                .with_decimal_places(u32::try_from(row.decimal_places).unwrap_or_default()),
            updated_at: row.updated_at,
        }
    }
}

/// 购物车仓储
pub struct CartRepository {
    pool: PgPool,
}

impl CartRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert<'e, E>(executor: E, cart: &Cart) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO carts (user_id, items, total_amount, currency, decimal_places, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET items = EXCLUDED.items,
                total_amount = EXCLUDED.total_amount,
                currency = EXCLUDED.currency,
                decimal_places = EXCLUDED.decimal_places,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&cart.user_id)
        .bind(Json(&cart.items))
        .bind(cart.total.amount)
        .bind(&cart.total.currency)
        .bind(i32::try_from(cart.total.decimal_places).unwrap_or(i32::MAX))
        .bind(cart.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// 在事务内锁定该用户的购物车行
    async fn lock_cart(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: &str,
    ) -> Result<Option<Cart>> {
        let row = sqlx::query_as::<_, CartRow>(
            r#"
            SELECT user_id, items, total_amount, currency, decimal_places, updated_at
            FROM carts
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(Cart::from))
    }
}

#[async_trait]
impl CartRepositoryTrait for CartRepository {
    async fn get_cart(&self, user_id: &str) -> Result<Option<Cart>> {
        let row = sqlx::query_as::<_, CartRow>(
            r#"
            SELECT user_id, items, total_amount, currency, decimal_places, updated_at
            FROM carts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Cart::from))
    }

    async fn save_cart(&self, cart: &Cart) -> Result<()> {
        Self::upsert(&self.pool, cart).await
    }

    /// 先占位插入空行，再锁行读改写，首次加购的并发请求也会串行
    async fn add_item(
        &self,
        user_id: &str,
        sku: &str,
        qty: i32,
        price: &Money,
        title: &str,
    ) -> Result<(Cart, bool)> {
        let mut tx = self.pool.begin().await?;

        let empty = Cart::empty(user_id);
        sqlx::query(
            r#"
            INSERT INTO carts (user_id, items, total_amount, currency, decimal_places, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&empty.user_id)
        .bind(Json(&empty.items))
        .bind(empty.total.amount)
        .bind(&empty.total.currency)
        .bind(i32::try_from(empty.total.decimal_places).unwrap_or(i32::MAX))
        .bind(empty.updated_at)
        .execute(&mut *tx)
        .await?;

        let mut cart = Self::lock_cart(&mut tx, user_id)
            .await?
            .unwrap_or(empty);
        // 出错时事务随 tx 丢弃回滚，占位行不会留下
        let is_new = cart.add_or_merge(sku, qty, price.clone(), title)?;
        Self::upsert(&mut *tx, &cart).await?;

        tx.commit().await?;
        Ok((cart, is_new))
    }

    async fn remove_item(&self, user_id: &str, sku: &str) -> Result<Option<(Cart, CartItem)>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut cart) = Self::lock_cart(&mut tx, user_id).await? else {
            return Ok(None);
        };
        let Some(removed) = cart.remove_item(sku)? else {
            return Ok(None);
        };
        Self::upsert(&mut *tx, &cart).await?;

        tx.commit().await?;
        Ok(Some((cart, removed)))
    }

    async fn delete_cart(&self, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM carts WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 锁定命中的行后在事务内逐个重算
    async fn update_item_price(&self, sku: &str, price: &Money) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, CartRow>(
            r#"
            SELECT user_id, items, total_amount, currency, decimal_places, updated_at
            FROM carts
            WHERE items @> $1
            FOR UPDATE
            "#,
        )
        .bind(Json(serde_json::json!([{ "sku": sku }])))
        .fetch_all(&mut *tx)
        .await?;

        let mut updated = 0u64;
        for row in rows {
            let mut cart = Cart::from(row);
            match cart.reprice(sku, price) {
                Ok(true) => {
                    Self::upsert(&mut *tx, &cart).await?;
                    updated += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(user_id = %cart.user_id, sku, error = %e, "购物车改价失败，已跳过"),
            }
        }

        tx.commit().await?;
        debug!(sku, updated, "批量改价完成");
        Ok(updated)
    }
}
