//! 购物车业务服务
//!
//! 购物车的唯一写入方。每次写入成功后尽力发布对应事件，发布失败只记录日志，
//! 调用方依然看到写入成功。

use std::sync::Arc;

use bookstore_shared::events::{CartCleared, CartItemAdded, CartItemRemoved, EventPayload};
use bookstore_shared::observability::{metrics, tracing as otel};
use bookstore_shared::publisher::EventPublisher;
use bookstore_shared::{DomainEvent, Money, ServiceError};
use tracing::{info, instrument, warn};

use crate::catalog_client::CatalogLookup;
use crate::error::{CartError, Result};
use crate::models::Cart;
use crate::repository::CartRepositoryTrait;

/// 购物车服务
pub struct CartService {
    repo: Arc<dyn CartRepositoryTrait>,
    catalog: Arc<dyn CatalogLookup>,
    publisher: EventPublisher,
}

impl CartService {
    pub fn new(
        repo: Arc<dyn CartRepositoryTrait>,
        catalog: Arc<dyn CatalogLookup>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            repo,
            catalog,
            publisher,
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// 查询购物车，不存在时返回空购物车（不落库）
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: &str) -> Result<Cart> {
        require("user_id", user_id)?;
        Ok(self
            .repo
            .get_cart(user_id)
            .await?
            .unwrap_or_else(|| Cart::empty(user_id)))
    }

    /// 加入商品，价格与标题以目录为准
    #[instrument(skip(self))]
    pub async fn add_item(&self, user_id: &str, sku: &str, qty: i32) -> Result<Cart> {
        require("user_id", user_id)?;
        require("sku", sku)?;
        if qty <= 0 {
            return Err(ServiceError::invalid_argument("qty", "qty must be positive").into());
        }

        let book = self
            .catalog
            .get_book(sku)
            .await?
            .ok_or_else(|| CartError::BookNotFound(sku.to_string()))?;
        if !book.active {
            return Err(CartError::BookInactive(sku.to_string()));
        }

        let (cart, is_new) = self
            .repo
            .add_item(user_id, sku, qty, &book.price, &book.title)
            .await?;

        metrics::record_cart_operation("add_item", "success");
        info!(user_id, sku, qty, is_new, total = %cart.total, "商品已加入购物车");

        self.publish_best_effort(EventPayload::CartItemAdded(CartItemAdded {
            user_id: user_id.to_string(),
            sku: sku.to_string(),
            qty,
            price: book.price.amount,
            currency: book.price.currency,
            title: book.title,
        }))
        .await;

        Ok(cart)
    }

    /// 移除商品，返回更新后的购物车和是否确实移除
    #[instrument(skip(self))]
    pub async fn remove_item(&self, user_id: &str, sku: &str) -> Result<(Cart, bool)> {
        require("user_id", user_id)?;
        require("sku", sku)?;

        let Some((cart, removed)) = self.repo.remove_item(user_id, sku).await? else {
            return Ok((self.get_cart(user_id).await?, false));
        };

        metrics::record_cart_operation("remove_item", "success");
        info!(user_id, sku, "商品已移出购物车");

        self.publish_best_effort(EventPayload::CartItemRemoved(CartItemRemoved {
            user_id: user_id.to_string(),
            sku: sku.to_string(),
            qty: removed.qty,
        }))
        .await;

        Ok((cart, true))
    }

    /// 清空购物车，返回购物车原先是否存在
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: &str) -> Result<bool> {
        require("user_id", user_id)?;

        let deleted = self.repo.delete_cart(user_id).await?;
        if deleted {
            metrics::record_cart_operation("clear_cart", "success");
            self.publish_best_effort(EventPayload::CartCleared(CartCleared {
                user_id: user_id.to_string(),
                reason: "user_requested".to_string(),
            }))
            .await;
        }

        Ok(deleted)
    }

    /// 发起结算：发布明细快照，购物车保持不变
    ///
    /// 返回购物车和已发布的事件（发布失败时为 None）。
    #[instrument(skip(self))]
    pub async fn checkout(&self, user_id: &str) -> Result<(Cart, Option<DomainEvent>)> {
        let cart = self.get_cart(user_id).await?;
        if cart.is_empty() {
            metrics::record_cart_operation("checkout", "empty");
            return Err(CartError::EmptyCart(user_id.to_string()));
        }

        metrics::record_cart_operation("checkout", "success");
        info!(user_id, items = cart.items.len(), total = %cart.total, "发起结算");

        let event = self
            .publish_best_effort(EventPayload::CheckoutRequested(cart.checkout_payload()))
            .await;

        Ok((cart, event))
    }

    /// 目录价格变更后批量改价，返回受影响的购物车数量
    #[instrument(skip(self))]
    pub async fn update_item_price(&self, sku: &str, price: &Money) -> Result<u64> {
        require("sku", sku)?;
        if price.amount < 0 {
            return Err(ServiceError::invalid_argument("price", "price must not be negative").into());
        }

        let updated = self.repo.update_item_price(sku, price).await?;
        metrics::record_carts_repriced(updated);
        Ok(updated)
    }

    pub async fn publish_best_effort(&self, payload: EventPayload) -> Option<DomainEvent> {
        let correlation_id = otel::current_trace_id();
        let event = self
            .publisher
            .publish_or_log(&payload, correlation_id.as_deref())
            .await;
        if event.is_none() {
            metrics::record_cart_operation(payload.event_type().as_str(), "publish_failed");
            warn!(event_type = %payload.event_type(), "写入已成功，事件未发布");
        }
        event
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::invalid_argument(field, format!("{field} is required")).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_client::{BookInfo, MockCatalogLookup};
    use crate::repository::{InMemoryCartRepository, MockCartRepositoryTrait};
    use bookstore_shared::retry::RetryPolicy;
    use bookstore_shared::test_utils::InMemoryTransport;

    fn book(sku: &str, price: i64, active: bool) -> BookInfo {
        BookInfo {
            sku: sku.to_string(),
            title: format!("Title {sku}"),
            author: "Author".to_string(),
            price: Money::new(price, "USD"),
            category: "tech".to_string(),
            active,
        }
    }

    fn catalog_with(info: BookInfo) -> MockCatalogLookup {
        let mut catalog = MockCatalogLookup::new();
        catalog
            .expect_get_book()
            .returning(move |_| Ok(Some(info.clone())));
        catalog
    }

    fn service(
        catalog: MockCatalogLookup,
        transport: Arc<InMemoryTransport>,
    ) -> (CartService, Arc<InMemoryCartRepository>) {
        let repo = Arc::new(InMemoryCartRepository::new());
        let service = CartService::new(
            repo.clone(),
            Arc::new(catalog),
            EventPublisher::new(transport, RetryPolicy::default()),
        );
        (service, repo)
    }

    #[tokio::test]
    async fn test_add_item_saves_and_publishes() {
        let transport = Arc::new(InMemoryTransport::new());
        let (service, repo) = service(catalog_with(book("BOOK-1", 1999, true)), transport.clone());

        let cart = service.add_item("u1", "BOOK-1", 2).await.unwrap();

        assert_eq!(cart.total.amount, 3998);
        assert_eq!(repo.get_cart("u1").await.unwrap().unwrap(), cart);
        assert_eq!(transport.sent_event_types(), vec!["cart.item_added".to_string()]);
    }

    #[tokio::test]
    async fn test_add_item_validation() {
        let mut catalog = MockCatalogLookup::new();
        catalog.expect_get_book().never();
        let (service, _) = service(catalog, Arc::new(InMemoryTransport::new()));

        for (user, sku, qty) in [("", "BOOK-1", 1), ("u1", "", 1), ("u1", "BOOK-1", 0)] {
            let err = service.add_item(user, sku, qty).await.unwrap_err();
            assert_eq!(tonic::Status::from(err).code(), tonic::Code::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_add_item_catalog_outcomes() {
        let mut catalog = MockCatalogLookup::new();
        catalog.expect_get_book().returning(|sku| match sku {
            "MISSING" => Ok(None),
            "DOWN" => Err(ServiceError::unavailable("catalog", "timeout")),
            other => Ok(Some(book(other, 100, false))),
        });
        let (service, repo) = service(catalog, Arc::new(InMemoryTransport::new()));

        assert!(matches!(
            service.add_item("u1", "MISSING", 1).await,
            Err(CartError::BookNotFound(_))
        ));
        assert!(matches!(
            service.add_item("u1", "INACTIVE", 1).await,
            Err(CartError::BookInactive(_))
        ));
        let err = service.add_item("u1", "DOWN", 1).await.unwrap_err();
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::Unavailable);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_write_succeeds_when_publish_fails() {
        let transport = Arc::new(InMemoryTransport::rejecting("topic missing"));
        let (service, repo) = service(catalog_with(book("BOOK-1", 500, true)), transport);

        let cart = service.add_item("u1", "BOOK-1", 1).await.unwrap();

        assert_eq!(cart.items.len(), 1);
        assert!(repo.get_cart("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_missing_item_publishes_nothing() {
        let transport = Arc::new(InMemoryTransport::new());
        let (service, _) = service(catalog_with(book("BOOK-1", 500, true)), transport.clone());

        let (cart, removed) = service.remove_item("u1", "BOOK-1").await.unwrap();

        assert!(!removed);
        assert!(cart.is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_clear_publishes_only_when_cart_existed() {
        let transport = Arc::new(InMemoryTransport::new());
        let (service, _) = service(catalog_with(book("BOOK-1", 500, true)), transport.clone());

        assert!(!service.clear_cart("u1").await.unwrap());
        service.add_item("u1", "BOOK-1", 1).await.unwrap();
        assert!(service.clear_cart("u1").await.unwrap());

        assert_eq!(
            transport.sent_event_types(),
            vec!["cart.item_added".to_string(), "cart.cleared".to_string()]
        );
    }

    #[tokio::test]
    async fn test_checkout_rejects_empty_cart() {
        let (service, _) = service(
            catalog_with(book("BOOK-1", 500, true)),
            Arc::new(InMemoryTransport::new()),
        );

        let err = service.checkout("u1").await.unwrap_err();
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_checkout_publishes_snapshot() {
        let transport = Arc::new(InMemoryTransport::new());
        let (service, _) = service(catalog_with(book("BOOK-1", 1999, true)), transport.clone());
        service.add_item("u1", "BOOK-1", 2).await.unwrap();

        let (cart, event) = service.checkout("u1").await.unwrap();
        let event = event.unwrap();

        assert_eq!(event.event_type, "cart.checkout_requested");
        assert_eq!(event.payload["total_amount"], 3998);
        assert_eq!(cart.items.len(), 1);
    }

    #[tokio::test]
    async fn test_add_item_writes_through_single_repository_call() {
        let mut repo = MockCartRepositoryTrait::new();
        repo.expect_get_cart().never();
        repo.expect_save_cart().never();
        repo.expect_add_item()
            .withf(|user_id, sku, qty, price, title| {
                user_id == "u1" && sku == "BOOK-1" && *qty == 2 && price.amount == 1999
                    && title == "Title BOOK-1"
            })
            .times(1)
            .returning(|user_id, sku, qty, price, title| {
                let mut cart = Cart::empty(user_id);
                let is_new = cart.add_or_merge(sku, qty, price.clone(), title)?;
                Ok((cart, is_new))
            });
        let service = CartService::new(
            Arc::new(repo),
            Arc::new(catalog_with(book("BOOK-1", 1999, true))),
            EventPublisher::new(Arc::new(InMemoryTransport::new()), RetryPolicy::default()),
        );

        let cart = service.add_item("u1", "BOOK-1", 2).await.unwrap();
        assert_eq!(cart.total.amount, 3998);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_add_item_racing_price_sync_keeps_new_price() {
        let transport = Arc::new(InMemoryTransport::new());
        let (service, repo) = service(catalog_with(book("BOOK-2", 500, true)), transport);
        let service = Arc::new(service);
        repo.add_item("u1", "BOOK-1", 2, &Money::new(1999, "USD"), "Rust")
            .await
            .unwrap();

        let adds: Vec<_> = (0..32)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.add_item("u1", "BOOK-2", 1).await })
            })
            .collect();
        let repriced = service
            .update_item_price("BOOK-1", &Money::new(2499, "USD"))
            .await
            .unwrap();
        for handle in adds {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(repriced, 1);
        let cart = repo.get_cart("u1").await.unwrap().unwrap();
        assert_eq!(cart.get_item("BOOK-1").unwrap().price.amount, 2499);
        assert_eq!(cart.get_item("BOOK-2").unwrap().qty, 32);
        assert_eq!(cart.total.amount, 2 * 2499 + 32 * 500);
    }

    #[tokio::test]
    async fn test_repository_failure_propagates() {
        let mut repo = MockCartRepositoryTrait::new();
        repo.expect_get_cart()
            .returning(|_| Err(ServiceError::Database(sqlx::Error::PoolTimedOut).into()));
        let service = CartService::new(
            Arc::new(repo),
            Arc::new(MockCatalogLookup::new()),
            EventPublisher::new(Arc::new(InMemoryTransport::new()), RetryPolicy::default()),
        );

        let err = service.get_cart("u1").await.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
