//! 购物车服务订阅的事件处理器

use std::sync::Arc;

use async_trait::async_trait;
use bookstore_shared::consumer::EventHandler;
use bookstore_shared::events::EventPayload;
use bookstore_shared::money::DEFAULT_CURRENCY;
use bookstore_shared::{DomainEvent, Money, Result, ServiceError};
use tracing::{debug, info, warn};

use crate::service::CartService;

/// 目录价格同步
///
/// 只处理 `fields_changed` 含 price 或 currency 的事件，把所有包含该 sku 的购物车
/// 改为新单价并重算总价，数量不变。没有购物车命中也算成功。
pub struct PriceSyncHandler {
    service: Arc<CartService>,
}

impl PriceSyncHandler {
    pub fn new(service: Arc<CartService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for PriceSyncHandler {
    async fn handle(&self, event: &DomainEvent, payload: &EventPayload) -> Result<()> {
        let EventPayload::CatalogUpdated(update) = payload else {
            return Err(ServiceError::PoisonMessage(format!(
                "价格同步收到非目录事件: {}",
                event.event_type
            )));
        };

        if !update.touches_pricing() {
            debug!(sku = %update.sku, fields = ?update.fields_changed, "非价格变更，跳过");
            return Ok(());
        }

        let Some(amount) = update.price else {
            warn!(sku = %update.sku, "价格变更事件缺少 price，跳过");
            return Ok(());
        };

        let currency = update.currency.as_deref().unwrap_or(DEFAULT_CURRENCY);
        let price = Money::new(amount, currency);

        let updated = self.service.update_item_price(&update.sku, &price).await?;

        info!(
            event_id = %event.event_id,
            sku = %update.sku,
            price = %price,
            carts_updated = updated,
            "购物车价格已同步"
        );
        Ok(())
    }
}

/// 库存变更只记录，不影响购物车
#[derive(Default)]
pub struct InventoryHandler;

#[async_trait]
impl EventHandler for InventoryHandler {
    async fn handle(&self, event: &DomainEvent, payload: &EventPayload) -> Result<()> {
        if let EventPayload::InventoryUpdated(update) = payload {
            info!(
                event_id = %event.event_id,
                item_id = %update.item_id,
                delta = update.delta,
                new_quantity = update.new_quantity,
                reason = %update.reason,
                "库存已变更"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_client::MockCatalogLookup;
    use crate::models::Cart;
    use crate::repository::{CartRepositoryTrait, InMemoryCartRepository};
    use bookstore_shared::publisher::EventPublisher;
    use bookstore_shared::retry::RetryPolicy;
    use bookstore_shared::test_utils::{InMemoryTransport, TestEvents};

    async fn setup() -> (PriceSyncHandler, Arc<InMemoryCartRepository>) {
        let repo = Arc::new(InMemoryCartRepository::new());
        let mut cart = Cart::empty("u1");
        cart.add_or_merge("BOOK-1", 2, Money::new(1999, "USD"), "Rust")
            .unwrap();
        repo.save_cart(&cart).await.unwrap();

        let service = CartService::new(
            repo.clone(),
            Arc::new(MockCatalogLookup::new()),
            EventPublisher::new(Arc::new(InMemoryTransport::new()), RetryPolicy::default()),
        );
        (PriceSyncHandler::new(Arc::new(service)), repo)
    }

    #[tokio::test]
    async fn test_title_only_change_is_ignored() {
        let (handler, repo) = setup().await;
        let event = TestEvents::catalog_title_changed("BOOK-1", "New title");
        let payload = event.typed_payload().unwrap().unwrap();

        handler.handle(&event, &payload).await.unwrap();

        let cart = repo.get_cart("u1").await.unwrap().unwrap();
        assert_eq!(cart.items[0].price.amount, 1999);
    }

    #[tokio::test]
    async fn test_unmatched_sku_still_succeeds() {
        let (handler, _) = setup().await;
        let event = TestEvents::catalog_price_changed("BOOK-404", 100);
        let payload = event.typed_payload().unwrap().unwrap();

        assert!(handler.handle(&event, &payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_payload_is_poison() {
        let (handler, _) = setup().await;
        let event = TestEvents::inventory_changed("BOOK-1", 5, 4);
        let payload = event.typed_payload().unwrap().unwrap();

        assert!(matches!(
            handler.handle(&event, &payload).await,
            Err(ServiceError::PoisonMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_inventory_handler_acknowledges() {
        let event = TestEvents::inventory_changed("BOOK-1", 5, 4);
        let payload = event.typed_payload().unwrap().unwrap();
        assert!(InventoryHandler.handle(&event, &payload).await.is_ok());
    }
}
