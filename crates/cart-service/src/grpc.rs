//! gRPC 服务端实现
//!
//! 只做 Proto 与领域类型的转换和错误映射，业务规则都在 `CartService` 中。

use std::sync::Arc;
use std::time::Instant;

use bookstore_proto::cart::cart_service_server::CartService as CartGrpc;
use bookstore_proto::cart::{
    AddItemRequest, AddItemResponse, Cart as ProtoCart, CartItem as ProtoCartItem,
    CheckoutRequest, CheckoutResponse, ClearCartRequest, ClearCartResponse, GetCartRequest,
    GetCartResponse, RemoveItemRequest, RemoveItemResponse,
};
use bookstore_proto::common::{Empty, HealthStatus, Money as ProtoMoney};
use bookstore_shared::Money;
use bookstore_shared::health::HealthRegistry;
use bookstore_shared::observability::metrics;
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::error::Result;
use crate::models::Cart;
use crate::service::CartService;

const SERVICE: &str = "CartService";

// ==================== 类型转换辅助函数 ====================

pub fn money_to_proto(money: &Money) -> ProtoMoney {
    ProtoMoney {
        amount: money.amount,
        currency: money.currency.clone(),
        decimal_places: Some(i32::try_from(money.decimal_places).unwrap_or(i32::MAX)),
    }
}

fn datetime_to_timestamp(dt: chrono::DateTime<chrono::Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

pub fn cart_to_proto(cart: &Cart) -> ProtoCart {
    ProtoCart {
        user_id: cart.user_id.clone(),
        items: cart
            .items
            .iter()
            .map(|item| ProtoCartItem {
                sku: item.sku.clone(),
                qty: item.qty,
                price: Some(money_to_proto(&item.price)),
                title: item.title.clone(),
            })
            .collect(),
        total: Some(money_to_proto(&cart.total)),
        updated_at: Some(datetime_to_timestamp(cart.updated_at)),
    }
}

/// 记录调用指标并把领域错误转换为 Status
fn finish<T>(method: &str, start: Instant, result: Result<T>) -> std::result::Result<T, Status> {
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::record_grpc_request(SERVICE, method, status, start.elapsed().as_secs_f64());
    result.map_err(Status::from)
}

// ==================== gRPC 服务实现 ====================

pub struct CartServiceImpl {
    service: Arc<CartService>,
    health: HealthRegistry,
}

impl CartServiceImpl {
    pub fn new(service: Arc<CartService>, health: HealthRegistry) -> Self {
        Self { service, health }
    }
}

#[tonic::async_trait]
impl CartGrpc for CartServiceImpl {
    #[instrument(skip(self, request), fields(user_id = %request.get_ref().user_id, sku = %request.get_ref().sku))]
    async fn add_item(
        &self,
        request: Request<AddItemRequest>,
    ) -> std::result::Result<Response<AddItemResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let cart = finish(
            "AddItem",
            start,
            self.service.add_item(&req.user_id, &req.sku, req.qty).await,
        )?;

        Ok(Response::new(AddItemResponse {
            cart: Some(cart_to_proto(&cart)),
        }))
    }

    #[instrument(skip(self, request), fields(user_id = %request.get_ref().user_id, sku = %request.get_ref().sku))]
    async fn remove_item(
        &self,
        request: Request<RemoveItemRequest>,
    ) -> std::result::Result<Response<RemoveItemResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let (cart, removed) = finish(
            "RemoveItem",
            start,
            self.service.remove_item(&req.user_id, &req.sku).await,
        )?;

        Ok(Response::new(RemoveItemResponse {
            cart: Some(cart_to_proto(&cart)),
            removed,
        }))
    }

    #[instrument(skip(self, request), fields(user_id = %request.get_ref().user_id))]
    async fn get_cart(
        &self,
        request: Request<GetCartRequest>,
    ) -> std::result::Result<Response<GetCartResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let cart = finish("GetCart", start, self.service.get_cart(&req.user_id).await)?;

        Ok(Response::new(GetCartResponse {
            cart: Some(cart_to_proto(&cart)),
        }))
    }

    #[instrument(skip(self, request), fields(user_id = %request.get_ref().user_id))]
    async fn clear_cart(
        &self,
        request: Request<ClearCartRequest>,
    ) -> std::result::Result<Response<ClearCartResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let cleared = finish(
            "ClearCart",
            start,
            self.service.clear_cart(&req.user_id).await,
        )?;

        Ok(Response::new(ClearCartResponse { cleared }))
    }

    #[instrument(skip(self, request), fields(user_id = %request.get_ref().user_id))]
    async fn checkout(
        &self,
        request: Request<CheckoutRequest>,
    ) -> std::result::Result<Response<CheckoutResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let (cart, event) = finish("Checkout", start, self.service.checkout(&req.user_id).await)?;

        Ok(Response::new(CheckoutResponse {
            cart: Some(cart_to_proto(&cart)),
            event_id: event.map(|e| e.event_id.to_string()).unwrap_or_default(),
        }))
    }

    async fn health(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<HealthStatus>, Status> {
        let report = self.health.check().await;

        Ok(Response::new(HealthStatus {
            healthy: report.is_healthy(),
            status: report.status.to_string(),
            details: report.checks.into_iter().collect(),
        }))
    }
}
