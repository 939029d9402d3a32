//! 目录服务 gRPC 客户端
//!
//! 只读查询商品信息。超时或连接失败统一视为依赖不可用，不在此处重试。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bookstore_proto::catalog::GetBookRequest;
use bookstore_proto::catalog::catalog_service_client::CatalogServiceClient;
use bookstore_shared::money::decimal_places_from_wire;
use bookstore_shared::observability::metrics;
use bookstore_shared::{Money, ServiceError};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

const SERVICE: &str = "catalog";

/// 商品信息
#[derive(Debug, Clone, PartialEq)]
pub struct BookInfo {
    pub sku: String,
    pub title: String,
    pub author: String,
    pub price: Money,
    pub category: String,
    pub active: bool,
}

/// 目录查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// 商品不存在返回 `Ok(None)`
    async fn get_book(&self, sku: &str) -> Result<Option<BookInfo>, ServiceError>;
}

/// 目录服务客户端
///
/// 懒连接，首次调用时才建立连接，服务可以先于目录服务启动。
#[derive(Clone)]
pub struct CatalogClient {
    client: CatalogServiceClient<Channel>,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let channel = Endpoint::from_shared(url.to_string())
            .map_err(|e| ServiceError::invalid_argument("catalog_url", e.to_string()))?
            .connect_timeout(timeout)
            .connect_lazy();

        info!(url, "目录服务客户端已初始化（懒连接）");

        Ok(Self {
            client: CatalogServiceClient::new(channel),
            timeout,
        })
    }
}

#[async_trait]
impl CatalogLookup for CatalogClient {
    async fn get_book(&self, sku: &str) -> Result<Option<BookInfo>, ServiceError> {
        let start = Instant::now();
        let mut client = self.client.clone();
        let request = GetBookRequest {
            sku: sku.to_string(),
        };

        let result = tokio::time::timeout(self.timeout, client.get_book(request)).await;
        let elapsed = start.elapsed().as_secs_f64();

        let response = match result {
            Err(_) => {
                metrics::record_dependency_call(SERVICE, "timeout", elapsed);
                warn!(sku, timeout_ms = self.timeout.as_millis() as u64, "目录服务调用超时");
                return Err(ServiceError::unavailable(
                    SERVICE,
                    format!("GetBook 超时 ({}ms)", self.timeout.as_millis()),
                ));
            }
            Ok(Err(status)) if status.code() == Code::NotFound => {
                metrics::record_dependency_call(SERVICE, "not_found", elapsed);
                debug!(sku, "目录中不存在该商品");
                return Ok(None);
            }
            Ok(Err(status)) => {
                metrics::record_dependency_call(SERVICE, "error", elapsed);
                warn!(sku, code = ?status.code(), message = status.message(), "目录服务调用失败");
                return Err(ServiceError::unavailable(SERVICE, status.message()));
            }
            Ok(Ok(response)) => response.into_inner(),
        };

        metrics::record_dependency_call(SERVICE, "ok", elapsed);

        Ok(response.book.map(|book| {
            let price = book.price.unwrap_or_default();
            BookInfo {
                sku: book.sku,
                title: book.title,
                author: book.author,
                price: Money::new(price.amount, price.currency)
                    .with_decimal_places(decimal_places_from_wire(price.decimal_places)),
                category: book.category,
                active: book.active,
            }
        }))
    }
}
