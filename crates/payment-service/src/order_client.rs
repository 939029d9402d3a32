//! 订单服务 gRPC 客户端
//!
//! 扣款成功后通知订单服务确认订单。调用失败不影响支付结果。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bookstore_proto::order::UpdateOrderStatusRequest;
use bookstore_proto::order::order_service_client::OrderServiceClient;
use bookstore_shared::ServiceError;
use bookstore_shared::observability::metrics;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

const SERVICE: &str = "order";

pub const ORDER_CONFIRMED: &str = "CONFIRMED";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn update_order_status(&self, order_id: &str, status: &str) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct OrderClient {
    client: OrderServiceClient<Channel>,
    timeout: Duration,
}

impl OrderClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let channel = Endpoint::from_shared(url.to_string())
            .map_err(|e| ServiceError::invalid_argument("order_url", e.to_string()))?
            .connect_timeout(timeout)
            .connect_lazy();

        info!(url, "订单服务客户端已初始化（懒连接）");

        Ok(Self {
            client: OrderServiceClient::new(channel),
            timeout,
        })
    }
}

#[async_trait]
impl OrderNotifier for OrderClient {
    async fn update_order_status(&self, order_id: &str, status: &str) -> Result<(), ServiceError> {
        let start = Instant::now();
        let mut client = self.client.clone();
        let request = UpdateOrderStatusRequest {
            order_id: order_id.to_string(),
            status: status.to_string(),
        };

        let result = tokio::time::timeout(self.timeout, client.update_order_status(request)).await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Err(_) => {
                metrics::record_dependency_call(SERVICE, "timeout", elapsed);
                Err(ServiceError::DependencyTimeout {
                    service: SERVICE.to_string(),
                })
            }
            Ok(Err(status)) => {
                metrics::record_dependency_call(SERVICE, "error", elapsed);
                Err(ServiceError::unavailable(SERVICE, status.message()))
            }
            Ok(Ok(response)) => {
                let response = response.into_inner();
                if !response.success {
                    metrics::record_dependency_call(SERVICE, "rejected", elapsed);
                    warn!(order_id, message = %response.message, "订单服务拒绝状态更新");
                    return Err(ServiceError::FailedPrecondition(response.message));
                }
                metrics::record_dependency_call(SERVICE, "ok", elapsed);
                info!(order_id, status, "订单状态已更新");
                Ok(())
            }
        }
    }
}

/// 未配置订单服务时使用
#[derive(Default)]
pub struct NoopOrderNotifier;

#[async_trait]
impl OrderNotifier for NoopOrderNotifier {
    async fn update_order_status(&self, order_id: &str, status: &str) -> Result<(), ServiceError> {
        info!(order_id, status, "未配置订单服务，跳过状态更新");
        Ok(())
    }
}
