//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("grpc_requests_total", "Total number of gRPC requests");
    metrics::describe_histogram!(
        "grpc_request_duration_seconds",
        "gRPC request duration in seconds"
    );

    metrics::describe_counter!(
        "events_published_total",
        "Domain events published, by event type and status"
    );
    metrics::describe_histogram!(
        "event_publish_duration_seconds",
        "Time spent publishing an event including retries"
    );

    metrics::describe_counter!(
        "events_consumed_total",
        "Domain events consumed, by event type and outcome"
    );
    metrics::describe_histogram!(
        "event_handle_duration_seconds",
        "Time spent handling a consumed event"
    );
    metrics::describe_counter!(
        "consumer_reconnects_total",
        "Consumer reconnect-and-resubscribe cycles"
    );
    metrics::describe_counter!("dead_letters_total", "Messages routed to the dead-letter topic");

    metrics::describe_counter!("cart_operations_total", "Cart facade operations");
    metrics::describe_counter!(
        "carts_repriced_total",
        "Carts updated by catalog price changes"
    );

    metrics::describe_counter!("payment_operations_total", "Payment state machine operations");
    metrics::describe_histogram!(
        "payment_operation_duration_seconds",
        "Payment operation duration in seconds"
    );

    metrics::describe_counter!(
        "dependency_calls_total",
        "Calls to collaborator services (catalog, order)"
    );
    metrics::describe_histogram!(
        "dependency_call_duration_seconds",
        "Collaborator call duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new().route("/metrics", get(move || std::future::ready(handle.render())));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录 gRPC 请求
#[inline]
pub fn record_grpc_request(service: &str, method: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "grpc_requests_total",
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "grpc_request_duration_seconds",
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// 记录事件发布结果，status 为 success / failure / rejected
#[inline]
pub fn record_event_published(event_type: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "events_published_total",
        "event_type" => event_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "event_publish_duration_seconds",
        "event_type" => event_type.to_string()
    )
    .record(duration_secs);
}

/// 记录事件消费结果
#[inline]
pub fn record_event_consumed(event_type: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "events_consumed_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "event_handle_duration_seconds",
        "event_type" => event_type.to_string()
    )
    .record(duration_secs);
}

#[inline]
pub fn record_consumer_reconnect(consumer: &str) {
    metrics::counter!("consumer_reconnects_total", "consumer" => consumer.to_string()).increment(1);
}

#[inline]
pub fn record_dead_letter(source_topic: &str) {
    metrics::counter!("dead_letters_total", "source_topic" => source_topic.to_string())
        .increment(1);
}

/// 记录购物车操作
#[inline]
pub fn record_cart_operation(operation: &str, status: &str) {
    metrics::counter!(
        "cart_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录价格同步影响的购物车数量
#[inline]
pub fn record_carts_repriced(count: u64) {
    metrics::counter!("carts_repriced_total").increment(count);
}

/// 记录支付操作（authorize / capture）
#[inline]
pub fn record_payment_operation(operation: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "payment_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "payment_operation_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// 记录下游服务调用
#[inline]
pub fn record_dependency_call(service: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "dependency_calls_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "dependency_call_duration_seconds",
        "service" => service.to_string()
    )
    .record(duration_secs);
}
