//! HTTP 健康检查
//!
//! `/health` 为存活检查，进程正常即返回 ok；`/ready` 逐个执行注册的依赖检查，
//! 全部通过返回 200，否则返回 503 并附带每个依赖检查的结果。gRPC Health 接口复用同一组依赖检查。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::database::Database;
use crate::error::{Result, ServiceError};
use crate::idempotency::IdempotencyLedger;
use crate::publisher::EventPublisher;

/// 单项依赖检查的超时
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// 依赖检查
#[async_trait]
pub trait DependencyCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<()>;
}

/// 健康检查结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: String,
    pub checks: BTreeMap<String, String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

/// 依赖检查注册表
#[derive(Clone, Default)]
pub struct HealthRegistry {
    service: String,
    checks: Vec<Arc<dyn DependencyCheck>>,
}

impl HealthRegistry {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            checks: Vec::new(),
        }
    }

    pub fn register(mut self, check: Arc<dyn DependencyCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// 执行全部依赖检查
    pub async fn check(&self) -> HealthReport {
        let results = futures::future::join_all(self.checks.iter().map(|check| async move {
            let outcome = match tokio::time::timeout(CHECK_TIMEOUT, check.check()).await {
                Ok(Ok(())) => "ok".to_string(),
                Ok(Err(e)) => format!("fail: {e}"),
                Err(_) => "fail: timeout".to_string(),
            };
            (check.name().to_string(), outcome)
        }))
        .await;

        let healthy = results.iter().all(|(_, outcome)| outcome == "ok");

        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            service: self.service.clone(),
            checks: results.into_iter().collect(),
        }
    }
}

/// 健康检查路由
pub fn router(registry: HealthRegistry) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::SERVICE_UNAVAILABLE,
            CHECK_TIMEOUT * 2,
        ))
        .with_state(registry)
}

async fn liveness(State(registry): State<HealthRegistry>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": registry.service,
    }))
}

async fn readiness(State(registry): State<HealthRegistry>) -> (StatusCode, Json<HealthReport>) {
    let report = registry.check().await;
    (readiness_status(&report), Json(report))
}

fn readiness_status(report: &HealthReport) -> StatusCode {
    if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// 启动健康检查 HTTP 服务，收到关闭信号后退出
pub async fn serve(
    addr: &str,
    registry: HealthRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .inspect_err(|e| error!("Health server error: {}", e))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// 常用依赖检查
// ---------------------------------------------------------------------------

/// broker 连通性
pub struct PublisherCheck(pub EventPublisher);

#[async_trait]
impl DependencyCheck for PublisherCheck {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<()> {
        if self.0.health_check().await {
            Ok(())
        } else {
            Err(ServiceError::unavailable("broker", "metadata request failed"))
        }
    }
}

/// 幂等账本存储
pub struct LedgerCheck(pub Arc<dyn IdempotencyLedger>);

#[async_trait]
impl DependencyCheck for LedgerCheck {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check(&self) -> Result<()> {
        self.0.health_check().await
    }
}

pub struct DatabaseCheck(pub Database);

#[async_trait]
impl DependencyCheck for DatabaseCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<()> {
        self.0.health_check().await
    }
}
