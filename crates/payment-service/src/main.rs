//! 支付服务
//!
//! 授权 / 扣款 gRPC 服务入口。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bookstore_proto::payment::payment_service_server::PaymentServiceServer;
use bookstore_shared::{
    config::{AppConfig, ServiceDefaults},
    health::{self, HealthRegistry, PublisherCheck},
    kafka::{KafkaTransport, event_topics},
    observability,
    publisher::{EventPublisher, EventTransport},
};
use tokio::signal;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{error, info};

use payment_service::{
    InMemoryPaymentStore, MockProcessor, NoopOrderNotifier, OrderClient, OrderNotifier,
    PaymentEvents, PaymentService, PaymentServiceImpl,
};

const SERVICE_NAME: &str = "payment-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME, ServiceDefaults::PAYMENT).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    // 2. 可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(SERVICE_NAME);
    let _guard = observability::init(&obs_config).await?;

    info!("Starting {}...", SERVICE_NAME);
    info!(
        environment = %config.environment,
        max_amount = config.payment.max_amount,
        "Configuration loaded"
    );

    let grpc_addr: SocketAddr = config
        .server_addr()
        .parse()
        .context("Invalid gRPC address")?;

    // 3. 事件发布
    let transport: Arc<dyn EventTransport> = Arc::new(
        KafkaTransport::connect(
            &config.kafka,
            &config.publisher,
            event_topics(&config.consumer.dead_letter_topic),
        )
        .await?,
    );
    let publisher = EventPublisher::new(transport, config.publisher.retry_policy());

    // 4. 协作服务
    let orders: Arc<dyn OrderNotifier> = if config.collaborators.order_url.is_empty() {
        Arc::new(NoopOrderNotifier)
    } else {
        Arc::new(OrderClient::new(
            &config.collaborators.order_url,
            config.collaborators.rpc_timeout(),
        )?)
    };

    // 5. 状态机
    let payment_service = Arc::new(PaymentService::new(
        Arc::new(InMemoryPaymentStore::new()),
        Arc::new(MockProcessor::new(&config.payment)),
        PaymentEvents::new(publisher.clone()),
        orders,
    ));
    info!("Services initialized");

    // 6. 健康检查端点
    let health_registry =
        HealthRegistry::new(SERVICE_NAME).register(Arc::new(PublisherCheck(publisher)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_addr = config.health_addr();
    let health_handle = tokio::spawn({
        let registry = health_registry.clone();
        async move {
            if let Err(e) = health::serve(&health_addr, registry, shutdown_rx).await {
                error!("Health server exited: {}", e);
            }
        }
    });

    // 7. gRPC 服务
    info!("gRPC server listening on {}", grpc_addr);
    let grpc_service = PaymentServiceImpl::new(payment_service, health_registry);

    Server::builder()
        .add_service(PaymentServiceServer::new(grpc_service))
        .serve_with_shutdown(grpc_addr, shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = health_handle.await;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
