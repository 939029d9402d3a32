//! 购物车服务
//!
//! gRPC 服务入口，同时运行 `catalog.updated` / `inventory.updated` 的消费循环。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bookstore_proto::cart::cart_service_server::CartServiceServer;
use bookstore_shared::{
    cache::Cache,
    config::{AppConfig, ServiceDefaults},
    consumer::{ConsumerRunner, EventDispatcher},
    database::Database,
    events::EventType,
    health::{self, DatabaseCheck, HealthRegistry, LedgerCheck, PublisherCheck},
    idempotency::{IdempotencyLedger, MemoryLedger, RedisLedger},
    kafka::{KafkaTransport, event_topics},
    observability,
    publisher::{EventPublisher, EventTransport},
};
use tokio::signal;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{error, info, warn};

use cart_service::{
    CartService, CartServiceImpl, CatalogClient, InventoryHandler, MIGRATOR, PriceSyncHandler,
    repository::{CartRepository, CartRepositoryTrait, InMemoryCartRepository},
};

const SERVICE_NAME: &str = "cart-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME, ServiceDefaults::CART).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    // 2. 可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(SERVICE_NAME);
    let _guard = observability::init(&obs_config).await?;

    // --memory：不依赖 PostgreSQL / Redis，便于本地联调
    let in_memory = std::env::args().any(|arg| arg == "--memory");

    info!("Starting {}...", SERVICE_NAME);
    info!(environment = %config.environment, in_memory, "Configuration loaded");

    let grpc_addr: SocketAddr = config
        .server_addr()
        .parse()
        .context("Invalid gRPC address")?;

    let mut health_registry = HealthRegistry::new(SERVICE_NAME);

    // 3. 仓储与幂等账本
    let (repository, ledger): (Arc<dyn CartRepositoryTrait>, Arc<dyn IdempotencyLedger>) =
        if in_memory {
            info!("Using in-memory cart repository and idempotency ledger");
            (
                Arc::new(InMemoryCartRepository::new()),
                Arc::new(MemoryLedger::new(config.idempotency.ttl())),
            )
        } else {
            let db = Database::connect(&config.database).await?;
            db.run_migrations(&MIGRATOR).await?;
            info!("Database connection established");

            let cache = Cache::new(&config.redis)?;
            if let Err(e) = cache.health_check().await {
                warn!(error = %e, "Redis 暂不可用，幂等检查将在恢复后生效");
            }

            health_registry = health_registry.register(Arc::new(DatabaseCheck(db.clone())));

            (
                Arc::new(CartRepository::new(db.pool().clone())),
                Arc::new(RedisLedger::new(cache, SERVICE_NAME, &config.idempotency)),
            )
        };

    // 4. 事件发布
    let transport: Arc<dyn EventTransport> = Arc::new(
        KafkaTransport::connect(
            &config.kafka,
            &config.publisher,
            event_topics(&config.consumer.dead_letter_topic),
        )
        .await?,
    );
    let publisher = EventPublisher::new(transport.clone(), config.publisher.retry_policy());

    health_registry = health_registry
        .register(Arc::new(PublisherCheck(publisher.clone())))
        .register(Arc::new(LedgerCheck(ledger.clone())));

    // 5. 业务服务
    let catalog = CatalogClient::new(
        &config.collaborators.catalog_url,
        config.collaborators.rpc_timeout(),
    )?;
    let cart_service = Arc::new(CartService::new(repository, Arc::new(catalog), publisher));
    info!("Services initialized");

    // 6. 事件消费
    let dispatcher = Arc::new(
        EventDispatcher::new(SERVICE_NAME, ledger, config.consumer.max_deliveries)
            .register(
                EventType::CatalogUpdated,
                Arc::new(PriceSyncHandler::new(cart_service.clone())),
            )
            .register(EventType::InventoryUpdated, Arc::new(InventoryHandler)),
    );
    let runner = ConsumerRunner::new(
        config.kafka.clone(),
        config.consumer.clone(),
        &config.publisher,
        dispatcher,
        transport,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = tokio::spawn(runner.run(shutdown_rx.clone()));

    // 7. 健康检查端点
    let health_addr = config.health_addr();
    let health_handle = tokio::spawn({
        let registry = health_registry.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = health::serve(&health_addr, registry, shutdown_rx).await {
                error!("Health server exited: {}", e);
            }
        }
    });

    // 8. gRPC 服务
    info!("gRPC server listening on {}", grpc_addr);
    let grpc_service = CartServiceImpl::new(cart_service, health_registry);

    Server::builder()
        .add_service(CartServiceServer::new(grpc_service))
        .serve_with_shutdown(grpc_addr, shutdown_signal())
        .await?;

    // 通知消费循环和健康检查端点退出
    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer_handle.await {
        error!("Consumer task panicked: {}", e);
    }
    let _ = health_handle.await;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号
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
