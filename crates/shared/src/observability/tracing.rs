//! 日志与分布式追踪
//!
//! 日志走 tracing-subscriber，配置了 OTLP 端点时再叠加 OpenTelemetry 导出层。
//! 事件的 Kafka 消息头携带 W3C Trace Context，发布方注入、消费方提取后作为
//! 处理 span 的父上下文，同一事件在两个服务中的日志可以串起来。

use std::collections::HashMap;

use anyhow::Result;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use super::ObservabilityConfig;

/// 第三方客户端库默认只输出 warn 以上
const QUIET_DEPENDENCIES: &[&str] = &["rdkafka=warn", "librdkafka=warn", "sqlx=warn", "h2=warn"];

/// 追踪导出守卫，drop 时刷新并关闭 OTLP 导出
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("关闭 OTLP 导出失败: {e:?}");
        }
    }
}

/// 安装全局 subscriber；`RUST_LOG` 优先于配置中的日志级别
pub fn init(config: &ObservabilityConfig) -> Result<TracingGuard> {
    let provider = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| otlp_provider(&config.service_name, endpoint))
        .transpose()?;

    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(log_layer(config.json_logs))
        .with(otel_layer)
        .with(log_filter(&config.log_level))
        .try_init()?;

    Ok(TracingGuard { provider })
}

fn log_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(log_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn default_directives(log_level: &str) -> String {
    std::iter::once(log_level)
        .chain(QUIET_DEPENDENCIES.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

fn log_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    if json {
        // 结构化日志带上 span 关闭事件，便于按耗时检索
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    }
}

fn otlp_provider(service_name: &str, endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// 当前 span 所属的 trace ID，作为事件的 correlation_id
pub fn current_trace_id() -> Option<String> {
    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

// ---------------------------------------------------------------------------
// 消息头传播
// ---------------------------------------------------------------------------

/// Kafka 消息头的只读视图
struct HeaderReader<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderReader<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// 待发送消息头的写入视图
struct HeaderWriter<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

fn propagator() -> TraceContextPropagator {
    TraceContextPropagator::new()
}

/// 读取 `traceparent` / `tracestate`，缺失或格式错误时返回空上下文
pub fn extract_from_headers(headers: &HashMap<String, String>) -> opentelemetry::Context {
    propagator().extract(&HeaderReader(headers))
}

/// 把当前 span 的上下文写入待发布消息头，没有有效 span 时不写
pub fn inject_to_headers(headers: &mut HashMap<String, String>) {
    let context = tracing::Span::current().context();
    propagator().inject_context(&context, &mut HeaderWriter(headers));
}

/// 把上游发布方的上下文设为消费 span 的父上下文
pub fn set_parent_from_headers(span: &tracing::Span, headers: &HashMap<String, String>) {
    let _ = span.set_parent(extract_from_headers(headers));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_client_libraries() {
        assert_eq!(
            default_directives("debug"),
            "debug,rdkafka=warn,librdkafka=warn,sqlx=warn,h2=warn"
        );
    }

    #[test]
    fn test_tracestate_survives_extraction() {
        let headers = HashMap::from([
            (
                "traceparent".to_string(),
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
            ),
            ("tracestate".to_string(), "vendor=cart".to_string()),
        ]);

        let context = extract_from_headers(&headers);
        let span = context.span();
        let span_context = span.span_context();
        assert!(span_context.is_remote());
        assert_eq!(span_context.trace_state().get("vendor"), Some("cart"));
    }
}
