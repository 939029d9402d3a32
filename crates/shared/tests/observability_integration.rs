//! 可观测性模块集成测试
//!
//! 指标记录函数在没有安装 recorder 时也能安全调用；消息头上的 W3C Trace Context 可提取。

use std::collections::HashMap;

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use bookstore_shared::observability::metrics::{
        record_cart_operation, record_carts_repriced, record_consumer_reconnect,
        record_dead_letter, record_dependency_call, record_event_consumed,
        record_event_published, record_grpc_request, record_payment_operation,
    };

    #[test]
    fn test_record_grpc_request() {
        record_grpc_request("CartService", "AddItem", "ok", 0.05);
        record_grpc_request("CartService", "Checkout", "error", 0.12);
        record_grpc_request("PaymentService", "Capture", "ok", 0.30);
    }

    #[test]
    fn test_record_event_flow() {
        record_event_published("cart.item_added", "ok", 0.01);
        record_event_published("payment.failed", "error", 5.2);
        record_event_consumed("catalog.updated", "processed", 0.02);
        record_event_consumed("catalog.updated", "duplicate", 0.001);
        record_event_consumed("catalog.updated", "requeued", 0.04);
        record_consumer_reconnect("cart-service");
        record_dead_letter("catalog.updated");
    }

    #[test]
    fn test_record_domain_operations() {
        record_cart_operation("add_item", "ok");
        record_cart_operation("checkout", "publish_failed");
        record_carts_repriced(0);
        record_carts_repriced(42);
        record_payment_operation("authorize", "declined", 0.5);
        record_payment_operation("capture", "ok", 0.3);
        record_dependency_call("catalog", "timeout", 5.0);
        record_dependency_call("order", "ok", 0.02);
    }
}

// ============================================================================
// 追踪上下文传播测试
// ============================================================================

mod propagation_tests {
    use super::*;
    use bookstore_shared::observability::tracing::{
        current_trace_id, extract_from_headers, inject_to_headers, set_parent_from_headers,
    };
    use opentelemetry::trace::TraceContextExt;

    #[test]
    fn test_extract_valid_traceparent() {
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );

        let context = extract_from_headers(&headers);
        let span_context = context.span().span_context().clone();

        assert!(span_context.is_valid());
        assert_eq!(
            span_context.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert_eq!(span_context.span_id().to_string(), "b7ad6b7169203331");
    }

    #[test]
    fn test_extract_from_missing_or_malformed_headers() {
        assert!(
            !extract_from_headers(&HashMap::new())
                .span()
                .span_context()
                .is_valid()
        );

        let malformed = [
            "",
            "00-",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331",
            "00-invalid-b7ad6b7169203331-01",
        ];
        for value in malformed {
            let headers = HashMap::from([("traceparent".to_string(), value.to_string())]);
            assert!(!extract_from_headers(&headers).span().span_context().is_valid());
        }
    }

    #[test]
    fn test_inject_without_active_span_adds_nothing() {
        let mut headers = HashMap::new();
        inject_to_headers(&mut headers);
        assert!(!headers.contains_key("traceparent"));
    }

    #[test]
    fn test_set_parent_from_headers_is_safe_without_subscriber() {
        let headers = HashMap::from([(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        )]);
        let span = tracing::info_span!("consume_event");
        set_parent_from_headers(&span, &headers);
    }

    #[test]
    fn test_current_trace_id_without_init() {
        assert!(current_trace_id().is_none());
    }
}
