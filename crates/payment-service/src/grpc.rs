//! gRPC 服务端实现

use std::sync::Arc;
use std::time::Instant;

use bookstore_proto::common::{Empty, HealthStatus, Money as ProtoMoney};
use bookstore_proto::payment::payment_service_server::PaymentService as PaymentGrpc;
use bookstore_proto::payment::{
    AuthorizeRequest, AuthorizeResponse, CaptureRequest, CaptureResponse, GetPaymentRequest,
    GetPaymentResponse, PaymentMethod as ProtoPaymentMethod,
    PaymentMethodType as ProtoMethodType, PaymentStatus as ProtoStatus,
};
use bookstore_shared::Money;
use bookstore_shared::health::HealthRegistry;
use bookstore_shared::money::{DEFAULT_CURRENCY, decimal_places_from_wire};
use bookstore_shared::observability::metrics;
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::error::Result;
use crate::models::{Payment, PaymentMethod, PaymentMethodType, PaymentStatus};
use crate::service::PaymentService;

const SERVICE: &str = "PaymentService";

// ==================== 类型转换辅助函数 ====================

fn money_from_proto(money: Option<ProtoMoney>) -> Money {
    let money = money.unwrap_or_default();
    let currency = if money.currency.is_empty() {
        DEFAULT_CURRENCY.to_string()
    } else {
        money.currency
    };
    Money::new(money.amount, currency)
        .with_decimal_places(decimal_places_from_wire(money.decimal_places))
}

fn money_to_proto(money: &Money) -> ProtoMoney {
    ProtoMoney {
        amount: money.amount,
        currency: money.currency.clone(),
        decimal_places: Some(i32::try_from(money.decimal_places).unwrap_or(i32::MAX)),
    }
}

fn method_type_from_proto(value: i32) -> PaymentMethodType {
    match ProtoMethodType::try_from(value) {
        Ok(ProtoMethodType::CreditCard) => PaymentMethodType::CreditCard,
        Ok(ProtoMethodType::DebitCard) => PaymentMethodType::DebitCard,
        Ok(ProtoMethodType::Paypal) => PaymentMethodType::Paypal,
        Ok(ProtoMethodType::BankTransfer) => PaymentMethodType::BankTransfer,
        Ok(ProtoMethodType::Unspecified) | Err(_) => PaymentMethodType::Unspecified,
    }
}

fn method_type_to_proto(value: PaymentMethodType) -> ProtoMethodType {
    match value {
        PaymentMethodType::Unspecified => ProtoMethodType::Unspecified,
        PaymentMethodType::CreditCard => ProtoMethodType::CreditCard,
        PaymentMethodType::DebitCard => ProtoMethodType::DebitCard,
        PaymentMethodType::Paypal => ProtoMethodType::Paypal,
        PaymentMethodType::BankTransfer => ProtoMethodType::BankTransfer,
    }
}

fn method_from_proto(method: Option<ProtoPaymentMethod>) -> PaymentMethod {
    let method = method.unwrap_or_default();
    PaymentMethod {
        method_type: method_type_from_proto(method.r#type),
        last4: method.last4,
        token: method.token,
    }
}

fn status_to_proto(status: PaymentStatus) -> i32 {
    let status = match status {
        PaymentStatus::Pending => ProtoStatus::Pending,
        PaymentStatus::Authorized => ProtoStatus::Authorized,
        PaymentStatus::Captured => ProtoStatus::Captured,
        PaymentStatus::Failed => ProtoStatus::Failed,
    };
    status as i32
}

fn datetime_to_timestamp(dt: chrono::DateTime<chrono::Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

pub fn payment_to_proto(payment: &Payment) -> GetPaymentResponse {
    GetPaymentResponse {
        payment_id: payment.payment_id.clone(),
        order_id: payment.order_id.clone(),
        user_id: payment.user_id.clone(),
        amount: Some(money_to_proto(&payment.amount)),
        method: Some(ProtoPaymentMethod {
            r#type: method_type_to_proto(payment.method.method_type) as i32,
            last4: payment.method.last4.clone(),
            token: payment.method.token.clone(),
        }),
        status: status_to_proto(payment.status),
        created_at: Some(datetime_to_timestamp(payment.created_at)),
        captured_at: payment.captured_at.map(datetime_to_timestamp),
        transaction_id: payment.transaction_id.clone().unwrap_or_default(),
        error_message: payment.error_message.clone().unwrap_or_default(),
    }
}

fn finish<T>(method: &str, start: Instant, result: Result<T>) -> std::result::Result<T, Status> {
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::record_grpc_request(SERVICE, method, status, start.elapsed().as_secs_f64());
    result.map_err(Status::from)
}

// ==================== gRPC 服务实现 ====================

pub struct PaymentServiceImpl {
    service: Arc<PaymentService>,
    health: HealthRegistry,
}

impl PaymentServiceImpl {
    pub fn new(service: Arc<PaymentService>, health: HealthRegistry) -> Self {
        Self { service, health }
    }
}

#[tonic::async_trait]
impl PaymentGrpc for PaymentServiceImpl {
    #[instrument(skip(self, request), fields(order_id = %request.get_ref().order_id, user_id = %request.get_ref().user_id))]
    async fn authorize(
        &self,
        request: Request<AuthorizeRequest>,
    ) -> std::result::Result<Response<AuthorizeResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let payment = finish(
            "Authorize",
            start,
            self.service
                .authorize(
                    &req.order_id,
                    money_from_proto(req.amount),
                    method_from_proto(req.method),
                    &req.user_id,
                )
                .await,
        )?;

        Ok(Response::new(AuthorizeResponse {
            payment_id: payment.payment_id,
            status: status_to_proto(payment.status),
            message: "Payment authorized successfully".to_string(),
            transaction_id: payment.transaction_id.unwrap_or_default(),
        }))
    }

    #[instrument(skip(self, request), fields(payment_id = %request.get_ref().payment_id))]
    async fn capture(
        &self,
        request: Request<CaptureRequest>,
    ) -> std::result::Result<Response<CaptureResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let payment = finish(
            "Capture",
            start,
            self.service.capture(&req.payment_id).await,
        )?;

        Ok(Response::new(CaptureResponse {
            payment_id: payment.payment_id,
            status: status_to_proto(payment.status),
            message: "Payment captured successfully".to_string(),
            captured_at: payment.captured_at.map(datetime_to_timestamp),
        }))
    }

    #[instrument(skip(self, request), fields(payment_id = %request.get_ref().payment_id))]
    async fn get_payment(
        &self,
        request: Request<GetPaymentRequest>,
    ) -> std::result::Result<Response<GetPaymentResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        let payment = finish(
            "GetPayment",
            start,
            self.service.get_payment(&req.payment_id).await,
        )?;

        Ok(Response::new(payment_to_proto(&payment)))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PaymentEvents;
    use crate::order_client::NoopOrderNotifier;
    use crate::processor::MockProcessor;
    use crate::store::InMemoryPaymentStore;
    use bookstore_shared::config::PaymentConfig;
    use bookstore_shared::publisher::EventPublisher;
    use bookstore_shared::retry::RetryPolicy;
    use bookstore_shared::test_utils::InMemoryTransport;

    fn grpc() -> PaymentServiceImpl {
        let service = PaymentService::new(
            Arc::new(InMemoryPaymentStore::new()),
            Arc::new(MockProcessor::new(&PaymentConfig {
                max_amount: 100_000,
                simulated_latency_ms: 0,
            })),
            PaymentEvents::new(EventPublisher::new(
                Arc::new(InMemoryTransport::new()),
                RetryPolicy::default(),
            )),
            Arc::new(NoopOrderNotifier),
        );
        PaymentServiceImpl::new(Arc::new(service), HealthRegistry::new("payment-service"))
    }

    fn authorize_request(amount: i64, method_type: ProtoMethodType) -> AuthorizeRequest {
        AuthorizeRequest {
            order_id: "O1".to_string(),
            amount: Some(ProtoMoney {
                amount,
                currency: String::new(),
                decimal_places: None,
            }),
            method: Some(ProtoPaymentMethod {
                r#type: method_type as i32,
                last4: "4242".to_string(),
                token: "tok_1".to_string(),
            }),
            user_id: "U1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_authorize_then_get_defaults_currency() {
        let grpc = grpc();
        let response = grpc
            .authorize(Request::new(authorize_request(5000, ProtoMethodType::CreditCard)))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.status, ProtoStatus::Authorized as i32);
        assert!(response.transaction_id.starts_with("TXN-"));

        let payment = grpc
            .get_payment(Request::new(GetPaymentRequest {
                payment_id: response.payment_id,
            }))
            .await
            .unwrap()
            .into_inner();
        let amount = payment.amount.unwrap();
        assert_eq!(amount.currency, "USD");
        assert_eq!(amount.decimal_places, Some(2));
        assert_eq!(payment.method.unwrap().r#type, ProtoMethodType::CreditCard as i32);
    }

    #[tokio::test]
    async fn test_explicit_zero_decimal_places_is_kept() {
        let grpc = grpc();
        let mut request = authorize_request(5000, ProtoMethodType::CreditCard);
        request.amount = Some(ProtoMoney {
            amount: 5000,
            currency: "JPY".to_string(),
            decimal_places: Some(0),
        });

        let response = grpc
            .authorize(Request::new(request))
            .await
            .unwrap()
            .into_inner();
        let payment = grpc
            .get_payment(Request::new(GetPaymentRequest {
                payment_id: response.payment_id,
            }))
            .await
            .unwrap()
            .into_inner();

        let amount = payment.amount.unwrap();
        assert_eq!(amount.currency, "JPY");
        assert_eq!(amount.decimal_places, Some(0));
    }

    #[tokio::test]
    async fn test_unspecified_method_is_declined() {
        let status = grpc()
            .authorize(Request::new(authorize_request(5000, ProtoMethodType::Unspecified)))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(status.message().contains("Invalid payment method"));
    }

    #[tokio::test]
    async fn test_capture_sets_captured_at() {
        let grpc = grpc();
        let authorized = grpc
            .authorize(Request::new(authorize_request(5000, ProtoMethodType::DebitCard)))
            .await
            .unwrap()
            .into_inner();

        let captured = grpc
            .capture(Request::new(CaptureRequest {
                payment_id: authorized.payment_id,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(captured.status, ProtoStatus::Captured as i32);
        assert!(captured.captured_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_payment_id_is_invalid_argument() {
        let status = grpc()
            .get_payment(Request::new(GetPaymentRequest {
                payment_id: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
