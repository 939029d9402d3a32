//! 支付事件发布
//!
//! 状态机的状态迁移先于事件发布完成，发布失败只记录日志。

use bookstore_shared::events::{
    EventPayload, PaymentFailed, PaymentReceipt, PaymentSucceeded, ReceiptData,
};
use bookstore_shared::observability::tracing as otel;
use bookstore_shared::publisher::EventPublisher;
use bookstore_shared::DomainEvent;
use chrono::Utc;
use tracing::warn;

use crate::models::Payment;

#[derive(Clone)]
pub struct PaymentEvents {
    publisher: EventPublisher,
}

impl PaymentEvents {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub async fn succeeded(&self, payment: &Payment) -> Option<DomainEvent> {
        self.emit(EventPayload::PaymentSucceeded(PaymentSucceeded {
            order_id: payment.order_id.clone(),
            payment_id: payment.payment_id.clone(),
            user_id: payment.user_id.clone(),
            amount: payment.amount.clone(),
            status: payment.status.to_string(),
            payment_method: payment.method.method_type.to_string(),
            transaction_id: payment.transaction_id.clone(),
            at: payment.captured_at.unwrap_or_else(Utc::now),
        }))
        .await
    }

    pub async fn receipt(&self, payment: &Payment) -> Option<DomainEvent> {
        self.emit(EventPayload::PaymentReceipt(PaymentReceipt {
            order_id: payment.order_id.clone(),
            payment_id: payment.payment_id.clone(),
            user_id: payment.user_id.clone(),
            receipt_data: ReceiptData {
                payment_method: payment.method.method_type.to_string(),
                last4: payment.method.last4.clone(),
                amount: payment.amount.amount,
                currency: payment.amount.currency.clone(),
                transaction_id: payment.transaction_id.clone(),
                captured_at: payment.captured_at,
            },
        }))
        .await
    }

    pub async fn failed(&self, payment: &Payment, reason: &str) -> Option<DomainEvent> {
        self.emit(EventPayload::PaymentFailed(PaymentFailed {
            order_id: payment.order_id.clone(),
            payment_id: payment.payment_id.clone(),
            user_id: payment.user_id.clone(),
            amount: payment.amount.clone(),
            status: payment.status.to_string(),
            payment_method: payment.method.method_type.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        }))
        .await
    }

    async fn emit(&self, payload: EventPayload) -> Option<DomainEvent> {
        let correlation_id = otel::current_trace_id();
        let event = self
            .publisher
            .publish_or_log(&payload, correlation_id.as_deref())
            .await;
        if event.is_none() {
            warn!(event_type = %payload.event_type(), "支付状态已更新，事件未发布");
        }
        event
    }
}
