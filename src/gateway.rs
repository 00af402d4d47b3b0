//! Gateway abstraction between the cart machine and the transport.
//!
//! The realtime channel and the durable local queue live behind this trait;
//! the cart only knows how to hand over an operation envelope and how to
//! read the failure classification back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::api::ApiError;
use crate::cart::model::{CartState, OrderRef};
use crate::operations::{OperationId, OperationKind, PendingOperation};

/// Wire shape of a cart operation: `{type, operation_id, order_id, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationEnvelope {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub operation_id: OperationId,
    pub order_id: String,
    pub payload: Value,
}

impl OperationEnvelope {
    pub fn for_operation(op: &PendingOperation, order: &OrderRef) -> Self {
        Self {
            kind: op.request.kind,
            operation_id: op.id.clone(),
            order_id: order.as_str().to_string(),
            payload: op.request.payload.clone(),
        }
    }
}

/// Minimal order header used when the order is created lazily.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDraft {
    pub created_at: DateTime<Utc>,
    pub item_count: u32,
    pub subtotal: f64,
    pub total: f64,
}

impl OrderDraft {
    pub fn from_state(state: &CartState, now: DateTime<Utc>) -> Self {
        Self {
            created_at: state.created_at.unwrap_or(now),
            item_count: state.totals.item_count,
            subtotal: state.totals.subtotal,
            total: state.totals.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Network-level failure; the operation stays pending.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    #[error("insufficient stock: {message}")]
    InsufficientStock {
        message: String,
        available_quantity: Option<u32>,
    },

    #[error("manager approval required: {reason}")]
    ApprovalRequired { reason: String },

    /// Terminal business rejection.
    #[error("operation rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl From<ApiError> for GatewayError {
    fn from(err: ApiError) -> Self {
        if err.is_transient() {
            return GatewayError::Transient(err.to_string());
        }
        match &err {
            ApiError::Status { body: Some(body), .. } => classify_rejection(body),
            _ => GatewayError::Rejected(err.to_string()),
        }
    }
}

/// Map a rejection body (`{code, message, available_quantity}`) to a variant.
pub fn classify_rejection(body: &Value) -> GatewayError {
    let message = ["message", "error", "detail"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .unwrap_or("operation rejected")
        .to_string();
    let code = body
        .get("code")
        .or_else(|| body.get("error_code"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();

    match code.as_str() {
        "INSUFFICIENT_STOCK" | "OUT_OF_STOCK" => GatewayError::InsufficientStock {
            message,
            available_quantity: body
                .get("available_quantity")
                .and_then(Value::as_u64)
                .and_then(|q| u32::try_from(q).ok()),
        },
        "APPROVAL_REQUIRED" | "MANAGER_APPROVAL_REQUIRED" => {
            GatewayError::ApprovalRequired { reason: message }
        }
        _ => GatewayError::Rejected(message),
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Deliver one operation. The operation id is the transport's dedup key.
    async fn send_cart_operation(
        &self,
        envelope: &OperationEnvelope,
    ) -> Result<Value, GatewayError>;

    /// Return the current order id, creating the order if there is none.
    /// Offline this yields an `OrderRef::Local` without touching the network.
    async fn get_or_create_order_id(&self, draft: &OrderDraft) -> Result<OrderRef, GatewayError>;

    fn is_offline_mode(&self) -> bool;

    /// Subscribe the realtime channel to a resumed order.
    async fn initialize_connection(&self, order: &OrderRef) -> Result<(), GatewayError>;

    fn clear_local_order_id(&self);
}
