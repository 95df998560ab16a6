//! Gateway webhook endpoint
//!
//! The gateway retries any non-2xx response, so status codes are chosen
//! to steer that loop: settled, already-settled AND rejected outcomes are
//! all acknowledged with 200 (retrying cannot change them), 4xx is
//! reserved for malformed payloads, and transient failures surface as 5xx
//! so the gateway redelivers with the same idempotency key.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use clubkit_shared::PaymentNotification;
use clubkit_settlement::SettlementOutcome;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_subscription_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_discount_percent: Option<i32>,
}

/// Handle a payment notification from the gateway
pub async fn payment(
    State(state): State<AppState>,
    Json(notification): Json<PaymentNotification>,
) -> ApiResult<(StatusCode, Json<SettlementResponse>)> {
    // Boundary validation: malformed payloads are the only non-2xx the
    // gateway should ever see for a parseable body
    notification
        .validate()
        .map_err(ApiError::Validation)?;

    tracing::info!(
        idempotency_key = %notification.idempotency_key,
        payer_ref = %notification.payer_ref,
        amount_minor = notification.amount_minor,
        "Payment notification received"
    );

    let outcome = state.coordinator.settle(&notification).await?;

    let response = match outcome {
        SettlementOutcome::Settled {
            subscription_end,
            applied_discount_percent,
            ..
        } => SettlementResponse {
            status: "settled",
            new_subscription_end: subscription_end.format(&Rfc3339).ok(),
            applied_discount_percent: Some(applied_discount_percent),
        },
        SettlementOutcome::AlreadySettled => SettlementResponse {
            status: "already_settled",
            new_subscription_end: None,
            applied_discount_percent: None,
        },
        SettlementOutcome::Rejected { reason } => {
            tracing::warn!(
                idempotency_key = %notification.idempotency_key,
                reason = %reason,
                "Settlement rejected"
            );
            SettlementResponse {
                status: "rejected",
                new_subscription_end: None,
                applied_discount_percent: None,
            }
        }
        SettlementOutcome::KeyConflict { reason } => {
            return Err(ApiError::Conflict(reason));
        }
    };

    Ok((StatusCode::OK, Json(response)))
}
