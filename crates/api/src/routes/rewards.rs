//! Reward choice callback
//!
//! Triggered by the UI collaborator when a referrer picks a reward form.
//! Resolution is idempotent: a double-click lands on `already_resolved`
//! with no second credit.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clubkit_shared::OfferId;
use clubkit_settlement::{ResolutionOutcome, RewardChoice};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChoiceRequest {
    pub choice: RewardChoice,
}

#[derive(Debug, Serialize)]
pub struct ChoiceResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub money_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_amount: Option<i32>,
}

/// Resolve a referral reward offer
pub async fn choose(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
    Json(request): Json<ChoiceRequest>,
) -> ApiResult<(StatusCode, Json<ChoiceResponse>)> {
    let outcome = state
        .referral
        .resolve(OfferId(offer_id), request.choice)
        .await?;

    let (status, response) = match outcome {
        ResolutionOutcome::Credited { offer, choice } => (
            StatusCode::OK,
            ChoiceResponse {
                status: "credited",
                money_amount: matches!(choice, RewardChoice::Money)
                    .then_some(offer.money_amount_minor),
                days_amount: matches!(choice, RewardChoice::Days).then_some(offer.days_amount),
            },
        ),
        ResolutionOutcome::AlreadyResolved => (
            StatusCode::OK,
            ChoiceResponse {
                status: "already_resolved",
                money_amount: None,
                days_amount: None,
            },
        ),
        ResolutionOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            ChoiceResponse {
                status: "not_found",
                money_amount: None,
                days_amount: None,
            },
        ),
    };

    Ok((status, Json(response)))
}
