use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::{plan_history::PlanHistory, user::User};
use crate::responses::JsonResponse;
use crate::routes::auth::session::AuthSession;
use crate::services::billing::{BillingError, ChargeOutcome, ConfirmOutcome, RefundOutcome};
use crate::state::AppState;
use crate::utils::money::from_minor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargePayload {
    pub target_plan_reference: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateFreePayload {
    pub target_plan_reference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserView {
    id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    plan: Option<String>,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            plan: user.plan,
        }
    }
}

fn refund_view(refund: Option<RefundOutcome>) -> serde_json::Value {
    match refund {
        None | Some(RefundOutcome::Skipped) => serde_json::Value::Null,
        Some(RefundOutcome::Refunded {
            refund_ref,
            amount_minor,
        }) => json!({
            "status": "refunded",
            "amount": from_minor(amount_minor),
            "refundReference": refund_ref,
        }),
        Some(RefundOutcome::Failed { reason }) => json!({
            "status": "failed",
            "amount": from_minor(0),
            "refundReference": null,
            "message": reason,
        }),
    }
}

fn billing_error_response(err: BillingError) -> Response {
    match err {
        BillingError::PlanNotFound(reference) => {
            JsonResponse::not_found(&format!("Plan '{reference}' not found")).into_response()
        }
        BillingError::Validation(msg) => JsonResponse::bad_request(&msg).into_response(),
        BillingError::ChangeInProgress => JsonResponse::conflict(
            "A previous plan change has been paid but not confirmed yet. Confirm it first.",
        )
        .into_response(),
        BillingError::UserNotFound(_) => JsonResponse::not_found("User not found").into_response(),
        BillingError::SettlementInconsistency(msg) => {
            error!(%msg, "settlement inconsistency reported to client");
            JsonResponse::server_error_with_code(
                "Payment received but the plan change could not be completed. Support has been notified.",
                "settlement_inconsistency",
            )
            .into_response()
        }
        BillingError::Gateway(err) => {
            warn!(?err, "payment gateway call failed");
            JsonResponse::server_error_with_code(
                "Payment provider unavailable, please try again",
                "gateway_error",
            )
            .into_response()
        }
        BillingError::Database(err) => {
            error!(?err, "billing database error");
            JsonResponse::server_error("Something went wrong").into_response()
        }
    }
}

fn session_user_id(session: &AuthSession) -> Result<Uuid, Response> {
    session
        .0
        .user_id()
        .ok_or_else(|| JsonResponse::unauthorized("Invalid user ID").into_response())
}

pub async fn create_charge(
    State(state): State<AppState>,
    session: AuthSession,
    Json(payload): Json<ChargePayload>,
) -> Response {
    let user_id = match session_user_id(&session) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state
        .billing
        .create_charge(user_id, &payload.target_plan_reference)
        .await
    {
        Ok(ChargeOutcome::AwaitingPayment {
            client_secret,
            intent_ref,
            plan,
            action,
            net_amount_minor,
        }) => (
            StatusCode::OK,
            Json(json!({
                "clientSecret": client_secret,
                "targetPlanReference": plan.id,
                "intentReference": intent_ref,
                "netAmount": from_minor(net_amount_minor),
                "action": action.as_str(),
            })),
        )
            .into_response(),
        Ok(ChargeOutcome::Settled {
            plan,
            action,
            settlement,
        }) => (
            StatusCode::OK,
            Json(json!({
                "clientSecret": null,
                "targetPlanReference": plan.id,
                "action": action.as_str(),
                "status": true,
                "updatedUser": UserView::from(settlement.user),
                "refund": refund_view(settlement.refund),
            })),
        )
            .into_response(),
        Err(err) => billing_error_response(err),
    }
}

pub async fn confirm_charge(
    State(state): State<AppState>,
    session: AuthSession,
    Path(intent_reference): Path<String>,
) -> Response {
    let user_id = match session_user_id(&session) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.billing.confirm(user_id, &intent_reference).await {
        Ok(ConfirmOutcome::Pending { status }) => (
            StatusCode::OK,
            Json(json!({
                "status": false,
                "message": format!("Payment not completed yet (status: {status})"),
            })),
        )
            .into_response(),
        Ok(ConfirmOutcome::Settled(settlement)) => (
            StatusCode::OK,
            Json(json!({
                "status": true,
                "updatedUser": UserView::from(settlement.user),
                "refund": refund_view(settlement.refund),
            })),
        )
            .into_response(),
        Err(err) => billing_error_response(err),
    }
}

pub async fn activate_free(
    State(state): State<AppState>,
    session: AuthSession,
    body: Bytes,
) -> Response {
    let user_id = match session_user_id(&session) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        ActivateFreePayload::default()
    } else {
        match serde_json::from_slice::<ActivateFreePayload>(&body) {
            Ok(p) => p,
            Err(_) => return JsonResponse::bad_request("Invalid request body").into_response(),
        }
    };

    match state
        .billing
        .activate_free(user_id, payload.target_plan_reference.as_deref())
        .await
    {
        Ok(settlement) => (
            StatusCode::OK,
            Json(json!({
                "status": true,
                "updatedUser": UserView::from(settlement.user),
                "refund": refund_view(settlement.refund),
            })),
        )
            .into_response(),
        Err(err) => billing_error_response(err),
    }
}

pub async fn list_plans(State(state): State<AppState>, _session: AuthSession) -> Response {
    let plans = state.billing.list_plans().await;
    (StatusCode::OK, Json(json!({ "success": true, "plans": plans }))).into_response()
}

pub async fn current_subscription(
    State(state): State<AppState>,
    session: AuthSession,
) -> Response {
    let user_id = match session_user_id(&session) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let user = match state.db.find_user_by_id(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return JsonResponse::not_found("User not found").into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to load user");
            return JsonResponse::server_error("Something went wrong").into_response();
        }
    };

    let cycle = match state.billing_repo.find_billing_cycle(user_id).await {
        Ok(cycle) => cycle,
        Err(err) => {
            error!(?err, %user_id, "failed to load billing cycle");
            return JsonResponse::server_error("Something went wrong").into_response();
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "plan": user.plan,
            "cycle": cycle,
        })),
    )
        .into_response()
}

pub async fn plan_history(State(state): State<AppState>, session: AuthSession) -> Response {
    let user_id = match session_user_id(&session) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.history_repo.list_entries_for_user(user_id).await {
        Ok(entries) => {
            let entries: Vec<PlanHistory> = entries;
            (
                StatusCode::OK,
                Json(json!({ "success": true, "history": entries })),
            )
                .into_response()
        }
        Err(err) => {
            error!(?err, %user_id, "failed to load plan history");
            JsonResponse::server_error("Something went wrong").into_response()
        }
    }
}
