pub mod config;
pub mod db;
pub mod models;
pub mod responses;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::responses::JsonResponse;
use crate::routes::subscription::{
    activate_free, confirm_charge, create_charge, current_subscription, list_plans, plan_history,
};

pub use state::AppState;

/// A simple root route.
async fn root() -> Response {
    JsonResponse::success("plan settlement up").into_response()
}

/// Full router without CORS, which depends on deployment config.
pub fn app(state: AppState) -> Router {
    let subscription_routes = Router::new()
        .route("/charge", post(create_charge))
        .route("/confirm/{intent_reference}", get(confirm_charge))
        .route("/activate-free", post(activate_free))
        .route("/plans", get(list_plans))
        .route("/current", get(current_subscription))
        .route("/history", get(plan_history));

    Router::new()
        .route("/", get(root))
        .nest("/subscription", subscription_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
