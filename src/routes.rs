use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/webhooks/billing", post(api::billing_webhook))
        .route("/billing", get(api::get_billing))
        .route("/billing/checkout", post(api::create_checkout))
        .route("/billing/upgrade/preview", post(api::preview_upgrade))
        .route("/billing/upgrade/confirm", post(api::confirm_upgrade))
}
