use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

use super::events::BillingEvent;
use super::identity::PaymentIdentityResolver;
use super::ingest::WebhookIngestor;
use super::invoices::InvoiceAggregator;
use super::ledger::SubscriptionLedger;
use super::models::{Invoice, Subscription};
use super::plan_change::PlanChangeCoordinator;
use super::signature::verify_signature;

/// key: billing-api -> rest endpoints

/// `POST /webhooks/billing`: raw body + signature header. Responds 200 with
/// `{received:true}` for applied events, duplicates, and unrecognized types
/// alike; only a genuine processing failure bubbles into a 5xx so the source
/// redelivers.
pub async fn billing_webhook(
    Extension(ingestor): Extension<Arc<WebhookIngestor>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<Json<Value>> {
    let signature = headers
        .get("billing-signature")
        .or_else(|| headers.get("stripe-signature"))
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::SignatureVerification)?;

    verify_signature(
        config::BILLING_WEBHOOK_SECRET.as_str(),
        signature,
        &body,
        Utc::now(),
        *config::WEBHOOK_TOLERANCE_SECS,
    )?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::Validation(format!("malformed event payload: {err}")))?;
    let event = BillingEvent::parse(&payload)?;
    ingestor.process(&event, &payload).await?;

    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub account_id: Uuid,
    pub target_plan_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    pub quote_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn preview_upgrade(
    Extension(coordinator): Extension<Arc<PlanChangeCoordinator>>,
    Json(payload): Json<UpgradeRequest>,
) -> AppResult<Json<PreviewResponse>> {
    if payload.target_plan_id.trim().is_empty() {
        return Err(AppError::Validation("targetPlanId required".into()));
    }
    let quote = coordinator
        .preview_upgrade(payload.account_id, &payload.target_plan_id)
        .await?;
    Ok(Json(PreviewResponse {
        quote_id: quote.quote_id,
        amount_cents: quote.amount_cents,
        currency: quote.currency,
        expires_at: quote.expires_at,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub subscription_id: String,
    pub status: String,
    pub amount_cents: Option<i64>,
    pub currency: String,
}

pub async fn confirm_upgrade(
    Extension(coordinator): Extension<Arc<PlanChangeCoordinator>>,
    Json(payload): Json<UpgradeRequest>,
) -> AppResult<Json<ConfirmResponse>> {
    if payload.target_plan_id.trim().is_empty() {
        return Err(AppError::Validation("targetPlanId required".into()));
    }
    let confirmed = coordinator
        .confirm_upgrade(payload.account_id, &payload.target_plan_id)
        .await?;
    Ok(Json(ConfirmResponse {
        subscription_id: confirmed.subscription_id,
        status: confirmed.status,
        amount_cents: confirmed.amount_cents,
        currency: confirmed.currency,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingQuery {
    pub account_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingView {
    pub subscriptions: Vec<Subscription>,
    pub invoices: Vec<Invoice>,
    pub invoices_stale: bool,
    pub billing_customer_id: String,
}

/// `GET /billing?accountId=`: entitlement state from the ledger plus cached
/// invoice history. Provisions the billing identity on first read, the way
/// the checkout path does.
pub async fn get_billing(
    Extension(resolver): Extension<Arc<PaymentIdentityResolver>>,
    Extension(ledger): Extension<SubscriptionLedger>,
    Extension(invoices): Extension<Arc<InvoiceAggregator>>,
    Query(query): Query<BillingQuery>,
) -> AppResult<Json<BillingView>> {
    let customer_id = resolver.resolve(query.account_id).await?;
    let subscriptions = ledger.list_for_account(query.account_id).await?;
    let (invoices, invoices_stale) = invoices.list(query.account_id, &customer_id, 10).await?;
    Ok(Json(BillingView {
        subscriptions,
        invoices,
        invoices_stale,
        billing_customer_id: customer_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub account_id: Uuid,
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub redirect_url: String,
}

pub async fn create_checkout(
    Extension(resolver): Extension<Arc<PaymentIdentityResolver>>,
    Extension(provider): Extension<Arc<dyn super::provider::BillingProvider>>,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    if payload.plan_id.trim().is_empty() {
        return Err(AppError::Validation("planId required".into()));
    }
    let customer_id = resolver.resolve(payload.account_id).await?;
    let site = config::SITE_URL.as_str();
    let redirect_url = provider
        .create_checkout_session(
            &customer_id,
            &payload.plan_id,
            &format!("{site}/dashboard/billing?success=true"),
            &format!("{site}/dashboard/billing?canceled=true"),
        )
        .await?;
    Ok(Json(CheckoutResponse { redirect_url }))
}
