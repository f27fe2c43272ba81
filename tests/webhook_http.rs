use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, http::Request, Extension};
use billing_sync::billing::{
    sign_payload, start_mirror_worker, AccountLocks, BillingProvider, CostPreview, Invoice,
    InvoiceAggregator, ProviderSubscription, SubscriptionLedger, WebhookIngestor,
};
use billing_sync::error::{AppError, AppResult};
use billing_sync::routes::api_routes;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

// key: webhook-endpoint-tests -> ack semantics over http

const SECRET: &str = "whsec_endpoint_test";

struct OfflineProvider;

#[async_trait]
impl BillingProvider for OfflineProvider {
    async fn create_customer(&self, _: &str, _: Uuid, _: &str) -> AppResult<String> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
    async fn preview_plan_change(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<CostPreview> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
    async fn update_subscription_price(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> AppResult<ProviderSubscription> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
    async fn upcoming_invoice(&self, _: &str, _: &str) -> AppResult<CostPreview> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
    async fn list_invoices(&self, _: &str, _: u32) -> AppResult<Vec<Invoice>> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
    async fn create_checkout_session(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<String> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
    async fn fetch_subscription(&self, _: &str) -> AppResult<ProviderSubscription> {
        Err(AppError::UpstreamUnavailable("offline".into()))
    }
}

fn app(pool: &PgPool) -> axum::Router {
    std::env::set_var("BILLING_WEBHOOK_SECRET", SECRET);
    let provider: Arc<dyn BillingProvider> = Arc::new(OfflineProvider);
    let ingestor = Arc::new(WebhookIngestor::new(
        pool.clone(),
        SubscriptionLedger::new(pool.clone()),
        Arc::new(AccountLocks::new()),
        start_mirror_worker(pool.clone()),
        Arc::new(InvoiceAggregator::new(provider)),
    ));
    api_routes().layer(Extension(ingestor))
}

fn signed_request(body: &Value) -> Request<Body> {
    let raw = body.to_string();
    let signature = sign_payload(SECRET, raw.as_bytes(), Utc::now().timestamp());
    Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header("content-type", "application/json")
        .header("billing-signature", signature)
        .body(Body::from(raw))
        .unwrap()
}

fn created_event(customer: &str) -> Value {
    json!({
        "id": "evt_http_1",
        "type": "customer.subscription.created",
        "data": {
            "object": {
                "id": "sub_http",
                "customer": customer,
                "status": "active",
                "items": {"data": [{"id": "si_1", "price": {"id": "price_basic"}}]}
            }
        }
    })
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unsigned_delivery_is_rejected_with_400(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(&pool);

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header("content-type", "application/json")
        .body(Body::from(created_event("cus_http").to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 400);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn bad_signature_is_rejected_and_nothing_is_recorded(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(&pool);

    let raw = created_event("cus_http").to_string();
    let signature = sign_payload("whsec_wrong", raw.as_bytes(), Utc::now().timestamp());
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header("content-type", "application/json")
        .header("billing-signature", signature)
        .body(Body::from(raw))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 400);

    let recorded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(recorded, 0, "rejected events leave no trace in the ledger");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicates_and_unknown_types_ack_200(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = Uuid::new_v4();
    sqlx::query("INSERT INTO accounts (id, email, billing_customer_id) VALUES ($1, $2, $3)")
        .bind(account_id)
        .bind("payer@example.com")
        .bind("cus_http")
        .execute(&pool)
        .await
        .unwrap();

    let event = created_event("cus_http");
    for _ in 0..2 {
        let response = app(&pool).oneshot(signed_request(&event)).await.unwrap();
        assert_eq!(response.status(), 200, "duplicates must not trigger redelivery");
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let ack: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack, json!({"received": true}), "applied and duplicate share one ack");
    }

    let unknown = json!({"id": "evt_http_2", "type": "plan.archived", "data": {"object": {}}});
    let response = app(&pool).oneshot(signed_request(&unknown)).await.unwrap();
    assert_eq!(response.status(), 200);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE id = 'sub_http'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}
