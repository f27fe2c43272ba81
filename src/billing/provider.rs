use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

use super::models::Invoice;

/// Summed cost of a plan change or upcoming renewal, as reported upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CostPreview {
    pub amount_cents: i64,
    pub currency: String,
}

/// Provider-side view of a subscription, used after mutations and for
/// reconciliation reads.
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
    pub item_id: Option<String>,
    pub plan_id: Option<String>,
}

/// key: billing-provider -> versioned adapter seam
///
/// Constructor-injected everywhere a billing call is made, so tests can
/// substitute a mock server or a double. One adapter, one call style per
/// operation; there is deliberately no runtime fallback between SDK
/// generations.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create the external payer record. Idempotency-keyed, safe to retry.
    async fn create_customer(
        &self,
        email: &str,
        account_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<String>;

    /// Cost of switching the subscription's first line item to the target
    /// plan, summed over the returned line deltas.
    async fn preview_plan_change(
        &self,
        customer_id: &str,
        subscription_id: &str,
        item_id: &str,
        target_plan_id: &str,
    ) -> AppResult<CostPreview>;

    /// Apply the price change with proration enabled. Not idempotent; an
    /// ambiguous transport failure surfaces as `AmbiguousOutcome` and is
    /// never blindly retried.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        target_plan_id: &str,
    ) -> AppResult<ProviderSubscription>;

    /// Upcoming-invoice read for the post-write realized amount.
    async fn upcoming_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> AppResult<CostPreview>;

    async fn list_invoices(&self, customer_id: &str, limit: u32) -> AppResult<Vec<Invoice>>;

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        plan_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> AppResult<String>;

    /// Reconciliation read after an `AmbiguousOutcome`.
    async fn fetch_subscription(&self, subscription_id: &str) -> AppResult<ProviderSubscription>;
}

/// Stripe-style HTTP implementation over a form-encoded REST API.
pub struct StripeProvider {
    base: String,
    api_key: String,
    client: Client,
    retry_attempts: u32,
}

impl StripeProvider {
    pub fn new(base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(*config::UPSTREAM_TIMEOUT_SECS))
                .build()
                .expect("client build"),
            retry_attempts: *config::UPSTREAM_RETRY_ATTEMPTS,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            config::BILLING_API_BASE.as_str(),
            config::BILLING_API_KEY.as_str(),
        )
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, &str)]>,
        idempotency_key: Option<&str>,
    ) -> Result<(StatusCode, Value), reqwest::Error> {
        let url = format!("{}{}", self.base, path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .query(query);
        if let Some(form) = form {
            req = req.form(form);
        }
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Bounded-retry wrapper for idempotent calls (reads and
    /// idempotency-keyed creates): exponential backoff, retry on transport
    /// errors and 5xx, terminal on 4xx.
    async fn request_idempotent(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, &str)]>,
        idempotency_key: Option<&str>,
    ) -> AppResult<Value> {
        let mut last_failure = String::new();
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(200 * (1 << attempt))).await;
            }
            match self
                .send_once(method.clone(), path, query, form, idempotency_key)
                .await
            {
                Ok((status, body)) if status.is_success() => return Ok(body),
                Ok((status, body)) if status.is_server_error() => {
                    last_failure = format!("{status}: {body}");
                    tracing::warn!(%path, %status, attempt, "billing api server error, will retry");
                }
                Ok((status, body)) => {
                    return Err(AppError::Message(format!(
                        "billing api rejected {path}: {status}: {body}"
                    )));
                }
                Err(err) => {
                    last_failure = err.to_string();
                    tracing::warn!(%path, ?err, attempt, "billing api transport error, will retry");
                }
            }
        }
        Err(AppError::UpstreamUnavailable(format!(
            "{path} failed after {} attempts: {last_failure}",
            self.retry_attempts
        )))
    }

    /// Single-shot wrapper for non-idempotent mutations. Failures that may
    /// have reached the provider are surfaced as `AmbiguousOutcome` so the
    /// caller performs a reconciliation read before any retry.
    async fn request_mutating(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> AppResult<Value> {
        match self
            .send_once(Method::POST, path, &[], Some(form), None)
            .await
        {
            Ok((status, body)) if status.is_success() => Ok(body),
            Ok((status, body)) if status.is_server_error() => Err(AppError::AmbiguousOutcome(
                format!("{path} returned {status}: {body}"),
            )),
            Ok((status, body)) => Err(AppError::Message(format!(
                "billing api rejected {path}: {status}: {body}"
            ))),
            Err(err) if err.is_connect() => {
                // request never left, safe to report plain unavailability
                Err(AppError::UpstreamUnavailable(err.to_string()))
            }
            Err(err) => Err(AppError::AmbiguousOutcome(err.to_string())),
        }
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    async fn create_customer(
        &self,
        email: &str,
        account_id: Uuid,
        idempotency_key: &str,
    ) -> AppResult<String> {
        let account = account_id.to_string();
        let form: &[(&str, &str)] = &[("email", email), ("metadata[account_id]", account.as_str())];
        let body = self
            .request_idempotent(
                Method::POST,
                "/v1/customers",
                &[],
                Some(form),
                Some(idempotency_key),
            )
            .await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Message("customer create response missing id".into()))
    }

    async fn preview_plan_change(
        &self,
        customer_id: &str,
        subscription_id: &str,
        item_id: &str,
        target_plan_id: &str,
    ) -> AppResult<CostPreview> {
        let query: &[(&str, &str)] = &[
            ("customer", customer_id),
            ("subscription", subscription_id),
            ("subscription_items[0][id]", item_id),
            ("subscription_items[0][price]", target_plan_id),
        ];
        let body = self
            .request_idempotent(Method::GET, "/v1/invoices/upcoming", query, None, None)
            .await?;
        Ok(cost_preview_from_invoice(&body))
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        target_plan_id: &str,
    ) -> AppResult<ProviderSubscription> {
        let path = format!("/v1/subscriptions/{subscription_id}");
        let form: &[(&str, &str)] = &[
            ("items[0][id]", item_id),
            ("items[0][price]", target_plan_id),
            ("proration_behavior", "create_prorations"),
        ];
        let body = self.request_mutating(&path, form).await?;
        parse_provider_subscription(&body)
    }

    async fn upcoming_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> AppResult<CostPreview> {
        let query: &[(&str, &str)] =
            &[("customer", customer_id), ("subscription", subscription_id)];
        let body = self
            .request_idempotent(Method::GET, "/v1/invoices/upcoming", query, None, None)
            .await?;
        Ok(cost_preview_from_invoice(&body))
    }

    async fn list_invoices(&self, customer_id: &str, limit: u32) -> AppResult<Vec<Invoice>> {
        let limit = limit.to_string();
        let query: &[(&str, &str)] = &[("customer", customer_id), ("limit", limit.as_str())];
        let body = self
            .request_idempotent(Method::GET, "/v1/invoices", query, None, None)
            .await?;
        let invoices = body
            .get("data")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_invoice).collect())
            .unwrap_or_default();
        Ok(invoices)
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        plan_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> AppResult<String> {
        let form: &[(&str, &str)] = &[
            ("mode", "subscription"),
            ("customer", customer_id),
            ("line_items[0][price]", plan_id),
            ("line_items[0][quantity]", "1"),
            ("payment_method_types[0]", "card"),
            ("success_url", success_url),
            ("cancel_url", cancel_url),
        ];
        // session creation is safe to retry under an idempotency key derived
        // from customer and plan; duplicates collapse upstream
        let key = format!("checkout-{customer_id}-{plan_id}");
        let body = self
            .request_idempotent(
                Method::POST,
                "/v1/checkout/sessions",
                &[],
                Some(form),
                Some(&key),
            )
            .await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Message("checkout session response missing url".into()))
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> AppResult<ProviderSubscription> {
        let path = format!("/v1/subscriptions/{subscription_id}");
        let body = self
            .request_idempotent(Method::GET, &path, &[], None, None)
            .await?;
        parse_provider_subscription(&body)
    }
}

fn cost_preview_from_invoice(body: &Value) -> CostPreview {
    let amount_cents = body
        .get("lines")
        .and_then(|lines| lines.get("data"))
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(|line| line.get("amount").and_then(Value::as_i64))
                .sum()
        })
        .unwrap_or(0);
    let currency = body
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or("usd")
        .to_string();
    CostPreview {
        amount_cents,
        currency,
    }
}

fn parse_provider_subscription(body: &Value) -> AppResult<ProviderSubscription> {
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Message("subscription response missing id".into()))?
        .to_string();
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("incomplete")
        .to_string();
    let first_item = body
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(|data| data.get(0));
    Ok(ProviderSubscription {
        id,
        status,
        item_id: first_item
            .and_then(|item| item.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        plan_id: first_item
            .and_then(|item| item.get("price"))
            .and_then(|price| price.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn parse_invoice(value: &Value) -> Option<Invoice> {
    Some(Invoice {
        id: value.get("id")?.as_str()?.to_string(),
        amount_paid: value.get("amount_paid").and_then(Value::as_i64).unwrap_or(0),
        currency: value
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("usd")
            .to_string(),
        status: value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
        created_at: value
            .get("created")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now),
        hosted_invoice_url: value
            .get("hosted_invoice_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        invoice_pdf: value
            .get("invoice_pdf")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
