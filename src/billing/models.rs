use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Legacy column default carried over from the original account store. Rows
/// holding this literal have never had a real billing customer provisioned.
pub const LEGACY_CUSTOMER_SENTINEL: &str = "''::text";

/// key: billing-models -> accounts,subscriptions,invoices

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub billing_customer_id: Option<String>,
    pub subscription_status: String,
    pub subscription_id: Option<String>,
    pub current_plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// The stored billing customer id, with NULLs and the legacy sentinel
    /// both treated as absent.
    pub fn billing_customer(&self) -> Option<&str> {
        self.billing_customer_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != LEGACY_CUSTOMER_SENTINEL)
    }
}

/// Closed set of subscription states tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Whether this state counts as "paying" for the legacy registry mirror.
    pub fn is_paid(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// key: ledger-subscription-row -> local authoritative read model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub account_id: Uuid,
    pub plan_id: Option<String>,
    pub item_id: Option<String>,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub discount_percent: Option<i32>,
    pub last_event_rank: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only invoice projection sourced from the external processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub amount_paid: i64,
    pub currency: String,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

/// Ephemeral plan-change cost estimate. Never persisted; must be re-derived
/// after expiry.
#[derive(Debug, Clone, Serialize)]
pub struct ProrationQuote {
    pub quote_id: Uuid,
    pub account_id: Uuid,
    pub target_plan_id: String,
    pub subscription_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProrationQuote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sentinel_customer_id_is_absent() {
        let account = Account {
            id: Uuid::new_v4(),
            email: "a@example.com".into(),
            billing_customer_id: Some(LEGACY_CUSTOMER_SENTINEL.into()),
            subscription_status: "none".into(),
            subscription_id: None,
            current_plan_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(account.billing_customer().is_none());
    }

    #[test]
    fn paid_flag_follows_status() {
        assert!(SubscriptionStatus::Active.is_paid());
        assert!(SubscriptionStatus::Trialing.is_paid());
        assert!(!SubscriptionStatus::PastDue.is_paid());
        assert!(!SubscriptionStatus::Canceled.is_paid());
    }

    #[test]
    fn quote_expiry_is_inclusive() {
        let now = Utc::now();
        let quote = ProrationQuote {
            quote_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            target_plan_id: "price_pro".into(),
            subscription_id: "sub_1".into(),
            amount_cents: 1200,
            currency: "usd".into(),
            issued_at: now,
            expires_at: now + Duration::minutes(5),
        };
        assert!(!quote.is_expired(now));
        assert!(quote.is_expired(now + Duration::minutes(5)));
    }
}
