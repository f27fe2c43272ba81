use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::AppError;

/// Precedence rank for ledger writes. An event only applies to a subscription
/// row whose stored rank does not exceed it; `deleted` is terminal.
pub const RANK_CREATED: i16 = 1;
pub const RANK_UPDATED: i16 = 2;
pub const RANK_DELETED: i16 = 3;

/// Subscription fields lifted out of the provider's event envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPayload {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub item_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub discount_percent: Option<i32>,
}

/// key: billing-events -> closed tagged set, unknown catch-all
///
/// The provider delivers loosely-typed JSON; everything the ingestor reacts
/// to is modeled here explicitly, and anything else lands in `Unknown` so it
/// can be acknowledged without effect.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    SubscriptionCreated {
        external_id: String,
        subscription: SubscriptionPayload,
    },
    SubscriptionUpdated {
        external_id: String,
        subscription: SubscriptionPayload,
    },
    SubscriptionDeleted {
        external_id: String,
        subscription: SubscriptionPayload,
    },
    InvoicePaymentFailed {
        external_id: String,
        customer_id: Option<String>,
        invoice_id: Option<String>,
    },
    Unknown {
        external_id: String,
        event_type: String,
    },
}

impl BillingEvent {
    pub fn external_id(&self) -> &str {
        match self {
            BillingEvent::SubscriptionCreated { external_id, .. }
            | BillingEvent::SubscriptionUpdated { external_id, .. }
            | BillingEvent::SubscriptionDeleted { external_id, .. }
            | BillingEvent::InvoicePaymentFailed { external_id, .. }
            | BillingEvent::Unknown { external_id, .. } => external_id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            BillingEvent::SubscriptionCreated { .. } => "customer.subscription.created",
            BillingEvent::SubscriptionUpdated { .. } => "customer.subscription.updated",
            BillingEvent::SubscriptionDeleted { .. } => "customer.subscription.deleted",
            BillingEvent::InvoicePaymentFailed { .. } => "invoice.payment_failed",
            BillingEvent::Unknown { event_type, .. } => event_type,
        }
    }

    pub fn rank(&self) -> Option<i16> {
        match self {
            BillingEvent::SubscriptionCreated { .. } => Some(RANK_CREATED),
            BillingEvent::SubscriptionUpdated { .. } => Some(RANK_UPDATED),
            BillingEvent::SubscriptionDeleted { .. } => Some(RANK_DELETED),
            _ => None,
        }
    }

    /// Parse a raw provider envelope (`{id, type, data: {object}}`).
    ///
    /// A missing event id is rejected: without it the at-least-once stream
    /// cannot be deduplicated. Unrecognized types parse into `Unknown`.
    pub fn parse(envelope: &Value) -> Result<Self, AppError> {
        let external_id = envelope
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Validation("event id missing".into()))?
            .to_string();
        let event_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let object = envelope
            .get("data")
            .and_then(|data| data.get("object"))
            .cloned()
            .unwrap_or(Value::Null);

        let event = match event_type.as_str() {
            "customer.subscription.created" => BillingEvent::SubscriptionCreated {
                external_id,
                subscription: parse_subscription(&object)?,
            },
            "customer.subscription.updated" => BillingEvent::SubscriptionUpdated {
                external_id,
                subscription: parse_subscription(&object)?,
            },
            "customer.subscription.deleted" => BillingEvent::SubscriptionDeleted {
                external_id,
                subscription: parse_subscription(&object)?,
            },
            "invoice.payment_failed" => BillingEvent::InvoicePaymentFailed {
                external_id,
                customer_id: object
                    .get("customer")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                invoice_id: object.get("id").and_then(Value::as_str).map(str::to_string),
            },
            _ => BillingEvent::Unknown {
                external_id,
                event_type,
            },
        };
        Ok(event)
    }
}

fn parse_subscription(object: &Value) -> Result<SubscriptionPayload, AppError> {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("subscription id missing from event".into()))?
        .to_string();
    let customer_id = object
        .get("customer")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("customer id missing from event".into()))?
        .to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("incomplete")
        .to_string();

    let first_item = object
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(|data| data.get(0));
    let item_id = first_item
        .and_then(|item| item.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let plan_id = first_item
        .and_then(|item| item.get("price"))
        .and_then(|price| price.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let current_period_end = object
        .get("current_period_end")
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    let discount_percent = object
        .get("discount")
        .and_then(|discount| discount.get("coupon"))
        .and_then(|coupon| coupon.get("percent_off"))
        .and_then(Value::as_i64)
        .map(|pct| pct as i32);

    Ok(SubscriptionPayload {
        id,
        customer_id,
        status,
        plan_id,
        item_id,
        current_period_end,
        discount_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription_envelope(event_type: &str) -> Value {
        json!({
            "id": "evt_123",
            "type": event_type,
            "data": {
                "object": {
                    "id": "sub_42",
                    "customer": "cus_9",
                    "status": "active",
                    "current_period_end": 1_700_000_000,
                    "items": {
                        "data": [{"id": "si_1", "price": {"id": "price_pro"}}]
                    },
                    "discount": {"coupon": {"percent_off": 20}}
                }
            }
        })
    }

    #[test]
    fn parses_created_with_item_and_discount() {
        let event =
            BillingEvent::parse(&subscription_envelope("customer.subscription.created")).unwrap();
        let BillingEvent::SubscriptionCreated {
            external_id,
            subscription,
        } = event
        else {
            panic!("expected created variant");
        };
        assert_eq!(external_id, "evt_123");
        assert_eq!(subscription.id, "sub_42");
        assert_eq!(subscription.customer_id, "cus_9");
        assert_eq!(subscription.plan_id.as_deref(), Some("price_pro"));
        assert_eq!(subscription.item_id.as_deref(), Some("si_1"));
        assert_eq!(subscription.discount_percent, Some(20));
    }

    #[test]
    fn unrecognized_type_becomes_unknown() {
        let envelope = json!({"id": "evt_x", "type": "charge.refunded", "data": {"object": {}}});
        let event = BillingEvent::parse(&envelope).unwrap();
        assert!(matches!(event, BillingEvent::Unknown { .. }));
        assert_eq!(event.external_id(), "evt_x");
        assert_eq!(event.rank(), None);
    }

    #[test]
    fn missing_event_id_is_rejected() {
        let envelope = json!({"type": "customer.subscription.created", "data": {"object": {}}});
        assert!(BillingEvent::parse(&envelope).is_err());
    }

    #[test]
    fn deleted_outranks_updated_outranks_created() {
        assert!(RANK_DELETED > RANK_UPDATED);
        assert!(RANK_UPDATED > RANK_CREATED);
    }
}
