use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::events::{BillingEvent, SubscriptionPayload, RANK_CREATED, RANK_DELETED, RANK_UPDATED};
use super::models::{Subscription, SubscriptionStatus};

/// Result of applying one verified event to the ledger. `changed` reports
/// whether a material field moved, to drive cache invalidation and the
/// legacy-registry mirror.
#[derive(Debug, Clone, Default)]
pub struct LedgerOutcome {
    pub applied: bool,
    pub changed: bool,
    pub account_id: Option<Uuid>,
    pub email: Option<String>,
    pub paid: Option<bool>,
}

/// key: subscription-ledger -> local authoritative read model
///
/// Entitlement reads are served from here and never call the external
/// processor synchronously; only verified webhook events write to it.
#[derive(Clone)]
pub struct SubscriptionLedger {
    pool: PgPool,
}

impl SubscriptionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent subscription for the account, regardless of state.
    pub async fn get(&self, account_id: Uuid) -> AppResult<Subscription> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE account_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }

    pub async fn list_for_account(&self, account_id: Uuid) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The account's single expected active subscription. More than one is a
    /// divergence: the newest wins and an anomaly record is appended.
    pub async fn active_subscription(&self, account_id: Uuid) -> AppResult<Option<Subscription>> {
        let active = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE account_id = $1 AND status = 'active' \
             ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        if active.len() > 1 {
            tracing::warn!(
                account_id = %account_id,
                count = active.len(),
                "multiple active subscriptions for account, picking most recent"
            );
            sqlx::query(
                "INSERT INTO billing_event_log (id, account_id, kind, detail) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind("multiple-active-subscriptions")
            .bind(serde_json::json!({
                "count": active.len(),
                "subscription_ids": active.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            }))
            .execute(&self.pool)
            .await?;
        }

        Ok(active.into_iter().next())
    }

    /// Resolve the internal account behind an external customer id.
    pub async fn account_for_customer(
        &self,
        customer_id: &str,
    ) -> AppResult<Option<(Uuid, String)>> {
        let row = sqlx::query("SELECT id, email FROM accounts WHERE billing_customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("id"), r.get("email"))))
    }

    /// Apply one verified event inside the ingestor's transaction.
    ///
    /// Precedence: each subscription row remembers the highest event rank it
    /// has absorbed (created=1, updated=2, deleted=3). A lower-ranked event
    /// arriving later is a stale redelivery and is skipped, which makes the
    /// outcome order-insensitive; `deleted` is terminal for that id, and only
    /// a new subscription id escapes it.
    pub async fn apply_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &BillingEvent,
    ) -> AppResult<LedgerOutcome> {
        match event {
            BillingEvent::SubscriptionCreated { subscription, .. } => {
                self.apply_subscription_event(tx, event, subscription, RANK_CREATED)
                    .await
            }
            BillingEvent::SubscriptionUpdated { subscription, .. } => {
                self.apply_subscription_event(tx, event, subscription, RANK_UPDATED)
                    .await
            }
            BillingEvent::SubscriptionDeleted { subscription, .. } => {
                self.apply_subscription_event(tx, event, subscription, RANK_DELETED)
                    .await
            }
            BillingEvent::InvoicePaymentFailed {
                external_id,
                customer_id,
                invoice_id,
            } => {
                // observability only, never a status transition
                let account = match customer_id.as_deref() {
                    Some(customer) => self.account_in_tx(tx, customer).await?,
                    None => None,
                };
                sqlx::query(
                    "INSERT INTO billing_event_log (id, account_id, external_event_id, kind, detail) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(Uuid::new_v4())
                .bind(account.as_ref().map(|(id, _)| *id))
                .bind(external_id)
                .bind("payment-failed")
                .bind(serde_json::json!({
                    "invoice_id": invoice_id,
                    "customer_id": customer_id,
                }))
                .execute(&mut *tx)
                .await?;
                Ok(LedgerOutcome {
                    applied: true,
                    account_id: account.as_ref().map(|(id, _)| *id),
                    email: account.map(|(_, email)| email),
                    ..Default::default()
                })
            }
            BillingEvent::Unknown { event_type, .. } => {
                tracing::info!(event_type = %event_type, "ignoring unrecognized billing event type");
                Ok(LedgerOutcome::default())
            }
        }
    }

    async fn account_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        customer_id: &str,
    ) -> AppResult<Option<(Uuid, String)>> {
        let row = sqlx::query("SELECT id, email FROM accounts WHERE billing_customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&mut *tx)
            .await?;
        Ok(row.map(|r| (r.get("id"), r.get("email"))))
    }

    async fn apply_subscription_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &BillingEvent,
        payload: &SubscriptionPayload,
        rank: i16,
    ) -> AppResult<LedgerOutcome> {
        let Some((account_id, email)) = self.account_in_tx(tx, &payload.customer_id).await? else {
            // a customer we have no account for: log and acknowledge so the
            // source does not redeliver forever
            tracing::warn!(
                customer = %payload.customer_id,
                subscription = %payload.id,
                "billing event references unknown customer"
            );
            sqlx::query(
                "INSERT INTO billing_event_log (id, external_event_id, kind, detail) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(event.external_id())
            .bind("unknown-customer")
            .bind(serde_json::json!({
                "customer_id": payload.customer_id,
                "subscription_id": payload.id,
            }))
            .execute(&mut *tx)
            .await?;
            return Ok(LedgerOutcome::default());
        };

        let existing = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE",
        )
        .bind(&payload.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = &existing {
            if existing.last_event_rank > rank {
                tracing::info!(
                    subscription = %payload.id,
                    stored_rank = existing.last_event_rank,
                    event_rank = rank,
                    "skipping out-of-order billing event"
                );
                return Ok(LedgerOutcome {
                    applied: false,
                    changed: false,
                    account_id: Some(account_id),
                    email: Some(email),
                    paid: None,
                });
            }
        }

        let status = if rank == RANK_DELETED {
            SubscriptionStatus::Canceled.as_str().to_string()
        } else {
            payload.status.clone()
        };

        let changed = match &existing {
            None => true,
            Some(prior) => {
                prior.status != status
                    || (payload.plan_id.is_some() && prior.plan_id != payload.plan_id)
                    || (payload.current_period_end.is_some()
                        && prior.current_period_end != payload.current_period_end)
                    || prior.discount_percent != payload.discount_percent
            }
        };

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, account_id, plan_id, item_id, status,
                current_period_end, discount_percent, last_event_rank
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id)
            DO UPDATE SET
                status = EXCLUDED.status,
                plan_id = COALESCE(EXCLUDED.plan_id, subscriptions.plan_id),
                item_id = COALESCE(EXCLUDED.item_id, subscriptions.item_id),
                current_period_end =
                    COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                discount_percent = EXCLUDED.discount_percent,
                last_event_rank = GREATEST(EXCLUDED.last_event_rank, subscriptions.last_event_rank),
                updated_at = NOW()
            "#,
        )
        .bind(&payload.id)
        .bind(account_id)
        .bind(&payload.plan_id)
        .bind(&payload.item_id)
        .bind(&status)
        .bind(payload.current_period_end)
        .bind(payload.discount_percent)
        .bind(rank)
        .execute(&mut *tx)
        .await?;

        if rank == RANK_DELETED {
            sqlx::query(
                "UPDATE accounts SET subscription_status = 'canceled', subscription_id = NULL, \
                 updated_at = NOW() WHERE id = $1",
            )
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE accounts SET subscription_status = $1, subscription_id = $2, \
                 current_plan_id = COALESCE($3, current_plan_id), updated_at = NOW() WHERE id = $4",
            )
            .bind(&status)
            .bind(&payload.id)
            .bind(&payload.plan_id)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        }

        let paid = SubscriptionStatus::parse(&status).map(|s| s.is_paid());
        Ok(LedgerOutcome {
            applied: true,
            changed,
            account_id: Some(account_id),
            email: Some(email),
            paid,
        })
    }
}
