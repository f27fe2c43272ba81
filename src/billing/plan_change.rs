use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

use super::identity::PaymentIdentityResolver;
use super::ledger::SubscriptionLedger;
use super::models::{ProrationQuote, Subscription};
use super::provider::BillingProvider;

/// Outcome of a confirmed upgrade. `amount_cents` is `None` when the
/// post-write cost read failed: explicitly unknown, to recompute later,
/// never a fabricated zero.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmedUpgrade {
    pub subscription_id: String,
    pub status: String,
    pub amount_cents: Option<i64>,
    pub currency: String,
}

/// key: plan-change -> preview/confirm orchestration
///
/// Quotes are ephemeral and server-side only; the confirm path never trusts
/// a client-supplied amount, only the target plan id, and recomputes the
/// authoritative cost upstream. Downgrades and cancellations are routed to a
/// manual process and have no self-service path here.
pub struct PlanChangeCoordinator {
    provider: Arc<dyn BillingProvider>,
    resolver: Arc<PaymentIdentityResolver>,
    ledger: SubscriptionLedger,
    quotes: DashMap<(Uuid, String), ProrationQuote>,
    quote_ttl: Duration,
}

impl PlanChangeCoordinator {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        resolver: Arc<PaymentIdentityResolver>,
        ledger: SubscriptionLedger,
    ) -> Self {
        Self::with_quote_ttl(provider, resolver, ledger, *config::QUOTE_TTL_SECS)
    }

    pub fn with_quote_ttl(
        provider: Arc<dyn BillingProvider>,
        resolver: Arc<PaymentIdentityResolver>,
        ledger: SubscriptionLedger,
        ttl_secs: i64,
    ) -> Self {
        Self {
            provider,
            resolver,
            ledger,
            quotes: DashMap::new(),
            quote_ttl: Duration::seconds(ttl_secs),
        }
    }

    pub async fn preview_upgrade(
        &self,
        account_id: Uuid,
        target_plan_id: &str,
    ) -> AppResult<ProrationQuote> {
        let customer_id = self.resolver.resolve(account_id).await?;
        let subscription = self
            .ledger
            .active_subscription(account_id)
            .await?
            .ok_or(AppError::NoActiveSubscription)?;
        let item_id = self.line_item(&subscription).await?;

        let preview = self
            .provider
            .preview_plan_change(&customer_id, &subscription.id, &item_id, target_plan_id)
            .await?;

        let now = Utc::now();
        let quote = ProrationQuote {
            quote_id: Uuid::new_v4(),
            account_id,
            target_plan_id: target_plan_id.to_string(),
            subscription_id: subscription.id.clone(),
            amount_cents: preview.amount_cents,
            currency: preview.currency,
            issued_at: now,
            expires_at: now + self.quote_ttl,
        };
        self.quotes
            .insert((account_id, target_plan_id.to_string()), quote.clone());
        tracing::info!(
            account_id = %account_id,
            subscription = %subscription.id,
            target_plan = %target_plan_id,
            amount_cents = quote.amount_cents,
            "issued proration quote"
        );
        Ok(quote)
    }

    pub async fn confirm_upgrade(
        &self,
        account_id: Uuid,
        target_plan_id: &str,
    ) -> AppResult<ConfirmedUpgrade> {
        let customer_id = self.resolver.resolve(account_id).await?;
        let subscription = self
            .ledger
            .active_subscription(account_id)
            .await?
            .ok_or(AppError::NoActiveSubscription)?;

        let key = (account_id, target_plan_id.to_string());
        let quote = {
            let Some(entry) = self.quotes.get(&key) else {
                return Err(AppError::StaleQuote);
            };
            entry.clone()
        };
        if quote.is_expired(Utc::now()) {
            self.quotes.remove(&key);
            return Err(AppError::StaleQuote);
        }
        if quote.subscription_id != subscription.id {
            // the world moved since preview: force a fresh quote
            self.quotes.remove(&key);
            return Err(AppError::StaleQuote);
        }

        let item_id = self.line_item(&subscription).await?;
        let updated = match self
            .provider
            .update_subscription_price(&subscription.id, &item_id, target_plan_id)
            .await
        {
            Ok(updated) => updated,
            Err(AppError::AmbiguousOutcome(detail)) => {
                // the write may or may not have landed upstream; drop the
                // quote so a blind retry cannot re-issue the mutation, then
                // reconcile with a read
                self.quotes.remove(&key);
                let landed = self
                    .provider
                    .fetch_subscription(&subscription.id)
                    .await
                    .ok()
                    .filter(|snapshot| snapshot.plan_id.as_deref() == Some(target_plan_id));
                match landed {
                    Some(snapshot) => {
                        tracing::warn!(
                            subscription = %subscription.id,
                            target_plan = %target_plan_id,
                            "ambiguous price change confirmed applied by reconciliation read"
                        );
                        snapshot
                    }
                    None => return Err(AppError::AmbiguousOutcome(detail)),
                }
            }
            Err(err) => return Err(err),
        };
        self.quotes.remove(&key);

        // best-effort realized cost; the ledger itself only moves on the
        // verified webhook that follows
        let (amount_cents, currency) = match self
            .provider
            .upcoming_invoice(&customer_id, &updated.id)
            .await
        {
            Ok(preview) => (Some(preview.amount_cents), preview.currency),
            Err(err) => {
                tracing::warn!(
                    ?err,
                    subscription = %updated.id,
                    "post-upgrade cost read failed, reporting amount as unknown"
                );
                (None, quote.currency.clone())
            }
        };

        tracing::info!(
            account_id = %account_id,
            subscription = %updated.id,
            target_plan = %target_plan_id,
            status = %updated.status,
            "confirmed plan upgrade"
        );
        Ok(ConfirmedUpgrade {
            subscription_id: updated.id,
            status: updated.status,
            amount_cents,
            currency,
        })
    }

    /// First line item of the subscription, falling back to a provider read
    /// when the ledger row predates item tracking.
    async fn line_item(&self, subscription: &Subscription) -> AppResult<String> {
        if let Some(item_id) = &subscription.item_id {
            return Ok(item_id.clone());
        }
        let snapshot = self.provider.fetch_subscription(&subscription.id).await?;
        snapshot
            .item_id
            .ok_or_else(|| AppError::Message("subscription has no line items".into()))
    }
}
