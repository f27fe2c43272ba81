use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;

use super::events::BillingEvent;
use super::identity::AccountLocks;
use super::invoices::InvoiceAggregator;
use super::ledger::{LedgerOutcome, SubscriptionLedger};
use super::mirror::{MirrorHandle, MirrorJob};

/// What happened to one delivery. Duplicates and unrecognized types are
/// successful no-ops: the source only guarantees at-least-once delivery and
/// must not be asked to redeliver them.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub duplicate: bool,
    pub applied: bool,
    pub changed: bool,
}

/// key: webhook-ingestor -> dedupe + serialize + dispatch
pub struct WebhookIngestor {
    pool: PgPool,
    ledger: SubscriptionLedger,
    locks: Arc<AccountLocks>,
    mirror: MirrorHandle,
    invoices: Arc<InvoiceAggregator>,
}

impl WebhookIngestor {
    pub fn new(
        pool: PgPool,
        ledger: SubscriptionLedger,
        locks: Arc<AccountLocks>,
        mirror: MirrorHandle,
        invoices: Arc<InvoiceAggregator>,
    ) -> Self {
        Self {
            pool,
            ledger,
            locks,
            mirror,
            invoices,
        }
    }

    /// Apply one verified event. The idempotency record and the ledger write
    /// commit in a single transaction; within one account, processing is
    /// serialized through the shared per-account lock so near-simultaneous
    /// redeliveries cannot lose updates. Mirror writes and cache
    /// invalidation are deferred and never delay the acknowledgment.
    pub async fn process(
        &self,
        event: &BillingEvent,
        raw_payload: &serde_json::Value,
    ) -> AppResult<IngestOutcome> {
        // pre-resolve the account so the lock is taken before the transaction
        let account_hint = match event {
            BillingEvent::SubscriptionCreated { subscription, .. }
            | BillingEvent::SubscriptionUpdated { subscription, .. }
            | BillingEvent::SubscriptionDeleted { subscription, .. } => self
                .ledger
                .account_for_customer(&subscription.customer_id)
                .await?
                .map(|(id, _)| id),
            _ => None,
        };

        let _guard = match account_hint {
            Some(account_id) => Some(self.locks.lock_for(account_id)),
            None => None,
        };
        let _held = match &_guard {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO webhook_events (external_id, event_type, payload) VALUES ($1, $2, $3) \
             ON CONFLICT (external_id) DO NOTHING",
        )
        .bind(event.external_id())
        .bind(event.event_type())
        .bind(raw_payload)
        .execute(&mut tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            tracing::info!(
                external_id = %event.external_id(),
                event_type = %event.event_type(),
                "duplicate billing event ignored"
            );
            return Ok(IngestOutcome {
                duplicate: true,
                ..Default::default()
            });
        }

        let outcome = self.ledger.apply_event(&mut tx, event).await?;
        tx.commit().await?;

        self.after_commit(&outcome);

        Ok(IngestOutcome {
            duplicate: false,
            applied: outcome.applied,
            changed: outcome.changed,
        })
    }

    fn after_commit(&self, outcome: &LedgerOutcome) {
        let Some(account_id) = outcome.account_id else {
            return;
        };
        if outcome.changed {
            self.invoices.invalidate(account_id);
        }
        if let (Some(paid), Some(email)) = (outcome.paid, outcome.email.as_ref()) {
            self.dispatch_mirror(account_id, email.clone(), paid);
        }
    }

    fn dispatch_mirror(&self, account_id: Uuid, email: String, paid: bool) {
        if let Err(err) = self.mirror.dispatch(MirrorJob::PaidFlag { email, paid }) {
            // best effort by contract, the webhook ack must not depend on it
            tracing::warn!(
                ?err,
                account_id = %account_id,
                "failed to enqueue legacy registry mirror update"
            );
        }
    }
}
