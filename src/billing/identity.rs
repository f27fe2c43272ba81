use std::sync::Arc;

use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::Account;
use super::provider::BillingProvider;

/// Per-account mutexes serializing identity creation and ledger writes.
/// Shared between the resolver and the webhook ingestor.
#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// key: payment-identity -> exactly-once external customer creation
///
/// Maps an account to its external billing customer, creating it at most
/// once. Concurrent first-callers collapse onto one creation via the
/// per-account lock plus a double-check under it; the external call carries
/// an idempotency key derived from the account id as a second line of
/// defense.
pub struct PaymentIdentityResolver {
    pool: PgPool,
    provider: Arc<dyn BillingProvider>,
    locks: Arc<AccountLocks>,
}

impl PaymentIdentityResolver {
    pub fn new(pool: PgPool, provider: Arc<dyn BillingProvider>, locks: Arc<AccountLocks>) -> Self {
        Self {
            pool,
            provider,
            locks,
        }
    }

    pub async fn account(&self, account_id: Uuid) -> AppResult<Account> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Return the account's billing customer id, provisioning it if absent.
    /// The stored legacy sentinel counts as absent and triggers recreation.
    /// No partial state is persisted when the upstream create fails.
    pub async fn resolve(&self, account_id: Uuid) -> AppResult<String> {
        let account = self.account(account_id).await?;
        if let Some(existing) = account.billing_customer() {
            return Ok(existing.to_string());
        }

        let lock = self.locks.lock_for(account_id);
        let _guard = lock.lock().await;

        // double-check under the lock: a concurrent caller may have won
        let account = self.account(account_id).await?;
        if let Some(existing) = account.billing_customer() {
            return Ok(existing.to_string());
        }

        let idempotency_key = format!("acct-create-{account_id}");
        let customer_id = self
            .provider
            .create_customer(&account.email, account_id, &idempotency_key)
            .await?;

        sqlx::query("UPDATE accounts SET billing_customer_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(&customer_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            account_id = %account_id,
            customer = %customer_id,
            "provisioned billing customer identity"
        );
        Ok(customer_id)
    }
}
