use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use billing_sync::billing::{
    AccountLocks, BillingProvider, CostPreview, Invoice, PaymentIdentityResolver,
    ProviderSubscription, LEGACY_CUSTOMER_SENTINEL,
};
use billing_sync::error::{AppError, AppResult};
use sqlx::PgPool;
use uuid::Uuid;

// key: identity-tests -> exactly-once creation under races

/// Counts external create calls and hands out sequential customer ids.
struct CountingProvider {
    creates: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            creates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BillingProvider for CountingProvider {
    async fn create_customer(&self, _: &str, _: Uuid, _: &str) -> AppResult<String> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        // simulate upstream latency so racing callers pile onto the lock
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        Ok(format!("cus_created_{n}"))
    }
    async fn preview_plan_change(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<CostPreview> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn update_subscription_price(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> AppResult<ProviderSubscription> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn upcoming_invoice(&self, _: &str, _: &str) -> AppResult<CostPreview> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn list_invoices(&self, _: &str, _: u32) -> AppResult<Vec<Invoice>> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn create_checkout_session(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<String> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn fetch_subscription(&self, _: &str) -> AppResult<ProviderSubscription> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
}

/// Always fails the create call.
struct BrokenProvider;

#[async_trait]
impl BillingProvider for BrokenProvider {
    async fn create_customer(&self, _: &str, _: Uuid, _: &str) -> AppResult<String> {
        Err(AppError::UpstreamUnavailable("create rejected".into()))
    }
    async fn preview_plan_change(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<CostPreview> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn update_subscription_price(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> AppResult<ProviderSubscription> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn upcoming_invoice(&self, _: &str, _: &str) -> AppResult<CostPreview> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn list_invoices(&self, _: &str, _: u32) -> AppResult<Vec<Invoice>> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn create_checkout_session(&self, _: &str, _: &str, _: &str, _: &str) -> AppResult<String> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
    async fn fetch_subscription(&self, _: &str) -> AppResult<ProviderSubscription> {
        Err(AppError::UpstreamUnavailable("not under test".into()))
    }
}

async fn seed_account(pool: &PgPool, customer_id: Option<&str>) -> Uuid {
    let account_id = Uuid::new_v4();
    sqlx::query("INSERT INTO accounts (id, email, billing_customer_id) VALUES ($1, $2, $3)")
        .bind(account_id)
        .bind(format!("{account_id}@example.com"))
        .bind(customer_id)
        .execute(pool)
        .await
        .unwrap();
    account_id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_first_time_resolves_create_exactly_one_identity(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = seed_account(&pool, None).await;

    let provider = Arc::new(CountingProvider::new());
    let resolver = Arc::new(PaymentIdentityResolver::new(
        pool.clone(),
        provider.clone(),
        Arc::new(AccountLocks::new()),
    ));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        tasks.push(tokio::spawn(
            async move { resolver.resolve(account_id).await },
        ));
    }

    let mut observed = Vec::new();
    for task in tasks {
        observed.push(task.await.unwrap().unwrap());
    }

    assert_eq!(
        provider.creates.load(Ordering::SeqCst),
        1,
        "racing callers must collapse onto one external create"
    );
    assert!(
        observed.iter().all(|id| id == "cus_created_0"),
        "all callers observe the same customer id"
    );

    let stored: Option<String> =
        sqlx::query_scalar("SELECT billing_customer_id FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(stored.as_deref(), Some("cus_created_0"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn legacy_sentinel_triggers_recreation(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = seed_account(&pool, Some(LEGACY_CUSTOMER_SENTINEL)).await;

    let provider = Arc::new(CountingProvider::new());
    let resolver =
        PaymentIdentityResolver::new(pool.clone(), provider.clone(), Arc::new(AccountLocks::new()));

    let resolved = resolver.resolve(account_id).await.unwrap();
    assert_eq!(resolved, "cus_created_0");
    assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn existing_identity_is_returned_without_an_external_call(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = seed_account(&pool, Some("cus_existing")).await;

    let provider = Arc::new(CountingProvider::new());
    let resolver =
        PaymentIdentityResolver::new(pool.clone(), provider.clone(), Arc::new(AccountLocks::new()));

    assert_eq!(resolver.resolve(account_id).await.unwrap(), "cus_existing");
    assert_eq!(provider.creates.load(Ordering::SeqCst), 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_creation_persists_no_partial_state(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = seed_account(&pool, None).await;

    let resolver = PaymentIdentityResolver::new(
        pool.clone(),
        Arc::new(BrokenProvider),
        Arc::new(AccountLocks::new()),
    );

    assert!(resolver.resolve(account_id).await.is_err());

    let stored: Option<String> =
        sqlx::query_scalar("SELECT billing_customer_id FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(stored, None, "no identity persisted on upstream failure");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn resolve_for_missing_account_is_not_found(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let resolver = PaymentIdentityResolver::new(
        pool.clone(),
        Arc::new(CountingProvider::new()),
        Arc::new(AccountLocks::new()),
    );
    let err = resolver.resolve(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound));
}
