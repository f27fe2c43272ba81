use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::config;
use crate::error::AppResult;

use super::models::Invoice;
use super::provider::BillingProvider;

struct CacheEntry {
    fetched_at: DateTime<Utc>,
    invoices: Vec<Invoice>,
}

/// key: invoice-aggregator -> cached external read projection
///
/// Invoice history is owned upstream; this keeps a short-TTL projection per
/// account. Within TTL+grace a failed refresh degrades to last-known-good
/// data flagged as stale; beyond that the failure is surfaced rather than
/// silently serving old data.
pub struct InvoiceAggregator {
    provider: Arc<dyn BillingProvider>,
    cache: DashMap<Uuid, CacheEntry>,
    ttl: Duration,
    grace: Duration,
}

impl InvoiceAggregator {
    pub fn new(provider: Arc<dyn BillingProvider>) -> Self {
        Self::with_windows(
            provider,
            *config::INVOICE_CACHE_TTL_SECS,
            *config::INVOICE_CACHE_GRACE_SECS,
        )
    }

    pub fn with_windows(provider: Arc<dyn BillingProvider>, ttl_secs: i64, grace_secs: i64) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            ttl: Duration::seconds(ttl_secs),
            grace: Duration::seconds(grace_secs),
        }
    }

    /// Newest-first invoice history, merging the cache with on-demand fetch.
    /// The boolean reports whether the data is stale (served from the grace
    /// window after a refresh failure).
    pub async fn list(
        &self,
        account_id: Uuid,
        customer_id: &str,
        limit: u32,
    ) -> AppResult<(Vec<Invoice>, bool)> {
        let now = Utc::now();

        if let Some(entry) = self.cache.get(&account_id) {
            if now - entry.fetched_at <= self.ttl {
                return Ok((entry.invoices.clone(), false));
            }
        }

        match self.provider.list_invoices(customer_id, limit).await {
            Ok(mut invoices) => {
                invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.cache.insert(
                    account_id,
                    CacheEntry {
                        fetched_at: now,
                        invoices: invoices.clone(),
                    },
                );
                Ok((invoices, false))
            }
            Err(err) => {
                if let Some(entry) = self.cache.get(&account_id) {
                    if now - entry.fetched_at <= self.ttl + self.grace {
                        tracing::warn!(
                            ?err,
                            account_id = %account_id,
                            "invoice refresh failed, serving last-known-good data"
                        );
                        return Ok((entry.invoices.clone(), true));
                    }
                }
                Err(err)
            }
        }
    }

    /// Drop the cached projection after a material ledger change.
    pub fn invalidate(&self, account_id: Uuid) {
        self.cache.remove(&account_id);
    }
}
