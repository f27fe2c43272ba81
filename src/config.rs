use once_cell::sync::Lazy;

/// Secret API key for the external billing processor. Must be set via
/// `BILLING_API_KEY`.
pub static BILLING_API_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("BILLING_API_KEY").expect("BILLING_API_KEY must be set"));

/// Signing secret used to verify inbound billing webhooks. Must be set via
/// `BILLING_WEBHOOK_SECRET`.
pub static BILLING_WEBHOOK_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("BILLING_WEBHOOK_SECRET").expect("BILLING_WEBHOOK_SECRET must be set")
});

/// Base URL of the external billing API. Defaults to the hosted processor;
/// overridden in tests to point at a local mock.
pub static BILLING_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("BILLING_API_BASE").unwrap_or_else(|| "https://api.stripe.com".to_string())
});

/// Public site URL used for checkout success/cancel redirects.
pub static SITE_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("SITE_URL").unwrap_or_else(|| "http://localhost:3000".to_string())
});

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even
/// if database migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: proration-config -> quote lifetime
pub static QUOTE_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("QUOTE_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: invoice-cache-config -> freshness window
pub static INVOICE_CACHE_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("INVOICE_CACHE_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// key: invoice-cache-config -> grace window for serving last-known-good data
pub static INVOICE_CACHE_GRACE_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("INVOICE_CACHE_GRACE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(120)
});

/// Accepted clock skew between the webhook signature timestamp and receipt.
pub static WEBHOOK_TOLERANCE_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("WEBHOOK_TOLERANCE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// Retry budget for idempotent upstream calls.
pub static UPSTREAM_RETRY_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("UPSTREAM_RETRY_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

/// Request timeout for upstream billing calls, in seconds.
pub static UPSTREAM_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("UPSTREAM_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// key: mirror-config -> legacy registry retry budget
pub static MIRROR_RETRY_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("MIRROR_RETRY_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
