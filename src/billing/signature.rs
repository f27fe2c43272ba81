use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;

/// Verify the provider's webhook signature header against the raw body.
///
/// Header format: `t=<unix>,v1=<hex>[,v1=<hex>...]`. The signed message is
/// `"{t}.{body}"` under HMAC-SHA256 with the endpoint's signing secret.
/// Fails closed: any parse failure, timestamp outside the tolerance window,
/// or mismatched digest rejects the event.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), AppError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(decoded) = hex::decode(value) {
                    candidates.push(decoded);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(AppError::SignatureVerification)?;
    if candidates.is_empty() {
        return Err(AppError::SignatureVerification);
    }
    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(AppError::SignatureVerification);
    }

    for candidate in &candidates {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can use any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice is constant-time
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }
    Err(AppError::SignatureVerification)
}

/// Sign a payload the way the provider would. Used by tests and local tooling.
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}
