use std::time::Duration;

use anyhow::{anyhow, Result};
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, error::TrySendError, Sender};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config;

/// key: legacy-registry-bridge -> background mirror of the paid flag
///
/// A second customer registry, keyed by email, also tracks whether an
/// account pays. The ledger is the source of truth; this bridge mirrors the
/// flag into the legacy store with bounded retry and never sits on the
/// webhook acknowledgment path.
#[derive(Debug)]
pub enum MirrorJob {
    PaidFlag { email: String, paid: bool },
}

#[derive(Clone)]
pub struct MirrorHandle {
    sender: Sender<MirrorJob>,
}

impl MirrorHandle {
    /// Non-blocking enqueue. A full queue drops the job with an error to the
    /// caller; the next status event for the account repairs a lost flag.
    pub fn dispatch(&self, job: MirrorJob) -> Result<()> {
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => anyhow!("legacy registry mirror queue is full"),
            TrySendError::Closed(_) => anyhow!("legacy registry mirror worker stopped"),
        })
    }
}

/// Idempotent single funnel for the paid flag, used by the worker and by
/// any caller needing a synchronous mirror write.
pub async fn upsert_paid_flag(pool: &PgPool, email: &str, paid: bool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO legacy_customers (email, paid)
        VALUES ($1, $2)
        ON CONFLICT (email)
        DO UPDATE SET paid = EXCLUDED.paid, updated_at = NOW()
        "#,
    )
    .bind(email)
    .bind(paid)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn start_mirror_worker(pool: PgPool) -> MirrorHandle {
    let (tx, mut rx) = channel(64);
    let attempts = *config::MIRROR_RETRY_ATTEMPTS;
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                MirrorJob::PaidFlag { email, paid } => {
                    let mut done = false;
                    for attempt in 0..attempts {
                        if attempt > 0 {
                            sleep(Duration::from_millis(100 * (1 << attempt))).await;
                        }
                        match upsert_paid_flag(&pool, &email, paid).await {
                            Ok(()) => {
                                info!(%email, paid, "legacy registry paid flag mirrored");
                                done = true;
                                break;
                            }
                            Err(err) => {
                                warn!(?err, %email, attempt, "legacy registry mirror write failed");
                            }
                        }
                    }
                    if !done {
                        error!(
                            %email,
                            paid,
                            attempts,
                            "giving up on legacy registry mirror update"
                        );
                    }
                }
            }
        }
    });
    MirrorHandle { sender: tx }
}
