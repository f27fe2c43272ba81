pub mod api;
pub mod events;
pub mod identity;
pub mod ingest;
pub mod invoices;
pub mod ledger;
pub mod mirror;
pub mod models;
pub mod plan_change;
pub mod provider;
pub mod signature;

pub use events::{BillingEvent, SubscriptionPayload};
pub use identity::{AccountLocks, PaymentIdentityResolver};
pub use ingest::{IngestOutcome, WebhookIngestor};
pub use invoices::InvoiceAggregator;
pub use ledger::{LedgerOutcome, SubscriptionLedger};
pub use mirror::{start_mirror_worker, upsert_paid_flag, MirrorHandle, MirrorJob};
pub use models::{
    Account, Invoice, ProrationQuote, Subscription, SubscriptionStatus, LEGACY_CUSTOMER_SENTINEL,
};
pub use plan_change::{ConfirmedUpgrade, PlanChangeCoordinator};
pub use provider::{BillingProvider, CostPreview, ProviderSubscription, StripeProvider};
pub use signature::{sign_payload, verify_signature};
