//! Credit ledger and consumption engine for the bulletin evaluation
//! generator: two-tier balances (free/paid), per-resource free-regeneration
//! quotas, compare-and-swap deductions, idempotent grants, and an
//! append-only consumption audit log.

mod engine;
mod error;
mod grants;
mod policy;
mod sqlite_store;
mod store_types;

pub use engine::{ConsumeRequest, ConsumptionEngine, ConsumptionOutcome};
pub use error::{CreditsError, Result};
pub use grants::{Clock, GrantAdapter, GrantOutcome, PromoCode, PromoRejection, SystemClock};
pub use policy::{ActionKind, PolicyConfig, RegenKind, can_afford, projected_balance};
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use store_types::{
    AttemptOutcome, Balance, BalanceRecord, ConsumptionRecord, GrantApplication, GrantKind,
    GrantRecord, GrantSource, NewConsumption, RegenCounter,
};
