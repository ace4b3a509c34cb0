//! Grant adapters: promo redemption and payment webhooks. Grants only ever
//! add credit, through the same single-transaction store discipline as
//! consumption, keyed for exactly-once application.

use serde::{Deserialize, Serialize};

use crate::error::{CreditsError, Result};
use crate::sqlite_store::{SqliteStore, SqliteStoreError};
use crate::store_types::{Balance, GrantKind, GrantSource};

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_secs()
    }
}

/// Promo-code definition as supplied by the (external) catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    pub amount: u32,
    pub kind: GrantKind,
    pub active: bool,
    #[serde(default)]
    pub valid_from: Option<u64>,
    #[serde(default)]
    pub valid_until: Option<u64>,
    #[serde(default)]
    pub max_total_uses: Option<u64>,
    #[serde(default)]
    pub max_uses_per_account: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoRejection {
    Inactive,
    NotYetValid,
    Expired,
    GlobalCapReached,
    AccountCapReached,
}

impl PromoRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            PromoRejection::Inactive => "inactive",
            PromoRejection::NotYetValid => "not_yet_valid",
            PromoRejection::Expired => "expired",
            PromoRejection::GlobalCapReached => "global_cap_reached",
            PromoRejection::AccountCapReached => "account_cap_reached",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    Applied { balance: Balance },
    /// The `(account, reference)` pair was granted before; the balance is
    /// unchanged. An idempotent no-op, not an error.
    AlreadyApplied { balance: Balance },
    /// Promo validity check failed before any write.
    Rejected { reason: PromoRejection },
}

pub struct GrantAdapter {
    store: SqliteStore,
    clock: Box<dyn Clock>,
}

impl GrantAdapter {
    pub fn new(store: SqliteStore) -> Self {
        Self::with_clock(store, Box::new(SystemClock))
    }

    pub fn with_clock(store: SqliteStore, clock: Box<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Redeems a promo code for one account. Validity rules (active flag,
    /// time window, use caps) are evaluated here, before the additive write.
    pub async fn redeem_promo(&self, account_id: &str, promo: &PromoCode) -> Result<GrantOutcome> {
        if !promo.active {
            return Ok(GrantOutcome::Rejected {
                reason: PromoRejection::Inactive,
            });
        }
        let now = self.clock.now_epoch_seconds();
        if promo.valid_from.is_some_and(|from| now < from) {
            return Ok(GrantOutcome::Rejected {
                reason: PromoRejection::NotYetValid,
            });
        }
        if promo.valid_until.is_some_and(|until| now > until) {
            return Ok(GrantOutcome::Rejected {
                reason: PromoRejection::Expired,
            });
        }
        if let Some(cap) = promo.max_total_uses {
            let uses = self.store.count_grants_for_reference(&promo.code).await?;
            if uses >= cap {
                return Ok(GrantOutcome::Rejected {
                    reason: PromoRejection::GlobalCapReached,
                });
            }
        }
        if let Some(cap) = promo.max_uses_per_account {
            let uses = self
                .store
                .count_grants_for_account_reference(account_id, &promo.code)
                .await?;
            if uses >= cap {
                return Ok(GrantOutcome::Rejected {
                    reason: PromoRejection::AccountCapReached,
                });
            }
        }

        self.grant(account_id, &promo.code, promo.amount, promo.kind, GrantSource::Promo)
            .await
    }

    /// Payment-webhook entry point. The payment session id is the
    /// idempotency key, so webhook redelivery is harmless.
    pub async fn apply_payment(
        &self,
        account_id: &str,
        session_id: &str,
        amount: u32,
    ) -> Result<GrantOutcome> {
        self.grant(account_id, session_id, amount, GrantKind::Paid, GrantSource::Payment)
            .await
    }

    /// One-time free-credit bonus for a fresh account.
    pub async fn grant_signup_bonus(&self, account_id: &str, amount: u32) -> Result<GrantOutcome> {
        self.grant(account_id, "signup-bonus", amount, GrantKind::Free, GrantSource::Signup)
            .await
    }

    pub async fn grant(
        &self,
        account_id: &str,
        external_reference: &str,
        amount: u32,
        kind: GrantKind,
        source: GrantSource,
    ) -> Result<GrantOutcome> {
        let application = self
            .store
            .apply_grant(account_id, external_reference, amount, kind, source)
            .await
            .map_err(|err| match err {
                SqliteStoreError::AccountNotFound { account_id } => {
                    CreditsError::AccountNotFound { account_id }
                }
                other => CreditsError::Storage(other),
            })?;

        if application.applied {
            tracing::debug!(
                account_id,
                external_reference,
                amount,
                kind = kind.as_str(),
                source = source.as_str(),
                "grant applied"
            );
            Ok(GrantOutcome::Applied {
                balance: application.balance,
            })
        } else {
            Ok(GrantOutcome::AlreadyApplied {
                balance: application.balance,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_epoch_seconds(&self) -> u64 {
            self.0
        }
    }

    async fn adapter_at(now: u64) -> (tempfile::TempDir, SqliteStore, GrantAdapter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("credits.sqlite"));
        store.init().await.expect("init");
        store.create_account("a", 0, 0).await.expect("create");
        let adapter = GrantAdapter::with_clock(store.clone(), Box::new(FixedClock(now)));
        (dir, store, adapter)
    }

    fn promo() -> PromoCode {
        PromoCode {
            code: "promo-ABC".to_string(),
            amount: 10,
            kind: GrantKind::Paid,
            active: true,
            valid_from: Some(1_000),
            valid_until: Some(2_000),
            max_total_uses: Some(2),
            max_uses_per_account: Some(1),
        }
    }

    #[tokio::test]
    async fn promo_applies_once_then_reports_already_applied() {
        let (_dir, _store, adapter) = adapter_at(1_500).await;

        let first = adapter.redeem_promo("a", &promo()).await.expect("first");
        assert_eq!(
            first,
            GrantOutcome::Applied {
                balance: Balance { free: 0, paid: 10 }
            }
        );

        let second = adapter.redeem_promo("a", &promo()).await.expect("second");
        assert_eq!(
            second,
            GrantOutcome::Rejected {
                reason: PromoRejection::AccountCapReached
            }
        );
    }

    #[tokio::test]
    async fn duplicate_payment_webhook_is_an_idempotent_noop() {
        let (_dir, _store, adapter) = adapter_at(1_500).await;

        let first = adapter.apply_payment("a", "cs_123", 25).await.expect("first");
        assert_eq!(
            first,
            GrantOutcome::Applied {
                balance: Balance { free: 0, paid: 25 }
            }
        );

        let redelivered = adapter
            .apply_payment("a", "cs_123", 25)
            .await
            .expect("redelivery");
        assert_eq!(
            redelivered,
            GrantOutcome::AlreadyApplied {
                balance: Balance { free: 0, paid: 25 }
            }
        );
    }

    #[tokio::test]
    async fn inactive_and_out_of_window_promos_are_rejected() {
        let (_dir, _store, adapter) = adapter_at(1_500).await;

        let mut inactive = promo();
        inactive.active = false;
        assert_eq!(
            adapter.redeem_promo("a", &inactive).await.expect("inactive"),
            GrantOutcome::Rejected {
                reason: PromoRejection::Inactive
            }
        );

        let (_dir, _store, early) = adapter_at(500).await;
        assert_eq!(
            early.redeem_promo("a", &promo()).await.expect("early"),
            GrantOutcome::Rejected {
                reason: PromoRejection::NotYetValid
            }
        );

        let (_dir, _store, late) = adapter_at(3_000).await;
        assert_eq!(
            late.redeem_promo("a", &promo()).await.expect("late"),
            GrantOutcome::Rejected {
                reason: PromoRejection::Expired
            }
        );
    }

    #[tokio::test]
    async fn global_use_cap_spans_accounts() {
        let (_dir, store, adapter) = adapter_at(1_500).await;
        store.create_account("b", 0, 0).await.expect("create b");
        store.create_account("c", 0, 0).await.expect("create c");

        assert!(matches!(
            adapter.redeem_promo("a", &promo()).await.expect("a"),
            GrantOutcome::Applied { .. }
        ));
        assert!(matches!(
            adapter.redeem_promo("b", &promo()).await.expect("b"),
            GrantOutcome::Applied { .. }
        ));
        assert_eq!(
            adapter.redeem_promo("c", &promo()).await.expect("c"),
            GrantOutcome::Rejected {
                reason: PromoRejection::GlobalCapReached
            }
        );
    }

    #[tokio::test]
    async fn signup_bonus_lands_in_the_free_tier() {
        let (_dir, store, adapter) = adapter_at(1_500).await;

        adapter.grant_signup_bonus("a", 5).await.expect("bonus");
        let record = store.get_balance("a").await.expect("read").expect("row");
        assert_eq!(record.free_remaining, 5);
        assert_eq!(record.paid_remaining, 0);

        // A second signup bonus cannot double-apply.
        let replay = adapter.grant_signup_bonus("a", 5).await.expect("replay");
        assert!(matches!(replay, GrantOutcome::AlreadyApplied { .. }));
    }

    #[tokio::test]
    async fn granting_to_an_unknown_account_fails() {
        let (_dir, _store, adapter) = adapter_at(1_500).await;
        let err = adapter.apply_payment("ghost", "cs_1", 5).await;
        assert!(matches!(err, Err(CreditsError::AccountNotFound { .. })));
    }
}
