//! Consumption engine: the single authoritative entry point for spending
//! credits. One attempt per call; races are reported, never retried here.

use serde_json::json;

use crate::error::{CreditsError, Result};
use crate::policy::{ActionKind, PolicyConfig, RegenKind, can_afford, projected_balance};
use crate::sqlite_store::SqliteStore;
use crate::store_types::{AttemptOutcome, Balance, NewConsumption};

#[derive(Clone, Debug)]
pub struct ConsumeRequest {
    pub account_id: String,
    pub cost: u32,
    pub action: ActionKind,
    pub resource_id: Option<String>,
    pub regen: Option<RegenKind>,
    pub request_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ConsumeRequest {
    pub fn new(account_id: impl Into<String>, cost: u32, action: ActionKind) -> Self {
        Self {
            account_id: account_id.into(),
            cost,
            action,
            resource_id: None,
            regen: None,
            request_id: None,
            metadata: None,
        }
    }

    /// Marks the request as a regeneration of an existing resource, eligible
    /// for the free-regeneration quota before any credits are charged.
    pub fn with_regen(mut self, resource_id: impl Into<String>, kind: RegenKind) -> Self {
        self.resource_id = Some(resource_id.into());
        self.regen = Some(kind);
        self
    }

    /// Client-generated idempotency token: a retried call that matches a
    /// committed consumption replays its outcome instead of deducting again.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Outcomes are values, not errors: callers branch on denial kinds without
/// error-handling control flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumptionOutcome {
    Consumed {
        actual_cost: u32,
        was_free_regeneration: bool,
        balance: Balance,
    },
    /// Insufficient balance, or the projected balance would breach the floor.
    /// Expected and user-recoverable; drives the caller's upsell path.
    NoCredits { balance: Balance },
    /// The balance changed between read and write. The caller may retry the
    /// whole call; nothing was applied.
    RaceDenied,
}

#[derive(Clone, Debug)]
pub struct ConsumptionEngine {
    store: SqliteStore,
    policy: PolicyConfig,
}

impl ConsumptionEngine {
    pub fn new(store: SqliteStore) -> Self {
        Self::with_policy(store, PolicyConfig::default())
    }

    pub fn with_policy(store: SqliteStore, policy: PolicyConfig) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub async fn consume(&self, req: ConsumeRequest) -> Result<ConsumptionOutcome> {
        if req.cost == 0 {
            return Err(CreditsError::InvalidCost { cost: req.cost });
        }

        let snapshot = self
            .store
            .get_balance(&req.account_id)
            .await?
            .ok_or_else(|| CreditsError::AccountNotFound {
                account_id: req.account_id.clone(),
            })?;

        if let Some(request_id) = req.request_id.as_deref() {
            if let Some(prior) = self.store.find_successful_consumption(request_id).await? {
                return Ok(ConsumptionOutcome::Consumed {
                    actual_cost: prior.actual_cost,
                    was_free_regeneration: prior.was_free_regeneration,
                    balance: snapshot.balance(),
                });
            }
        }

        if let (Some(resource_id), Some(kind)) = (req.resource_id.as_deref(), req.regen) {
            let used = snapshot.regen_used(resource_id, kind);
            if self.policy.regen_available(used, kind) {
                let limit = self.policy.free_regen_limit(kind);
                let applied = self
                    .store
                    .increment_regen_if_below(&req.account_id, resource_id, kind, limit)
                    .await?;
                if applied {
                    self.append_attempt(&req, 0, true, AttemptOutcome::Success)
                        .await;
                    return Ok(ConsumptionOutcome::Consumed {
                        actual_cost: 0,
                        was_free_regeneration: true,
                        balance: snapshot.balance(),
                    });
                }
                // Counter raced to the limit under us; charge normally instead
                // of failing the user twice.
            }
        }

        let balance = snapshot.balance();
        let total = balance.total();
        if !can_afford(total, req.cost)
            || !self.policy.within_floor(projected_balance(total, req.cost))
        {
            self.append_attempt(&req, 0, false, AttemptOutcome::NoCredits)
                .await;
            return Ok(ConsumptionOutcome::NoCredits { balance });
        }

        // Free tier drains before any paid credit is touched.
        let free_deduction = balance.free.min(i64::from(req.cost));
        let paid_deduction = i64::from(req.cost) - free_deduction;

        let written = self
            .store
            .deduct_if_unchanged(
                &req.account_id,
                balance.free,
                balance.paid,
                free_deduction,
                paid_deduction,
            )
            .await?;
        if !written {
            self.append_attempt(&req, 0, false, AttemptOutcome::RaceDenied)
                .await;
            return Ok(ConsumptionOutcome::RaceDenied);
        }

        self.append_attempt(&req, req.cost, false, AttemptOutcome::Success)
            .await;
        Ok(ConsumptionOutcome::Consumed {
            actual_cost: req.cost,
            was_free_regeneration: false,
            balance: Balance {
                free: balance.free - free_deduction,
                paid: balance.paid - paid_deduction,
            },
        })
    }

    /// Best-effort audit append. The deduction is the financially
    /// authoritative event; a failed audit write must not undo it.
    async fn append_attempt(
        &self,
        req: &ConsumeRequest,
        actual_cost: u32,
        was_free_regeneration: bool,
        outcome: AttemptOutcome,
    ) {
        let record = NewConsumption {
            account_id: req.account_id.clone(),
            action: req.action,
            resource_id: req.resource_id.clone(),
            requested_cost: req.cost,
            actual_cost,
            was_free_regeneration,
            outcome,
            // Only committed consumptions reserve the idempotency token;
            // a denial must not block a later successful retry.
            request_id: if outcome == AttemptOutcome::Success {
                req.request_id.clone()
            } else {
                None
            },
            detail: req.metadata.clone().unwrap_or_else(|| json!({})),
        };
        if let Err(err) = self.store.append_consumption(record).await {
            tracing::warn!(
                account_id = %req.account_id,
                error = %err,
                "failed to append consumption record"
            );
        }
    }
}
