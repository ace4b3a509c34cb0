use serde::{Deserialize, Serialize};

use crate::policy::{ActionKind, RegenKind};

/// Two-tier balance as returned to callers. Free credits never go negative;
/// paid credits may dip below zero down to the configured floor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub free: i64,
    pub paid: i64,
}

impl Balance {
    pub fn total(self) -> i64 {
        self.free + self.paid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Free,
    Paid,
}

impl GrantKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantKind::Free => "free",
            GrantKind::Paid => "paid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(GrantKind::Free),
            "paid" => Some(GrantKind::Paid),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Promo,
    Payment,
    Signup,
}

impl GrantSource {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantSource::Promo => "promo",
            GrantSource::Payment => "payment",
            GrantSource::Signup => "signup",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "promo" => Some(GrantSource::Promo),
            "payment" => Some(GrantSource::Payment),
            "signup" => Some(GrantSource::Signup),
            _ => None,
        }
    }
}

/// Free-regeneration usage for one `(resource, kind)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenCounter {
    pub resource_id: String,
    pub kind: RegenKind,
    pub used: u32,
}

/// Point-read snapshot of one account row, including its regen counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub account_id: String,
    pub free_remaining: i64,
    pub paid_remaining: i64,
    pub regen_counters: Vec<RegenCounter>,
    pub updated_at_ms: u64,
}

impl BalanceRecord {
    pub fn balance(&self) -> Balance {
        Balance {
            free: self.free_remaining,
            paid: self.paid_remaining,
        }
    }

    pub fn regen_used(&self, resource_id: &str, kind: RegenKind) -> u32 {
        self.regen_counters
            .iter()
            .find(|counter| counter.resource_id == resource_id && counter.kind == kind)
            .map(|counter| counter.used)
            .unwrap_or(0)
    }
}

/// Recorded outcome of a consumption attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    NoCredits,
    RaceDenied,
    Error,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::NoCredits => "no_credits",
            AttemptOutcome::RaceDenied => "race_denied",
            AttemptOutcome::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(AttemptOutcome::Success),
            "no_credits" => Some(AttemptOutcome::NoCredits),
            "race_denied" => Some(AttemptOutcome::RaceDenied),
            "error" => Some(AttemptOutcome::Error),
            _ => None,
        }
    }
}

/// Append-only audit row, one per consumption attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: i64,
    pub ts_ms: u64,
    pub account_id: String,
    pub action: ActionKind,
    pub resource_id: Option<String>,
    pub requested_cost: u32,
    pub actual_cost: u32,
    pub was_free_regeneration: bool,
    pub outcome: AttemptOutcome,
    pub request_id: Option<String>,
    pub detail: serde_json::Value,
}

/// Insert shape for a consumption row; the store assigns id and timestamp.
#[derive(Clone, Debug)]
pub struct NewConsumption {
    pub account_id: String,
    pub action: ActionKind,
    pub resource_id: Option<String>,
    pub requested_cost: u32,
    pub actual_cost: u32,
    pub was_free_regeneration: bool,
    pub outcome: AttemptOutcome,
    pub request_id: Option<String>,
    pub detail: serde_json::Value,
}

/// One applied grant event; `(account_id, external_reference)` is the
/// idempotency key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrantRecord {
    pub account_id: String,
    pub external_reference: String,
    pub amount: u32,
    pub kind: GrantKind,
    pub source: GrantSource,
    pub ts_ms: u64,
}

/// Result of `apply_grant`: whether this call performed the write, plus the
/// balance after (or unchanged, for a replay).
#[derive(Clone, Copy, Debug)]
pub struct GrantApplication {
    pub applied: bool,
    pub balance: Balance,
}
