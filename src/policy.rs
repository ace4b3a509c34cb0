//! Quota policy: pure admission rules for credit consumption.

use serde::{Deserialize, Serialize};

use crate::error::CreditsError;

/// Kinds of free regeneration a resource may carry. Closed set: pricing and
/// quota lookups are exhaustive matches, never string tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenKind {
    Appreciation,
    Summary,
}

impl RegenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RegenKind::Appreciation => "appreciation",
            RegenKind::Summary => "summary",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "appreciation" => Some(RegenKind::Appreciation),
            "summary" => Some(RegenKind::Summary),
            _ => None,
        }
    }
}

/// Billable actions the application can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GenerateAppreciation,
    GenerateSummary,
    BatchGenerate,
    Regenerate,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::GenerateAppreciation => "generate_appreciation",
            ActionKind::GenerateSummary => "generate_summary",
            ActionKind::BatchGenerate => "batch_generate",
            ActionKind::Regenerate => "regenerate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "generate_appreciation" => Some(ActionKind::GenerateAppreciation),
            "generate_summary" => Some(ActionKind::GenerateSummary),
            "batch_generate" => Some(ActionKind::BatchGenerate),
            "regenerate" => Some(ActionKind::Regenerate),
            _ => None,
        }
    }
}

/// Product policy knobs: the overdraft floor and per-kind free-regeneration
/// limits. All values are configuration, not engine logic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_min_balance_floor")]
    pub min_balance_floor: i64,
    #[serde(default = "default_appreciation_regen_limit")]
    pub appreciation_regen_limit: u32,
    #[serde(default = "default_summary_regen_limit")]
    pub summary_regen_limit: u32,
}

fn default_min_balance_floor() -> i64 {
    -5
}

fn default_appreciation_regen_limit() -> u32 {
    3
}

fn default_summary_regen_limit() -> u32 {
    1
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_balance_floor: default_min_balance_floor(),
            appreciation_regen_limit: default_appreciation_regen_limit(),
            summary_regen_limit: default_summary_regen_limit(),
        }
    }
}

impl PolicyConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, CreditsError> {
        toml::from_str(raw).map_err(|err| CreditsError::Config(err.to_string()))
    }

    pub fn free_regen_limit(&self, kind: RegenKind) -> u32 {
        match kind {
            RegenKind::Appreciation => self.appreciation_regen_limit,
            RegenKind::Summary => self.summary_regen_limit,
        }
    }

    pub fn regen_available(&self, used: u32, kind: RegenKind) -> bool {
        used < self.free_regen_limit(kind)
    }

    pub fn within_floor(&self, projected: i64) -> bool {
        projected >= self.min_balance_floor
    }
}

/// Lenient admission: a single remaining credit admits a multi-unit action.
/// The overdraft it opens is bounded separately by the floor check.
pub fn can_afford(total: i64, _cost: u32) -> bool {
    total >= 1
}

pub fn projected_balance(total: i64, cost: u32) -> i64 {
    total - i64::from(cost)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_policy() {
        let policy = PolicyConfig::default();
        assert_eq!(policy.min_balance_floor, -5);
        assert_eq!(policy.free_regen_limit(RegenKind::Appreciation), 3);
        assert_eq!(policy.free_regen_limit(RegenKind::Summary), 1);
    }

    #[test]
    fn regen_available_stops_at_limit() {
        let policy = PolicyConfig::default();
        assert!(policy.regen_available(2, RegenKind::Appreciation));
        assert!(!policy.regen_available(3, RegenKind::Appreciation));
        assert!(policy.regen_available(0, RegenKind::Summary));
        assert!(!policy.regen_available(1, RegenKind::Summary));
    }

    #[test]
    fn admission_is_lenient_but_floor_is_not() {
        let policy = PolicyConfig::default();
        assert!(can_afford(1, 5));
        assert!(!can_afford(0, 1));
        assert!(policy.within_floor(projected_balance(3, 5)));
        assert!(!policy.within_floor(projected_balance(3, 9)));
    }

    #[test]
    fn config_parses_from_toml_with_defaults() {
        let policy = PolicyConfig::from_toml_str("min_balance_floor = -2\n").expect("parse");
        assert_eq!(policy.min_balance_floor, -2);
        assert_eq!(policy.appreciation_regen_limit, 3);

        let err = PolicyConfig::from_toml_str("min_balance_floor = \"oops\"");
        assert!(err.is_err());
    }
}
