use thiserror::Error;

use crate::sqlite_store::SqliteStoreError;

#[derive(Debug, Error)]
pub enum CreditsError {
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },
    #[error("invalid cost: {cost}")]
    InvalidCost { cost: u32 },
    #[error("storage failure: {0}")]
    Storage(#[from] SqliteStoreError),
    #[error("invalid policy config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CreditsError>;
