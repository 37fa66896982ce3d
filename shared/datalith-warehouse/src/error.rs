//! Warehouse error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WarehouseError>;

#[derive(Error, Debug)]
pub enum WarehouseError {
    /// The store could not be reached or timed out; safe to retry.
    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation; retrying will not help.
    #[error("Warehouse internal error: {0}")]
    Internal(String),
}

impl WarehouseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
