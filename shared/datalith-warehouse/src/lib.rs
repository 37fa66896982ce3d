//! Datalith Warehouse Client
//!
//! Store boundary for the metrics warehouse. The pipeline treats the
//! warehouse as a transactional table store keyed by
//! `(source, metric, timestamp)`; this crate defines that contract and
//! ships an in-memory reference implementation.

mod error;
mod memory;
mod store;

pub use error::{Result, WarehouseError};
pub use memory::MemoryWarehouse;
pub use store::{UpsertOutcome, WarehouseStore};
