pub mod activity;
pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod ledger;
pub mod memory;
pub mod mirror;
pub mod models;
pub mod progress;
pub mod report;
pub mod store;
pub mod streak;
pub mod vote;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{Clock, FixedClock, Ledger, LedgerSettings, SystemClock};
pub use memory::MemoryStore;
pub use store::LedgerStore;
