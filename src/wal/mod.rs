//! Write-ahead log for crash recovery
//!
//! Every job mutation is appended here, flushed, and fsynced before it
//! becomes visible in memory. Replaying the log after the last checkpoint
//! reconstructs the exact job table that existed before a crash.

mod record;
mod recovery;
mod store;

pub use record::{WalEvent, WalRecord};
pub use recovery::{RecoveredState, rebuild_table, recover};
pub use store::{WalError, WalStore};
