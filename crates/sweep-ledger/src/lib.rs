//! # sweep-ledger
//!
//! Durable, append-only record of every trial of a study. The ledger is the
//! single source of truth for resuming a study after a restart.

pub mod journal;
mod ledger;

pub use journal::{replay, JournalRecord, Replay};
pub use ledger::Ledger;
