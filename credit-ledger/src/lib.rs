//! Credit Ledger
//!
//! Event-sourced credit balances for a streaming platform: credit purchases,
//! paid episode unlocks, contest voting and administrative repair.
//!
//! # Architecture
//!
//! - **Event Sourcing**: The per-account ledger is ground truth; balances and
//!   entitlements are a projection updated in the same atomic write
//! - **Single Writer**: Mutations on one key are serialized by an async lock
//! - **Optimistic Commit**: Every write is conditioned on the projection
//!   version it read
//! - **Verified Identity**: Accounts are keyed by the subject of a verified token
//!
//! # Invariants
//!
//! - Balance conservation: balance == Σ(entry amounts) for every account
//! - No negative balance, ever
//! - Append-only: entries are never modified or deleted
//! - One entry per successful mutation, none for a failed one

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod contest;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod merge;
pub mod metrics;
pub mod notify;
pub mod payment;
pub mod reconciliation;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::{AppliedEntry, BalanceEngine};
pub use error::{Error, Result};
pub use identity::{AdminContext, Identity, IdentityResolver};
pub use ledger::CreditLedger;
pub use storage::Storage;
pub use types::{
    Account, AccountId, Entitlement, EntryMetadata, EntryType, LedgerEntry, VoteTier,
};
