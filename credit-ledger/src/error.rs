//! Error types for the credit ledger

use crate::types::{AccountId, Entitlement, VoteTier};
use chrono::NaiveDate;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bearer credential could not be verified or carries no subject
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Caller is authenticated but lacks the required role
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Balance too low for the requested debit
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits {
        /// Balance at the time of the check
        balance: i64,
        /// Credits the operation needed
        required: i64,
    },

    /// Episode is already unlocked for this account
    #[error("Already unlocked: {0}")]
    AlreadyUnlocked(Entitlement),

    /// Account already voted on this submission
    #[error("Account {account_id} already voted on submission {submission_id}")]
    AlreadyVoted {
        /// Voting account
        account_id: AccountId,
        /// Submission voted on
        submission_id: String,
    },

    /// No votes of the requested tier remain
    #[error("No {0} votes remaining")]
    NoVotesRemaining(VoteTier),

    /// Daily vote already claimed for this local day
    #[error("Daily vote already claimed for {0}")]
    AlreadyClaimedToday(NaiveDate),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// No accounts registered under the email
    #[error("No accounts found for email: {0}")]
    NoDuplicatesFound(String),

    /// Purchase with an external reference that was already credited
    #[error("Duplicate external reference: {0}")]
    DuplicateExternalReference(String),

    /// Unknown vote or credit package
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    /// Entry rejected by validation
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Backing store failed (retriable)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Account changed between read and commit (retriable)
    #[error("Concurrent modification of account {0}")]
    ConcurrentModification(AccountId),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::ConcurrentModification(_)
        )
    }

    /// Short machine-readable kind, used for metric labels and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidCredential(_) => "invalid_credential",
            Error::Forbidden(_) => "forbidden",
            Error::InsufficientCredits { .. } => "insufficient_credits",
            Error::AlreadyUnlocked(_) => "already_unlocked",
            Error::AlreadyVoted { .. } => "already_voted",
            Error::NoVotesRemaining(_) => "no_votes_remaining",
            Error::AlreadyClaimedToday(_) => "already_claimed_today",
            Error::AccountNotFound(_) => "account_not_found",
            Error::NoDuplicatesFound(_) => "no_duplicates_found",
            Error::DuplicateExternalReference(_) => "duplicate_external_reference",
            Error::UnknownPackage(_) => "unknown_package",
            Error::InvalidEntry(_) => "invalid_entry",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::ConcurrentModification(_) => "concurrent_modification",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_kinds() {
        assert!(Error::StoreUnavailable("down".into()).is_retriable());
        assert!(Error::ConcurrentModification(AccountId::new("a")).is_retriable());
        assert!(!Error::InsufficientCredits {
            balance: 10,
            required: 30
        }
        .is_retriable());
        assert!(!Error::NoVotesRemaining(VoteTier::Free).is_retriable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            Error::AlreadyUnlocked(Entitlement::new("s1", 2)).kind(),
            "already_unlocked"
        );
        assert_eq!(Error::Config("x".into()).kind(), "config");
    }
}
