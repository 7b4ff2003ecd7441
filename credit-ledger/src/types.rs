//! Core types for the credit ledger
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode, externally tagged enums only)
//! - Integer credit arithmetic (`i64`), `Decimal` only for real-money amounts
//! - Statically typed metadata per ledger entry type

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Stable account identifier (the verified token subject)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permanent right to watch one episode of a series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entitlement {
    /// Content series identifier
    pub series_id: String,
    /// Episode number within the series
    pub episode_number: u32,
}

impl Entitlement {
    /// Create new entitlement
    pub fn new(series_id: impl Into<String>, episode_number: u32) -> Self {
        Self {
            series_id: series_id.into(),
            episode_number,
        }
    }
}

impl fmt::Display for Entitlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.series_id, self.episode_number)
    }
}

/// Normalize an email for duplicate detection.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Derived per-account counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    /// Episodes unlocked (including merged entitlements)
    pub episodes_unlocked: u64,
    /// Credits debited by spends
    pub credits_spent: i64,
    /// Credits added by purchases
    pub credits_purchased: i64,
}

/// Account projection (derived from the ledger, cached for fast reads)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Email claim at creation time
    pub email: String,

    /// Display name claim
    pub display_name: Option<String>,

    /// Current balance in credits, never negative
    pub balance: i64,

    /// Unlocked episodes
    pub entitlements: BTreeSet<Entitlement>,

    /// Aggregate counters
    pub stats: AccountStats,

    /// Optimistic concurrency token, bumped by every commit
    pub version: u64,

    /// Sequence number the next ledger entry will receive
    pub next_sequence: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Whether the account owns the entitlement
    pub fn has_entitlement(&self, entitlement: &Entitlement) -> bool {
        self.entitlements.contains(entitlement)
    }

    /// Score used to pick the surviving account of a duplicate set
    pub fn merge_score(&self, entitlement_weight: i64) -> i64 {
        self.balance + entitlement_weight * self.entitlements.len() as i64
    }

    /// Apply an entry to the projection.
    ///
    /// Callers validate first; this only moves the cached state forward.
    pub(crate) fn apply(&mut self, entry: &LedgerEntry) {
        self.balance = entry.balance_after;
        match &entry.metadata {
            EntryMetadata::Purchase { .. } => {
                self.stats.credits_purchased =
                    self.stats.credits_purchased.saturating_add(entry.amount);
            }
            EntryMetadata::Spend(target) => {
                self.stats.credits_spent =
                    self.stats.credits_spent.saturating_sub(entry.amount);
                if let SpendTarget::Episode(entitlement) = target {
                    if self.entitlements.insert(entitlement.clone()) {
                        self.stats.episodes_unlocked += 1;
                    }
                }
            }
            EntryMetadata::AdminAdjustment { reason, .. } => {
                for entitlement in reason.granted_entitlements() {
                    if self.entitlements.insert(entitlement.clone()) {
                        self.stats.episodes_unlocked += 1;
                    }
                }
            }
            EntryMetadata::AdminGrant { .. } | EntryMetadata::Bonus(_) => {}
        }
        self.next_sequence = entry.sequence + 1;
        self.version += 1;
        self.updated_at = entry.created_at;
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Credits bought through the payment processor
    Purchase,
    /// Credits consumed (episode unlock, vote package)
    Spend,
    /// Credits granted by an administrator
    AdminGrant,
    /// Promotional or welcome credits
    Bonus,
    /// Signed administrative correction (repair, merge, manual)
    AdminAdjustment,
}

impl EntryType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Purchase => "purchase",
            EntryType::Spend => "spend",
            EntryType::AdminGrant => "admin_grant",
            EntryType::Bonus => "bonus",
            EntryType::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a spend paid for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendTarget {
    /// Episode unlock
    Episode(Entitlement),
    /// Contest vote package
    VotePackage {
        /// Contest the votes are valid in
        contest_id: String,
        /// Package name
        package: String,
    },
}

/// Why bonus credits were granted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BonusReason {
    /// Account opening bonus
    Welcome,
    /// Marketing campaign
    Promotional {
        /// Campaign name
        campaign: String,
    },
}

/// Why an administrator adjusted a balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentReason {
    /// Free-form correction
    Manual {
        /// Operator note
        note: String,
    },
    /// Reconciliation repair
    Repair {
        /// Ledger sum before the repair
        calculated_balance: i64,
        /// Cached balance the repair aligned the ledger with
        cached_balance: i64,
        /// Entitlements present in the projection without ledger evidence
        granted_entitlements: Vec<Entitlement>,
    },
    /// Duplicate account consolidation
    Merge {
        /// Accounts absorbed into this one
        absorbed_accounts: Vec<AccountId>,
        /// Entitlements carried over from absorbed accounts
        granted_entitlements: Vec<Entitlement>,
    },
}

impl AdjustmentReason {
    /// Entitlements this adjustment vouches for
    pub fn granted_entitlements(&self) -> &[Entitlement] {
        match self {
            AdjustmentReason::Manual { .. } => &[],
            AdjustmentReason::Repair {
                granted_entitlements,
                ..
            }
            | AdjustmentReason::Merge {
                granted_entitlements,
                ..
            } => granted_entitlements,
        }
    }
}

/// Entry metadata, one variant per entry type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMetadata {
    /// Completed payment
    Purchase {
        /// Credit package bought
        package_id: String,
        /// Payment processor reference (idempotency key)
        external_reference: String,
        /// Money charged
        amount_paid: Decimal,
        /// ISO 4217 currency of `amount_paid`
        currency: String,
    },
    /// Credit consumption
    Spend(SpendTarget),
    /// Administrative grant
    AdminGrant {
        /// Administrator who granted
        acting_admin_id: String,
        /// Operator note
        reason: String,
    },
    /// Bonus credits
    Bonus(BonusReason),
    /// Administrative adjustment
    AdminAdjustment {
        /// Administrator who adjusted
        acting_admin_id: String,
        /// Adjustment reason
        reason: AdjustmentReason,
    },
}

impl EntryMetadata {
    /// Entry type implied by the metadata variant
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryMetadata::Purchase { .. } => EntryType::Purchase,
            EntryMetadata::Spend(_) => EntryType::Spend,
            EntryMetadata::AdminGrant { .. } => EntryType::AdminGrant,
            EntryMetadata::Bonus(_) => EntryType::Bonus,
            EntryMetadata::AdminAdjustment { .. } => EntryType::AdminAdjustment,
        }
    }

    /// Payment reference for purchases
    pub fn external_reference(&self) -> Option<&str> {
        match self {
            EntryMetadata::Purchase {
                external_reference, ..
            } => Some(external_reference),
            _ => None,
        }
    }

    /// Episode unlocked by this entry, if any
    pub fn unlocked_episode(&self) -> Option<&Entitlement> {
        match self {
            EntryMetadata::Spend(SpendTarget::Episode(entitlement)) => Some(entitlement),
            _ => None,
        }
    }

    /// Whether this is the account-opening bonus
    pub fn is_welcome_bonus(&self) -> bool {
        matches!(self, EntryMetadata::Bonus(BonusReason::Welcome))
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Owning account
    pub account_id: AccountId,

    /// Position in the account's ledger, starting at 0
    pub sequence: u64,

    /// Signed credit delta
    pub amount: i64,

    /// Balance after this entry was applied
    pub balance_after: i64,

    /// Type-specific context
    pub metadata: EntryMetadata,

    /// Insertion timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry type
    pub fn entry_type(&self) -> EntryType {
        self.metadata.entry_type()
    }
}

/// One page of ledger history, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPage {
    /// Entries in descending sequence order
    pub entries: Vec<LedgerEntry>,
    /// Pass back to fetch the next (older) page
    pub next_cursor: Option<u64>,
}

/// Marker left behind for an account absorbed by a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Absorbed account
    pub account_id: AccountId,
    /// Surviving account
    pub merged_into: AccountId,
    /// Administrator who ran the merge
    pub acting_admin_id: String,
    /// Merge timestamp
    pub merged_at: DateTime<Utc>,
}

/// Contest vote tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteTier {
    /// Daily free vote
    Free,
    /// Purchased premium vote
    Premium,
    /// Purchased super vote
    Super,
}

impl VoteTier {
    /// Weight added to a submission's score
    pub fn weight(&self) -> u64 {
        match self {
            VoteTier::Free => 1,
            VoteTier::Premium => 3,
            VoteTier::Super => 10,
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteTier::Free => "free",
            VoteTier::Premium => "premium",
            VoteTier::Super => "super",
        }
    }
}

impl fmt::Display for VoteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vote counts keyed by tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCounts {
    /// Free votes
    pub free: u32,
    /// Premium votes
    pub premium: u32,
    /// Super votes
    #[serde(rename = "super")]
    pub super_votes: u32,
}

impl TierCounts {
    /// Count for a tier
    pub fn get(&self, tier: VoteTier) -> u32 {
        match tier {
            VoteTier::Free => self.free,
            VoteTier::Premium => self.premium,
            VoteTier::Super => self.super_votes,
        }
    }

    fn slot(&mut self, tier: VoteTier) -> &mut u32 {
        match tier {
            VoteTier::Free => &mut self.free,
            VoteTier::Premium => &mut self.premium,
            VoteTier::Super => &mut self.super_votes,
        }
    }

    /// Add votes of one tier
    pub fn add(&mut self, tier: VoteTier, n: u32) {
        let slot = self.slot(tier);
        *slot = slot.saturating_add(n);
    }

    /// Add every tier of `other`
    pub fn add_all(&mut self, other: &TierCounts) {
        self.add(VoteTier::Free, other.free);
        self.add(VoteTier::Premium, other.premium);
        self.add(VoteTier::Super, other.super_votes);
    }

    /// Take one vote of a tier; false if none left
    pub fn take_one(&mut self, tier: VoteTier) -> bool {
        let slot = self.slot(tier);
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }

    /// Votes across all tiers
    pub fn total(&self) -> u64 {
        self.free as u64 + self.premium as u64 + self.super_votes as u64
    }
}

/// Per account, per contest voting state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestActivity {
    /// Voting account
    pub account_id: AccountId,
    /// Contest
    pub contest_id: String,
    /// Votes already cast
    pub votes_used: TierCounts,
    /// Votes still available
    pub votes_remaining: TierCounts,
    /// Consecutive days with a daily claim
    pub daily_streak: u32,
    /// Account-local date of the last daily claim
    pub last_daily_claim: Option<NaiveDate>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl ContestActivity {
    /// Fresh activity with no votes
    pub fn new(account_id: AccountId, contest_id: impl Into<String>) -> Self {
        Self {
            account_id,
            contest_id: contest_id.into(),
            votes_used: TierCounts::default(),
            votes_remaining: TierCounts::default(),
            daily_streak: 0,
            last_daily_claim: None,
            updated_at: Utc::now(),
        }
    }
}

/// A cast vote; at most one per (account, submission)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// Voting account
    pub account_id: AccountId,
    /// Contest
    pub contest_id: String,
    /// Submission voted on
    pub submission_id: String,
    /// Tier spent
    pub tier: VoteTier,
    /// Weight credited to the submission
    pub weight: u64,
    /// Cast timestamp
    pub cast_at: DateTime<Utc>,
}

/// Weighted vote total of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionTally {
    /// Submission
    pub submission_id: String,
    /// Contest
    pub contest_id: String,
    /// Sum of vote weights
    pub score: u64,
    /// Votes received per tier
    pub votes: TierCounts,
}

impl SubmissionTally {
    /// Empty tally
    pub fn new(contest_id: impl Into<String>, submission_id: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.into(),
            contest_id: contest_id.into(),
            score: 0,
            votes: TierCounts::default(),
        }
    }

    /// Count one vote
    pub fn record(&mut self, tier: VoteTier) {
        self.score += tier.weight();
        self.votes.add(tier, 1);
    }
}
