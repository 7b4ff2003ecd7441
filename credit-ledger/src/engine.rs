//! Balance engine
//!
//! The only component that moves balances. Every mutation:
//!
//! 1. takes the account's single-writer lock,
//! 2. reads the projection and validates the entry against it,
//! 3. stages the entry and the updated projection in one transaction,
//! 4. commits conditioned on the projection version it read.
//!
//! Exactly one ledger entry is written per successful call; a failed call
//! writes nothing.

use crate::{
    config::LedgerPolicy,
    identity::Identity,
    locks::{KeyGuard, KeyedLocks, LockKey},
    metrics::Metrics,
    storage::{check_key_component, Storage, Transaction},
    types::{
        Account, AccountId, AccountStats, BonusReason, EntryMetadata, EntryPage, LedgerEntry,
    },
    Error, Result,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Longest tombstone chain followed before giving up
const MAX_MERGE_HOPS: usize = 16;

/// Result of a committed entry
#[derive(Debug, Clone)]
pub struct AppliedEntry {
    /// ID of the new entry
    pub entry_id: Uuid,
    /// Balance after the entry
    pub new_balance: i64,
    /// The committed entry
    pub entry: LedgerEntry,
}

impl From<LedgerEntry> for AppliedEntry {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            entry_id: entry.id,
            new_balance: entry.balance_after,
            entry,
        }
    }
}

/// Validates and commits balance-affecting entries
#[derive(Debug)]
pub struct BalanceEngine {
    storage: Arc<Storage>,
    locks: Arc<KeyedLocks>,
    metrics: Metrics,
    policy: LedgerPolicy,
}

impl BalanceEngine {
    /// Create engine over shared storage and locks
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<KeyedLocks>,
        metrics: Metrics,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            storage,
            locks,
            metrics,
            policy,
        }
    }

    /// Backing store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Lock registry shared with the other services
    pub fn locks(&self) -> &Arc<KeyedLocks> {
        &self.locks
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Ledger policy
    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    /// Get or create the account of a verified caller.
    ///
    /// Creation writes the projection, the email index key and the welcome
    /// bonus entry in one transaction. A subject that was absorbed by a merge
    /// resolves to the surviving account.
    pub async fn open_account(&self, identity: &Identity) -> Result<Account> {
        let account_id = &identity.account_id;

        if let Some(account) = self.storage.get_account(account_id)? {
            return Ok(account);
        }
        if self.storage.get_tombstone(account_id)?.is_some() {
            return self.live_account(account_id);
        }
        check_key_component("account_id", account_id.as_str())?;
        if let Some(email) = identity.email.as_deref().filter(|e| e.contains('\0')) {
            return Err(Error::InvalidEntry(format!("email {:?} contains NUL", email)));
        }

        let _guard = self.locks.lock(LockKey::Account(account_id.clone())).await;

        // Another request may have created it while we waited
        if let Some(account) = self.storage.get_account(account_id)? {
            return Ok(account);
        }

        let now = Utc::now();
        let mut account = Account {
            id: account_id.clone(),
            email: identity.email.clone().unwrap_or_default().trim().to_string(),
            display_name: identity.display_name.clone(),
            balance: 0,
            entitlements: BTreeSet::new(),
            stats: AccountStats::default(),
            version: 0,
            next_sequence: 0,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.storage.transaction();
        let mut entries = Vec::new();
        if self.policy.welcome_bonus > 0 {
            let entry = self.build_entry(
                &account,
                self.policy.welcome_bonus,
                self.policy.welcome_bonus,
                EntryMetadata::Bonus(BonusReason::Welcome),
            );
            account.apply(&entry);
            tx.append_entry(&entry)?;
            entries.push(entry);
        }
        tx.put_account(&account, None)?;
        self.commit(tx, &entries)?;

        tracing::info!(
            account_id = %account.id,
            balance = account.balance,
            "Opened account"
        );

        Ok(account)
    }

    /// Validate and append one entry to an account.
    ///
    /// An absorbed account ID is written to the account that absorbed it.
    /// The entry's `account_id` names the account actually charged.
    pub async fn apply_entry(
        &self,
        account_id: &AccountId,
        amount: i64,
        metadata: EntryMetadata,
    ) -> Result<AppliedEntry> {
        let (_guard, mut account) = self.lock_live_account(account_id).await?;

        let mut tx = self.storage.transaction();
        let entry = self.stage_entry(&mut tx, &mut account, amount, metadata)?;
        self.commit(tx, std::slice::from_ref(&entry))?;

        tracing::info!(
            account_id = %account.id,
            entry_id = %entry.id,
            entry_type = %entry.entry_type(),
            amount = entry.amount,
            balance = entry.balance_after,
            "Applied ledger entry"
        );

        Ok(entry.into())
    }

    /// Validate an entry and stage it, with the updated projection, into `tx`.
    ///
    /// The caller must hold the account lock and commit through
    /// [`BalanceEngine::commit`]. `account` is moved forward in place.
    pub fn stage_entry(
        &self,
        tx: &mut Transaction<'_>,
        account: &mut Account,
        amount: i64,
        metadata: EntryMetadata,
    ) -> Result<LedgerEntry> {
        let balance_after = self
            .validate(account, amount, &metadata)
            .map_err(|err| self.reject(account, err))?;
        self.stage(tx, account, amount, balance_after, metadata)
    }

    /// Stage a correction whose `balance_after` is fixed by the caller.
    ///
    /// Used by repair, where the entry brings the ledger sum up to the cached
    /// balance instead of moving the balance.
    pub(crate) fn stage_correction(
        &self,
        tx: &mut Transaction<'_>,
        account: &mut Account,
        amount: i64,
        metadata: EntryMetadata,
    ) -> Result<LedgerEntry> {
        match &metadata {
            EntryMetadata::AdminAdjustment {
                acting_admin_id, ..
            } if !acting_admin_id.is_empty() => {}
            _ => {
                return Err(self.reject(
                    account,
                    Error::InvalidEntry("corrections must be attributed admin adjustments".into()),
                ))
            }
        }
        let balance_after = account.balance;
        self.stage(tx, account, amount, balance_after, metadata)
    }

    fn stage(
        &self,
        tx: &mut Transaction<'_>,
        account: &mut Account,
        amount: i64,
        balance_after: i64,
        metadata: EntryMetadata,
    ) -> Result<LedgerEntry> {
        let expected_version = account.version;
        let entry = self.build_entry(account, amount, balance_after, metadata);
        account.apply(&entry);
        tx.append_entry(&entry)?;
        tx.put_account(account, Some(expected_version))?;
        Ok(entry)
    }

    fn build_entry(
        &self,
        account: &Account,
        amount: i64,
        balance_after: i64,
        metadata: EntryMetadata,
    ) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::now_v7(),
            account_id: account.id.clone(),
            sequence: account.next_sequence,
            amount,
            balance_after,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Check an entry against the current projection; returns the new balance
    fn validate(&self, account: &Account, amount: i64, metadata: &EntryMetadata) -> Result<i64> {
        // Not negatable, so no debit of this size can be reported or undone
        if amount == i64::MIN {
            return Err(Error::InvalidEntry("amount out of range".to_string()));
        }
        let new_balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| Error::InvalidEntry("balance overflow".to_string()))?;

        match metadata {
            EntryMetadata::Spend(_) => {
                if amount > 0 {
                    return Err(Error::InvalidEntry(
                        "spend amount must not be positive".to_string(),
                    ));
                }
                if let Some(entitlement) = metadata.unlocked_episode() {
                    if account.has_entitlement(entitlement) {
                        return Err(Error::AlreadyUnlocked(entitlement.clone()));
                    }
                }
            }
            EntryMetadata::Purchase {
                external_reference, ..
            } => {
                if amount <= 0 {
                    return Err(Error::InvalidEntry(
                        "purchase amount must be positive".to_string(),
                    ));
                }
                if external_reference.trim().is_empty() {
                    return Err(Error::InvalidEntry(
                        "purchase requires an external reference".to_string(),
                    ));
                }
                if self
                    .storage
                    .entry_for_external_reference(external_reference)?
                    .is_some()
                {
                    return Err(Error::DuplicateExternalReference(
                        external_reference.clone(),
                    ));
                }
            }
            EntryMetadata::AdminGrant {
                acting_admin_id, ..
            } => {
                if amount <= 0 {
                    return Err(Error::InvalidEntry(
                        "grant amount must be positive".to_string(),
                    ));
                }
                if acting_admin_id.is_empty() {
                    return Err(Error::InvalidEntry("grant requires an admin".to_string()));
                }
            }
            EntryMetadata::Bonus(_) => {
                if amount <= 0 {
                    return Err(Error::InvalidEntry(
                        "bonus amount must be positive".to_string(),
                    ));
                }
            }
            EntryMetadata::AdminAdjustment {
                acting_admin_id, ..
            } => {
                if acting_admin_id.is_empty() {
                    return Err(Error::InvalidEntry(
                        "adjustment requires an admin".to_string(),
                    ));
                }
            }
        }

        if new_balance < 0 {
            return Err(Error::InsufficientCredits {
                balance: account.balance,
                required: -amount,
            });
        }

        Ok(new_balance)
    }

    fn reject(&self, account: &Account, err: Error) -> Error {
        self.metrics.record_rejection(err.kind());
        tracing::warn!(
            account_id = %account.id,
            error = %err,
            "Rejected ledger entry"
        );
        err
    }

    /// Commit a staged transaction and record its entries
    pub fn commit(&self, tx: Transaction<'_>, entries: &[LedgerEntry]) -> Result<()> {
        let start = Instant::now();
        let result = tx.commit();
        self.metrics
            .record_commit_duration(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                for entry in entries {
                    self.metrics.record_entry(entry.entry_type().as_str());
                }
                Ok(())
            }
            Err(err) => {
                self.metrics.record_rejection(err.kind());
                tracing::warn!(error = %err, retriable = err.is_retriable(), "Commit failed");
                Err(err)
            }
        }
    }

    // Reads

    /// Account projection
    pub fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.storage
            .get_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }

    /// Follow merge tombstones from `account_id` to the live account
    pub fn resolve_account_id(&self, account_id: &AccountId) -> Result<AccountId> {
        let mut current = account_id.clone();
        for _ in 0..=MAX_MERGE_HOPS {
            if self.storage.get_account(&current)?.is_some() {
                if current != *account_id {
                    tracing::debug!(
                        account_id = %account_id,
                        merged_into = %current,
                        "Resolved merged account"
                    );
                }
                return Ok(current);
            }
            match self.storage.get_tombstone(&current)? {
                Some(tombstone) => current = tombstone.merged_into,
                None => return Err(Error::AccountNotFound(account_id.clone())),
            }
        }

        tracing::warn!(account_id = %account_id, "Merge chain too long");
        Err(Error::AccountNotFound(account_id.clone()))
    }

    /// Projection of the live account `account_id` resolves to
    pub fn live_account(&self, account_id: &AccountId) -> Result<Account> {
        let live = self.resolve_account_id(account_id)?;
        self.account(&live)
    }

    /// Lock the live account `account_id` resolves to and read it.
    ///
    /// A merge may absorb the account while we wait for its lock; the
    /// chain is then followed again from the new tombstone.
    pub async fn lock_live_account(
        &self,
        account_id: &AccountId,
    ) -> Result<(KeyGuard, Account)> {
        for _ in 0..=MAX_MERGE_HOPS {
            let live = self.resolve_account_id(account_id)?;
            let guard = self.locks.lock(LockKey::Account(live.clone())).await;
            if let Some(account) = self.storage.get_account(&live)? {
                return Ok((guard, account));
            }
        }
        Err(Error::AccountNotFound(account_id.clone()))
    }

    /// One page of history, newest first.
    ///
    /// `cursor` is the `next_cursor` of the previous page.
    pub fn list_entries(
        &self,
        account_id: &AccountId,
        limit: Option<usize>,
        cursor: Option<u64>,
    ) -> Result<EntryPage> {
        let limit = limit
            .unwrap_or(self.policy.default_page_size)
            .clamp(1, self.policy.max_page_size);

        let entries = self.storage.list_entries(account_id, limit, cursor)?;
        let next_cursor = match entries.last() {
            Some(last) if entries.len() == limit && last.sequence > 0 => Some(last.sequence),
            _ => None,
        };

        tracing::debug!(
            account_id = %account_id,
            count = entries.len(),
            "Listed ledger entries"
        );

        Ok(EntryPage {
            entries,
            next_cursor,
        })
    }

    /// Live accounts sharing an email
    pub fn accounts_by_email(&self, email: &str) -> Result<Vec<Account>> {
        self.storage.accounts_by_email(email)
    }
}
