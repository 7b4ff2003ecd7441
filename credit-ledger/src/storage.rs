//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Account projections (key: account_id)
//! - `entries` - Append-only ledger entries (key: entry_id)
//! - `indices` - Per-account ledger order (key: account_id || 0x00 || sequence)
//! - `emails` - Email lookup (key: normalized email || 0x00 || account_id)
//! - `payments` - Purchase idempotency (key: external_reference)
//! - `contests` - Contest activity (key: account_id || 0x00 || contest_id)
//! - `votes` - Vote records (key: submission_id || 0x00 || account_id)
//! - `tallies` - Submission tallies (key: submission_id)
//! - `tombstones` - Accounts absorbed by merges (key: account_id)
//!
//! Every mutation goes through a [`Transaction`]: writes are staged into one
//! `WriteBatch` and committed atomically after the staged expectations are
//! re-checked inside a short storage-wide commit section.

use crate::{
    error::{Error, Result},
    types::{
        normalize_email, Account, AccountId, ContestActivity, LedgerEntry, SubmissionTally,
        Tombstone, VoteRecord,
    },
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_INDICES: &str = "indices";
const CF_EMAILS: &str = "emails";
const CF_PAYMENTS: &str = "payments";
const CF_CONTESTS: &str = "contests";
const CF_VOTES: &str = "votes";
const CF_TALLIES: &str = "tallies";
const CF_TOMBSTONES: &str = "tombstones";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_ACCOUNTS,
    CF_ENTRIES,
    CF_INDICES,
    CF_EMAILS,
    CF_PAYMENTS,
    CF_CONTESTS,
    CF_VOTES,
    CF_TALLIES,
    CF_TOMBSTONES,
];

/// Key component separator; see [`check_key_component`].
const SEP: u8 = 0x00;

/// Reject an identifier that cannot be used as a key component.
///
/// Keys join components with NUL, so an ID containing NUL could alias
/// another account's or submission's prefix.
pub fn check_key_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidEntry(format!("{} must not be empty", field)));
    }
    if value.as_bytes().contains(&SEP) {
        return Err(Error::InvalidEntry(format!("{} must not contain NUL", field)));
    }
    Ok(())
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    /// Serializes expectation checks with the batch write
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened credit ledger store"
        );

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Cold, append-only history
            CF_ENTRIES | CF_TOMBSTONES => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
                opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Point lookups on every request
            CF_INDICES | CF_EMAILS | CF_PAYMENTS | CF_VOTES => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::StoreUnavailable(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn key_exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(cf)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    /// Start a transaction
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            storage: self,
            batch: WriteBatch::default(),
            checks: Vec::new(),
        }
    }

    // Ledger operations

    /// Append a single entry outside any projection update.
    ///
    /// Used for history imports; request paths stage entries in a transaction
    /// together with the account projection.
    pub fn append_entry(&self, entry: &LedgerEntry) -> Result<Uuid> {
        let mut tx = self.transaction();
        tx.append_entry(entry)?;
        tx.commit()?;
        Ok(entry.id)
    }

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>> {
        self.get_value(CF_ENTRIES, entry_id.as_bytes())
    }

    /// Entries of an account, newest first.
    ///
    /// `before` is an exclusive upper bound on the sequence number.
    pub fn list_entries(
        &self,
        account_id: &AccountId,
        limit: usize,
        before: Option<u64>,
    ) -> Result<Vec<LedgerEntry>> {
        if limit == 0 || before == Some(0) {
            return Ok(Vec::new());
        }

        let cf = self.cf_handle(CF_INDICES)?;
        let prefix = Self::ledger_prefix(account_id);
        let start = Self::ledger_key(account_id, before.map_or(u64::MAX, |seq| seq - 1));

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start.as_slice(), Direction::Reverse));

        let mut entries = Vec::with_capacity(limit);
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(self.entry_from_index(&value)?);
            if entries.len() == limit {
                break;
            }
        }

        Ok(entries)
    }

    /// Full history of an account, oldest first
    pub fn entries_in_order(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let prefix = Self::ledger_prefix(account_id);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(self.entry_from_index(&value)?);
        }

        Ok(entries)
    }

    fn entry_from_index(&self, value: &[u8]) -> Result<LedgerEntry> {
        let id_bytes: [u8; 16] = value
            .try_into()
            .map_err(|_| Error::StoreUnavailable("Corrupt ledger index value".to_string()))?;
        let entry_id = Uuid::from_bytes(id_bytes);
        self.get_entry(entry_id)?.ok_or_else(|| {
            Error::StoreUnavailable(format!("Indexed entry {} missing", entry_id))
        })
    }

    /// Entry that consumed a payment reference
    pub fn entry_for_external_reference(&self, reference: &str) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_PAYMENTS)?;
        match self.db.get_cf(cf, reference.as_bytes())? {
            Some(value) => {
                let id_bytes: [u8; 16] = value.as_slice().try_into().map_err(|_| {
                    Error::StoreUnavailable("Corrupt payment index value".to_string())
                })?;
                Ok(Some(Uuid::from_bytes(id_bytes)))
            }
            None => Ok(None),
        }
    }

    // Account operations

    /// Get account projection
    pub fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.get_value(CF_ACCOUNTS, account_id.as_str().as_bytes())
    }

    /// Accounts registered under an email (case-insensitive)
    pub fn accounts_by_email(&self, email: &str) -> Result<Vec<Account>> {
        let cf = self.cf_handle(CF_EMAILS)?;
        let mut prefix = normalize_email(email).into_bytes();
        prefix.push(SEP);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));

        let mut accounts = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let account_id = AccountId::new(String::from_utf8_lossy(&key[prefix.len()..]));
            if let Some(account) = self.get_account(&account_id)? {
                accounts.push(account);
            }
        }

        Ok(accounts)
    }

    /// Every live account ID
    pub fn account_ids(&self) -> Result<Vec<AccountId>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(AccountId::new(String::from_utf8_lossy(&key)));
        }
        Ok(ids)
    }

    /// Merge tombstone of an absorbed account
    pub fn get_tombstone(&self, account_id: &AccountId) -> Result<Option<Tombstone>> {
        self.get_value(CF_TOMBSTONES, account_id.as_str().as_bytes())
    }

    // Contest operations

    /// Contest activity of an account
    pub fn get_activity(
        &self,
        account_id: &AccountId,
        contest_id: &str,
    ) -> Result<Option<ContestActivity>> {
        self.get_value(CF_CONTESTS, &Self::pair_key(account_id.as_str(), contest_id))
    }

    /// Vote record of an account on a submission
    pub fn get_vote(
        &self,
        submission_id: &str,
        account_id: &AccountId,
    ) -> Result<Option<VoteRecord>> {
        self.get_value(CF_VOTES, &Self::pair_key(submission_id, account_id.as_str()))
    }

    /// Tally of a submission
    pub fn get_tally(&self, submission_id: &str) -> Result<Option<SubmissionTally>> {
        self.get_value(CF_TALLIES, submission_id.as_bytes())
    }

    // Key helpers

    fn ledger_prefix(account_id: &AccountId) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(SEP);
        key
    }

    fn ledger_key(account_id: &AccountId, sequence: u64) -> Vec<u8> {
        let mut key = Self::ledger_prefix(account_id);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn email_key(email: &str, account_id: &AccountId) -> Vec<u8> {
        Self::pair_key(&normalize_email(email), account_id.as_str())
    }

    fn pair_key(first: &str, second: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(first.len() + second.len() + 1);
        key.extend_from_slice(first.as_bytes());
        key.push(SEP);
        key.extend_from_slice(second.as_bytes());
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(self.cf_handle(CF_ACCOUNTS)?)?,
            total_entries: self.approximate_count(self.cf_handle(CF_ENTRIES)?)?,
            total_votes: self.approximate_count(self.cf_handle(CF_VOTES)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Approximate live accounts
    pub total_accounts: u64,
    /// Approximate ledger entries
    pub total_entries: u64,
    /// Approximate vote records
    pub total_votes: u64,
}

/// Staged expectation re-checked at commit
enum Check {
    /// Stored account version must equal `expected` (`None`: must not exist)
    AccountVersion {
        account_id: AccountId,
        expected: Option<u64>,
    },
    /// Unique key must not exist yet
    Absent {
        cf: &'static str,
        key: Vec<u8>,
        conflict: Conflict,
    },
}

/// Error reported when a unique key already exists
enum Conflict {
    ExternalReference(String),
    Vote {
        account_id: AccountId,
        submission_id: String,
    },
}

impl Conflict {
    fn into_error(self) -> Error {
        match self {
            Conflict::ExternalReference(reference) => Error::DuplicateExternalReference(reference),
            Conflict::Vote {
                account_id,
                submission_id,
            } => Error::AlreadyVoted {
                account_id,
                submission_id,
            },
        }
    }
}

/// All-or-nothing unit of work
pub struct Transaction<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
    checks: Vec<Check>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("writes", &self.batch.len())
            .field("checks", &self.checks.len())
            .finish()
    }
}

impl Transaction<'_> {
    fn put<T: serde::Serialize>(&mut self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.storage.cf_handle(cf)?;
        let value = bincode::serialize(value)?;
        self.batch.put_cf(cf, key, value);
        Ok(())
    }

    /// Write the account projection, conditioned on the version read earlier.
    ///
    /// `expected_version` is `None` when the account is being created.
    pub fn put_account(&mut self, account: &Account, expected_version: Option<u64>) -> Result<()> {
        self.put(CF_ACCOUNTS, account.id.as_str().as_bytes(), account)?;
        if expected_version.is_none() && !account.email.is_empty() {
            let cf = self.storage.cf_handle(CF_EMAILS)?;
            self.batch
                .put_cf(cf, Storage::email_key(&account.email, &account.id), b"");
        }
        self.checks.push(Check::AccountVersion {
            account_id: account.id.clone(),
            expected: expected_version,
        });
        Ok(())
    }

    /// Remove an account projection and its email index key
    pub fn delete_account(&mut self, account: &Account) -> Result<()> {
        let cf_accounts = self.storage.cf_handle(CF_ACCOUNTS)?;
        self.batch
            .delete_cf(cf_accounts, account.id.as_str().as_bytes());
        let cf_emails = self.storage.cf_handle(CF_EMAILS)?;
        self.batch
            .delete_cf(cf_emails, Storage::email_key(&account.email, &account.id));
        self.checks.push(Check::AccountVersion {
            account_id: account.id.clone(),
            expected: Some(account.version),
        });
        Ok(())
    }

    /// Append a ledger entry and its indices
    pub fn append_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.put(CF_ENTRIES, entry.id.as_bytes(), entry)?;

        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        self.batch.put_cf(
            cf_indices,
            Storage::ledger_key(&entry.account_id, entry.sequence),
            entry.id.as_bytes(),
        );

        if let Some(reference) = entry.metadata.external_reference() {
            let cf_payments = self.storage.cf_handle(CF_PAYMENTS)?;
            self.batch
                .put_cf(cf_payments, reference.as_bytes(), entry.id.as_bytes());
            self.checks.push(Check::Absent {
                cf: CF_PAYMENTS,
                key: reference.as_bytes().to_vec(),
                conflict: Conflict::ExternalReference(reference.to_string()),
            });
        }

        Ok(())
    }

    /// Write contest activity
    pub fn put_activity(&mut self, activity: &ContestActivity) -> Result<()> {
        let key = Storage::pair_key(activity.account_id.as_str(), &activity.contest_id);
        self.put(CF_CONTESTS, &key, activity)
    }

    /// Record a vote; fails at commit if the account already voted
    pub fn put_vote(&mut self, vote: &VoteRecord) -> Result<()> {
        let key = Storage::pair_key(&vote.submission_id, vote.account_id.as_str());
        self.put(CF_VOTES, &key, vote)?;
        self.checks.push(Check::Absent {
            cf: CF_VOTES,
            key,
            conflict: Conflict::Vote {
                account_id: vote.account_id.clone(),
                submission_id: vote.submission_id.clone(),
            },
        });
        Ok(())
    }

    /// Write a submission tally
    pub fn put_tally(&mut self, tally: &SubmissionTally) -> Result<()> {
        self.put(CF_TALLIES, tally.submission_id.as_bytes(), tally)
    }

    /// Write a merge tombstone
    pub fn put_tombstone(&mut self, tombstone: &Tombstone) -> Result<()> {
        self.put(
            CF_TOMBSTONES,
            tombstone.account_id.as_str().as_bytes(),
            tombstone,
        )
    }

    /// Re-check expectations and write the batch atomically
    pub fn commit(self) -> Result<()> {
        let Transaction {
            storage,
            batch,
            checks,
        } = self;

        let _guard = storage.commit_lock.lock();

        for check in checks {
            match check {
                Check::AccountVersion {
                    account_id,
                    expected,
                } => {
                    let current = storage.get_account(&account_id)?.map(|a| a.version);
                    if current != expected {
                        tracing::warn!(
                            account_id = %account_id,
                            expected = ?expected,
                            current = ?current,
                            "Account version changed before commit"
                        );
                        return Err(Error::ConcurrentModification(account_id));
                    }
                }
                Check::Absent { cf, key, conflict } => {
                    if storage.key_exists(cf, &key)? {
                        return Err(conflict.into_error());
                    }
                }
            }
        }

        storage.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BonusReason, EntryMetadata, SpendTarget, VoteTier};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn test_account(id: &str, email: &str) -> Account {
        Account {
            id: AccountId::new(id),
            email: email.to_string(),
            display_name: None,
            balance: 0,
            entitlements: BTreeSet::new(),
            stats: Default::default(),
            version: 0,
            next_sequence: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_entry(account: &str, sequence: u64, amount: i64) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::now_v7(),
            account_id: AccountId::new(account),
            sequence,
            amount,
            balance_after: amount,
            metadata: EntryMetadata::Bonus(BonusReason::Welcome),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for name in COLUMN_FAMILIES {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_append_and_get_entry() {
        let (storage, _temp) = test_storage();
        let entry = test_entry("user-1", 0, 100);

        let id = storage.append_entry(&entry).unwrap();
        assert_eq!(id, entry.id);

        let retrieved = storage.get_entry(id).unwrap().unwrap();
        assert_eq!(retrieved, entry);
    }

    #[test]
    fn test_list_entries_pagination() {
        let (storage, _temp) = test_storage();
        for seq in 0..5 {
            storage.append_entry(&test_entry("user-1", seq, 10)).unwrap();
        }
        // Neighbouring account must not leak into the scan
        storage.append_entry(&test_entry("user-10", 0, 10)).unwrap();

        let first = storage.list_entries(&AccountId::new("user-1"), 2, None).unwrap();
        assert_eq!(
            first.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![4, 3]
        );

        let second = storage
            .list_entries(&AccountId::new("user-1"), 10, Some(3))
            .unwrap();
        assert_eq!(
            second.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );

        let ordered = storage.entries_in_order(&AccountId::new("user-1")).unwrap();
        assert_eq!(ordered.len(), 5);
        assert_eq!(ordered[0].sequence, 0);
    }

    #[test]
    fn test_key_component_rejects_separator() {
        assert!(check_key_component("contest_id", "summer-2024").is_ok());
        assert!(matches!(
            check_key_component("contest_id", ""),
            Err(Error::InvalidEntry(_))
        ));
        assert!(matches!(
            check_key_component("submission_id", "sub\0victim"),
            Err(Error::InvalidEntry(_))
        ));
    }

    #[test]
    fn test_stats_count_accounts_and_entries() {
        let (storage, _temp) = test_storage();
        let mut tx = storage.transaction();
        tx.put_account(&test_account("user-1", "a@example.com"), None)
            .unwrap();
        tx.commit().unwrap();
        for seq in 0..3 {
            storage.append_entry(&test_entry("user-1", seq, 10)).unwrap();
        }
        for name in [CF_ACCOUNTS, CF_ENTRIES] {
            storage.db.flush_cf(storage.cf_handle(name).unwrap()).unwrap();
        }

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_accounts, 1);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.total_votes, 0);
    }

    #[test]
    fn test_account_version_check() {
        let (storage, _temp) = test_storage();
        let mut account = test_account("user-1", "A@example.com");

        let mut tx = storage.transaction();
        tx.put_account(&account, None).unwrap();
        tx.commit().unwrap();

        // Creating again must fail
        let mut tx = storage.transaction();
        tx.put_account(&account, None).unwrap();
        assert!(matches!(
            tx.commit(),
            Err(Error::ConcurrentModification(_))
        ));

        // Stale version must fail
        account.version = 1;
        let mut tx = storage.transaction();
        tx.put_account(&account, Some(7)).unwrap();
        assert!(matches!(
            tx.commit(),
            Err(Error::ConcurrentModification(_))
        ));

        let mut tx = storage.transaction();
        tx.put_account(&account, Some(0)).unwrap();
        tx.commit().unwrap();
        assert_eq!(
            storage.get_account(&account.id).unwrap().unwrap().version,
            1
        );
    }

    #[test]
    fn test_email_index() {
        let (storage, _temp) = test_storage();
        for (id, email) in [("a", "dup@example.com"), ("b", "DUP@example.com"), ("c", "other@example.com")] {
            let mut tx = storage.transaction();
            tx.put_account(&test_account(id, email), None).unwrap();
            tx.commit().unwrap();
        }

        let dups = storage.accounts_by_email("dup@example.com").unwrap();
        assert_eq!(dups.len(), 2);

        let account = storage.get_account(&AccountId::new("a")).unwrap().unwrap();
        let mut tx = storage.transaction();
        tx.delete_account(&account).unwrap();
        tx.commit().unwrap();

        assert_eq!(storage.accounts_by_email("dup@example.com").unwrap().len(), 1);
        assert_eq!(storage.account_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_external_reference_rejected() {
        let (storage, _temp) = test_storage();
        let purchase = |seq| LedgerEntry {
            metadata: EntryMetadata::Purchase {
                package_id: "starter".to_string(),
                external_reference: "pi_123".to_string(),
                amount_paid: Decimal::new(499, 2),
                currency: "USD".to_string(),
            },
            ..test_entry("user-1", seq, 300)
        };

        storage.append_entry(&purchase(0)).unwrap();
        assert!(matches!(
            storage.append_entry(&purchase(1)),
            Err(Error::DuplicateExternalReference(_))
        ));
        assert!(storage.entry_for_external_reference("pi_123").unwrap().is_some());
        assert_eq!(storage.entries_in_order(&AccountId::new("user-1")).unwrap().len(), 1);
    }

    #[test]
    fn test_vote_uniqueness() {
        let (storage, _temp) = test_storage();
        let vote = VoteRecord {
            account_id: AccountId::new("user-1"),
            contest_id: "c1".to_string(),
            submission_id: "s1".to_string(),
            tier: VoteTier::Free,
            weight: 1,
            cast_at: Utc::now(),
        };

        let mut tx = storage.transaction();
        tx.put_vote(&vote).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.transaction();
        tx.put_vote(&vote).unwrap();
        assert!(matches!(tx.commit(), Err(Error::AlreadyVoted { .. })));
        assert!(storage.get_vote("s1", &AccountId::new("user-1")).unwrap().is_some());
    }

    #[test]
    fn test_failed_commit_writes_nothing() {
        let (storage, _temp) = test_storage();
        let account = test_account("user-1", "a@example.com");
        let entry = LedgerEntry {
            metadata: EntryMetadata::Spend(SpendTarget::Episode(crate::types::Entitlement::new(
                "s", 1,
            ))),
            ..test_entry("user-1", 0, -10)
        };

        let mut tx = storage.transaction();
        tx.append_entry(&entry).unwrap();
        tx.put_account(&account, Some(3)).unwrap();
        assert!(tx.commit().is_err());

        assert!(storage.get_entry(entry.id).unwrap().is_none());
        assert!(storage.get_account(&account.id).unwrap().is_none());
    }
}
