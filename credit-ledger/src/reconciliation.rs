//! Ledger reconciliation
//!
//! Recomputes an account from its ledger and compares the result with the
//! cached projection. Reconciling is read-only; repairing is an explicit,
//! administrator-triggered step that appends a correcting entry.
//!
//! # Legacy accounts
//!
//! Accounts opened before the welcome bonus was recorded as an entry have no
//! `Bonus(Welcome)` entry. For those the fold starts at the configured bonus
//! instead of zero.

use crate::{
    engine::{AppliedEntry, BalanceEngine},
    identity::AdminContext,
    locks::LockKey,
    types::{AccountId, AdjustmentReason, Entitlement, EntryMetadata},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Reconciliation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    /// Projection matches the ledger
    Balanced,
    /// Balance or entitlements drifted
    Discrepancy,
}

/// Comparison of one account's projection with its ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Account
    pub account_id: AccountId,
    /// Balance recomputed from the ledger
    pub calculated_balance: i64,
    /// Cached balance
    pub actual_balance: i64,
    /// `actual_balance - calculated_balance`
    pub discrepancy: i64,
    /// Entitlements evidenced by the ledger but absent from the projection
    pub missing_entitlements: Vec<Entitlement>,
    /// Entitlements in the projection without ledger evidence
    pub extra_entitlements: Vec<Entitlement>,
    /// Sequences whose recorded `balance_after` disagrees with the running sum
    pub snapshot_breaks: Vec<u64>,
    /// Entries folded
    pub entry_count: usize,
    /// Projection version the report was computed against
    pub account_version: u64,
    /// Outcome
    pub status: ReconciliationStatus,
}

impl ReconciliationReport {
    /// Whether nothing needs repair
    pub fn is_balanced(&self) -> bool {
        self.status == ReconciliationStatus::Balanced
    }
}

/// Account that could not be reconciled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    /// Account
    pub account_id: AccountId,
    /// Error message
    pub error: String,
}

/// Result of reconciling every account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    /// Accounts examined
    pub total_accounts: usize,
    /// Accounts without drift
    pub balanced_accounts: usize,
    /// Accounts with drift
    pub discrepancy_accounts: usize,
    /// Sum of absolute balance discrepancies
    pub total_discrepancy: i64,
    /// Reports of drifted accounts
    pub discrepancies: Vec<ReconciliationReport>,
    /// Accounts whose reconciliation errored
    pub failures: Vec<ReconciliationFailure>,
}

/// Compares projections with their ledgers and repairs drift
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    engine: Arc<BalanceEngine>,
}

impl ReconciliationEngine {
    /// Create engine
    pub fn new(engine: Arc<BalanceEngine>) -> Self {
        Self { engine }
    }

    /// Recompute one account from its ledger
    pub fn reconcile(&self, account_id: &AccountId) -> Result<ReconciliationReport> {
        let report = self.compute(account_id)?;
        if !report.is_balanced() {
            self.engine.metrics().record_discrepancy();
            tracing::warn!(
                account_id = %account_id,
                calculated = report.calculated_balance,
                actual = report.actual_balance,
                discrepancy = report.discrepancy,
                missing = report.missing_entitlements.len(),
                extra = report.extra_entitlements.len(),
                "Ledger discrepancy detected"
            );
        } else {
            tracing::debug!(account_id = %account_id, "Account balanced");
        }
        Ok(report)
    }

    fn compute(&self, account_id: &AccountId) -> Result<ReconciliationReport> {
        let account = self.engine.account(account_id)?;
        let entries = self.engine.storage().entries_in_order(account_id)?;

        // Entries committed after the projection was read are not part of it
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.sequence < account.next_sequence)
            .collect();

        let mut calculated = if entries.iter().any(|e| e.metadata.is_welcome_bonus()) {
            0
        } else {
            self.engine.policy().welcome_bonus
        };

        let mut evidenced = BTreeSet::new();
        let mut snapshot_breaks = Vec::new();
        for entry in &entries {
            calculated += entry.amount;
            if entry.balance_after != calculated {
                snapshot_breaks.push(entry.sequence);
            }
            match &entry.metadata {
                EntryMetadata::AdminAdjustment { reason, .. } => {
                    evidenced.extend(reason.granted_entitlements().iter().cloned());
                }
                metadata => {
                    if let Some(entitlement) = metadata.unlocked_episode() {
                        evidenced.insert(entitlement.clone());
                    }
                }
            }
        }

        let missing_entitlements: Vec<_> =
            evidenced.difference(&account.entitlements).cloned().collect();
        let extra_entitlements: Vec<_> =
            account.entitlements.difference(&evidenced).cloned().collect();
        let discrepancy = account.balance - calculated;

        let status = if discrepancy == 0
            && missing_entitlements.is_empty()
            && extra_entitlements.is_empty()
        {
            ReconciliationStatus::Balanced
        } else {
            ReconciliationStatus::Discrepancy
        };

        Ok(ReconciliationReport {
            account_id: account_id.clone(),
            calculated_balance: calculated,
            actual_balance: account.balance,
            discrepancy,
            missing_entitlements,
            extra_entitlements,
            snapshot_breaks,
            entry_count: entries.len(),
            account_version: account.version,
            status,
        })
    }

    /// Align the ledger with the projection described by `report`.
    ///
    /// Returns `None` when the account is already balanced. Fails with
    /// `ConcurrentModification` if the account changed since `report` was
    /// produced.
    pub async fn repair(
        &self,
        admin: &AdminContext,
        account_id: &AccountId,
        report: &ReconciliationReport,
    ) -> Result<Option<AppliedEntry>> {
        if &report.account_id != account_id {
            return Err(Error::InvalidEntry(format!(
                "report is for {}, not {}",
                report.account_id, account_id
            )));
        }

        let _guard = self
            .engine
            .locks()
            .lock(LockKey::Account(account_id.clone()))
            .await;

        let fresh = self.compute(account_id)?;
        if &fresh != report {
            tracing::warn!(
                account_id = %account_id,
                reported_version = report.account_version,
                current_version = fresh.account_version,
                "Repair refused: stale report"
            );
            return Err(Error::ConcurrentModification(account_id.clone()));
        }
        if fresh.is_balanced() {
            return Ok(None);
        }

        let mut account = self.engine.account(account_id)?;
        for entitlement in &fresh.missing_entitlements {
            if account.entitlements.insert(entitlement.clone()) {
                account.stats.episodes_unlocked += 1;
            }
        }

        let metadata = EntryMetadata::AdminAdjustment {
            acting_admin_id: admin.admin_id().to_string(),
            reason: AdjustmentReason::Repair {
                calculated_balance: fresh.calculated_balance,
                cached_balance: fresh.actual_balance,
                granted_entitlements: fresh.extra_entitlements.clone(),
            },
        };

        let mut tx = self.engine.storage().transaction();
        let entry =
            self.engine
                .stage_correction(&mut tx, &mut account, fresh.discrepancy, metadata)?;
        self.engine.commit(tx, std::slice::from_ref(&entry))?;

        tracing::info!(
            account_id = %account_id,
            entry_id = %entry.id,
            admin_id = %admin.admin_id(),
            amount = entry.amount,
            restored = fresh.missing_entitlements.len(),
            legitimized = fresh.extra_entitlements.len(),
            "Repaired account"
        );

        Ok(Some(entry.into()))
    }

    /// Reconcile every live account
    pub fn reconcile_all(&self) -> Result<ReconciliationSummary> {
        tracing::info!("Starting reconciliation for all accounts");

        let mut summary = ReconciliationSummary::default();
        for account_id in self.engine.storage().account_ids()? {
            summary.total_accounts += 1;
            match self.reconcile(&account_id) {
                Ok(report) if report.is_balanced() => summary.balanced_accounts += 1,
                Ok(report) => {
                    summary.discrepancy_accounts += 1;
                    summary.total_discrepancy += report.discrepancy.abs();
                    summary.discrepancies.push(report);
                }
                Err(e) => {
                    tracing::error!(account_id = %account_id, error = %e, "Reconciliation failed");
                    summary.failures.push(ReconciliationFailure {
                        account_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            total = summary.total_accounts,
            balanced = summary.balanced_accounts,
            discrepancies = summary.discrepancy_accounts,
            failures = summary.failures.len(),
            "Reconciliation complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::locks::KeyedLocks;
    use crate::metrics::Metrics;
    use crate::storage::Storage;
    use crate::types::{Account, SpendTarget};
    use crate::Config;
    use tempfile::TempDir;

    async fn setup() -> (ReconciliationEngine, Arc<BalanceEngine>, AccountId, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let engine = Arc::new(BalanceEngine::new(
            Arc::new(Storage::open(&config).unwrap()),
            Arc::new(KeyedLocks::new()),
            Metrics::new().unwrap(),
            config.ledger.clone(),
        ));
        let account = engine
            .open_account(&Identity {
                account_id: AccountId::new("user-1"),
                email: None,
                display_name: None,
                roles: Vec::new(),
                is_admin: false,
            })
            .await
            .unwrap();
        (
            ReconciliationEngine::new(engine.clone()),
            engine,
            account.id,
            temp_dir,
        )
    }

    /// Overwrite the projection without a ledger entry
    fn tamper(engine: &BalanceEngine, id: &AccountId, edit: impl FnOnce(&mut Account)) {
        let mut account = engine.account(id).unwrap();
        let expected = account.version;
        edit(&mut account);
        account.version += 1;
        let mut tx = engine.storage().transaction();
        tx.put_account(&account, Some(expected)).unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_fresh_account_is_balanced() {
        let (recon, _engine, id, _temp) = setup().await;
        let report = recon.reconcile(&id).unwrap();
        assert!(report.is_balanced());
        assert_eq!(report.calculated_balance, 100);
        assert_eq!(report.entry_count, 1);
        assert!(report.snapshot_breaks.is_empty());
    }

    #[tokio::test]
    async fn test_balance_drift_and_repair() {
        let (recon, engine, id, _temp) = setup().await;
        tamper(&engine, &id, |a| a.balance = 130);

        let report = recon.reconcile(&id).unwrap();
        assert_eq!(report.status, ReconciliationStatus::Discrepancy);
        assert_eq!(report.calculated_balance, 100);
        assert_eq!(report.actual_balance, 130);
        assert_eq!(report.discrepancy, 30);
        assert_eq!(engine.metrics().discrepancies_total.get(), 1);

        let admin = AdminContext::new("ops");
        let applied = recon.repair(&admin, &id, &report).await.unwrap().unwrap();
        assert_eq!(applied.entry.amount, 30);
        assert_eq!(applied.new_balance, 130);

        let after = recon.reconcile(&id).unwrap();
        assert!(after.is_balanced());
        assert_eq!(after.calculated_balance, 130);

        // Second repair of a clean account is a no-op
        assert!(recon.repair(&admin, &id, &after).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entitlement_drift_repair() {
        let (recon, engine, id, _temp) = setup().await;
        engine
            .apply_entry(
                &id,
                -30,
                EntryMetadata::Spend(SpendTarget::Episode(Entitlement::new("s", 1))),
            )
            .await
            .unwrap();
        tamper(&engine, &id, |a| {
            a.entitlements.remove(&Entitlement::new("s", 1));
            a.entitlements.insert(Entitlement::new("s", 9));
        });

        let report = recon.reconcile(&id).unwrap();
        assert_eq!(report.discrepancy, 0);
        assert_eq!(report.missing_entitlements, vec![Entitlement::new("s", 1)]);
        assert_eq!(report.extra_entitlements, vec![Entitlement::new("s", 9)]);

        let applied = recon
            .repair(&AdminContext::new("ops"), &id, &report)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied.entry.amount, 0);

        let account = engine.account(&id).unwrap();
        assert!(account.has_entitlement(&Entitlement::new("s", 1)));
        assert!(account.has_entitlement(&Entitlement::new("s", 9)));
        assert!(recon.reconcile(&id).unwrap().is_balanced());
    }

    #[tokio::test]
    async fn test_stale_report_refused() {
        let (recon, engine, id, _temp) = setup().await;
        tamper(&engine, &id, |a| a.balance = 90);
        let report = recon.reconcile(&id).unwrap();

        engine
            .apply_entry(
                &id,
                -10,
                EntryMetadata::Spend(SpendTarget::Episode(Entitlement::new("s", 2))),
            )
            .await
            .unwrap();

        assert!(matches!(
            recon.repair(&AdminContext::new("ops"), &id, &report).await,
            Err(Error::ConcurrentModification(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_all() {
        let (recon, engine, id, _temp) = setup().await;
        engine
            .open_account(&Identity {
                account_id: AccountId::new("user-2"),
                email: None,
                display_name: None,
                roles: Vec::new(),
                is_admin: false,
            })
            .await
            .unwrap();
        tamper(&engine, &id, |a| a.balance = 60);

        let summary = recon.reconcile_all().unwrap();
        assert_eq!(summary.total_accounts, 2);
        assert_eq!(summary.balanced_accounts, 1);
        assert_eq!(summary.discrepancy_accounts, 1);
        assert_eq!(summary.total_discrepancy, 40);
        assert!(summary.failures.is_empty());
    }
}
