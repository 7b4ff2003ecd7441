//! Duplicate account consolidation
//!
//! Accounts sharing an email are folded into one survivor. The survivor keeps
//! the union of entitlements and the largest balance (never the sum). Absorbed
//! accounts lose their projection and email index key and gain a tombstone;
//! their ledger entries stay readable under the original ID.

use crate::{
    engine::BalanceEngine,
    identity::AdminContext,
    types::{Account, AccountId, AdjustmentReason, Entitlement, EntryMetadata, Tombstone},
    Error, Result,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Result of a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Surviving account
    pub primary: AccountId,
    /// Accounts folded into the primary
    pub absorbed: Vec<AccountId>,
    /// Primary balance before the merge
    pub balance_before: i64,
    /// Primary balance after the merge
    pub balance_after: i64,
    /// Entitlements the primary gained
    pub entitlements_added: Vec<Entitlement>,
    /// Adjustment entry on the primary; `None` when nothing was merged
    pub entry_id: Option<Uuid>,
}

/// Merges accounts registered under the same email
#[derive(Debug, Clone)]
pub struct DuplicateMerger {
    engine: Arc<BalanceEngine>,
}

impl DuplicateMerger {
    /// Create merger
    pub fn new(engine: Arc<BalanceEngine>) -> Self {
        Self { engine }
    }

    /// Candidates ordered best first: highest score, then earliest creation
    fn rank(&self, accounts: &mut [Account]) {
        let weight = self.engine.policy().merge_entitlement_weight;
        accounts.sort_by(|a, b| {
            let key = |acc: &Account| (acc.merge_score(weight), Reverse(acc.created_at));
            key(b)
                .cmp(&key(a))
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    /// Fold every account registered under `email` into one
    pub async fn merge_by_email(&self, admin: &AdminContext, email: &str) -> Result<MergeReport> {
        let candidates = self.engine.accounts_by_email(email)?;
        if candidates.is_empty() {
            return Err(Error::NoDuplicatesFound(email.to_string()));
        }

        let ids: Vec<AccountId> = candidates.iter().map(|a| a.id.clone()).collect();
        let _guards = self.engine.locks().lock_accounts(&ids).await;

        // Re-read under the locks; a concurrent merge may have absorbed some
        let mut accounts = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(account) = self.engine.storage().get_account(id)? {
                accounts.push(account);
            }
        }
        if accounts.is_empty() {
            return Err(Error::NoDuplicatesFound(email.to_string()));
        }

        self.rank(&mut accounts);
        let mut accounts = accounts.into_iter();
        let Some(mut primary) = accounts.next() else {
            return Err(Error::NoDuplicatesFound(email.to_string()));
        };
        let absorbed: Vec<Account> = accounts.collect();

        let balance_before = primary.balance;
        if absorbed.is_empty() {
            tracing::debug!(account_id = %primary.id, "No duplicates to merge");
            return Ok(MergeReport {
                primary: primary.id,
                absorbed: Vec::new(),
                balance_before,
                balance_after: balance_before,
                entitlements_added: Vec::new(),
                entry_id: None,
            });
        }

        let max_balance = absorbed
            .iter()
            .map(|a| a.balance)
            .fold(primary.balance, i64::max);
        let granted: BTreeSet<Entitlement> = absorbed
            .iter()
            .flat_map(|a| a.entitlements.iter())
            .filter(|e| !primary.has_entitlement(e))
            .cloned()
            .collect();
        let absorbed_ids: Vec<AccountId> = absorbed.iter().map(|a| a.id.clone()).collect();

        let metadata = EntryMetadata::AdminAdjustment {
            acting_admin_id: admin.admin_id().to_string(),
            reason: AdjustmentReason::Merge {
                absorbed_accounts: absorbed_ids.clone(),
                granted_entitlements: granted.iter().cloned().collect(),
            },
        };

        let mut tx = self.engine.storage().transaction();
        let entry = self.engine.stage_entry(
            &mut tx,
            &mut primary,
            max_balance - balance_before,
            metadata,
        )?;

        let merged_at = Utc::now();
        for account in &absorbed {
            tx.delete_account(account)?;
            tx.put_tombstone(&Tombstone {
                account_id: account.id.clone(),
                merged_into: primary.id.clone(),
                acting_admin_id: admin.admin_id().to_string(),
                merged_at,
            })?;
        }
        self.engine.commit(tx, std::slice::from_ref(&entry))?;

        tracing::info!(
            primary = %primary.id,
            absorbed = absorbed_ids.len(),
            admin_id = %admin.admin_id(),
            balance_before,
            balance_after = primary.balance,
            entitlements_added = granted.len(),
            "Merged duplicate accounts"
        );

        Ok(MergeReport {
            primary: primary.id,
            absorbed: absorbed_ids,
            balance_before,
            balance_after: entry.balance_after,
            entitlements_added: granted.into_iter().collect(),
            entry_id: Some(entry.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::locks::KeyedLocks;
    use crate::metrics::Metrics;
    use crate::storage::Storage;
    use crate::types::SpendTarget;
    use crate::Config;
    use tempfile::TempDir;

    fn test_engine() -> (Arc<BalanceEngine>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let engine = Arc::new(BalanceEngine::new(
            Arc::new(Storage::open(&config).unwrap()),
            Arc::new(KeyedLocks::new()),
            Metrics::new().unwrap(),
            config.ledger.clone(),
        ));
        (engine, temp_dir)
    }

    async fn open(engine: &BalanceEngine, sub: &str, email: &str) -> AccountId {
        engine
            .open_account(&Identity {
                account_id: AccountId::new(sub),
                email: Some(email.to_string()),
                display_name: None,
                roles: Vec::new(),
                is_admin: false,
            })
            .await
            .unwrap()
            .id
    }

    async fn unlock(engine: &BalanceEngine, id: &AccountId, series: &str, ep: u32, cost: i64) {
        engine
            .apply_entry(
                id,
                -cost,
                EntryMetadata::Spend(SpendTarget::Episode(Entitlement::new(series, ep))),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_merge_takes_union_and_max() {
        let (engine, _temp) = test_engine();
        let a = open(&engine, "a", "dup@example.com").await;
        let b = open(&engine, "b", "DUP@example.com").await;

        // a: 40 credits, 2 episodes (score 140); b: 90 credits, 1 episode (score 140)
        unlock(&engine, &a, "s", 1, 30).await;
        unlock(&engine, &a, "s", 2, 30).await;
        unlock(&engine, &b, "s", 3, 10).await;

        let report = DuplicateMerger::new(engine.clone())
            .merge_by_email(&AdminContext::new("ops"), "dup@example.com")
            .await
            .unwrap();

        // Tie on score goes to the earlier account
        assert_eq!(report.primary, a);
        assert_eq!(report.absorbed, vec![b.clone()]);
        assert_eq!(report.balance_before, 40);
        assert_eq!(report.balance_after, 90);
        assert_eq!(report.entitlements_added, vec![Entitlement::new("s", 3)]);

        let primary = engine.account(&a).unwrap();
        assert_eq!(primary.balance, 90);
        assert_eq!(primary.entitlements.len(), 3);

        assert!(matches!(engine.account(&b), Err(Error::AccountNotFound(_))));
        let tombstone = engine.storage().get_tombstone(&b).unwrap().unwrap();
        assert_eq!(tombstone.merged_into, a);

        // Absorbed history stays readable
        let history = engine.list_entries(&b, None, None).unwrap();
        assert_eq!(history.entries.len(), 2);
        assert_eq!(engine.accounts_by_email("dup@example.com").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_absorbed_subject_resolves_to_primary() {
        let (engine, _temp) = test_engine();
        let a = open(&engine, "a", "dup@example.com").await;
        let _b = open(&engine, "b", "dup@example.com").await;
        unlock(&engine, &a, "s", 1, 10).await;

        let report = DuplicateMerger::new(engine.clone())
            .merge_by_email(&AdminContext::new("ops"), "dup@example.com")
            .await
            .unwrap();
        assert_eq!(report.primary, a);

        let reopened = open(&engine, "b", "dup@example.com").await;
        assert_eq!(reopened, a);
    }

    #[tokio::test]
    async fn test_merge_of_many_duplicates() {
        let (engine, _temp) = test_engine();
        let email = "many@example.com";
        let p = open(&engine, "p", email).await;
        let q = open(&engine, "q", email).await;
        let r = open(&engine, "r", email).await;
        let s = open(&engine, "s", email).await;

        // p: 60 + 2 eps (160); q: 90 + 2 eps (190); r: 99 + 1 ep (149); s: 100 (100)
        unlock(&engine, &p, "s", 1, 20).await;
        unlock(&engine, &p, "s", 2, 20).await;
        unlock(&engine, &q, "s", 2, 5).await;
        unlock(&engine, &q, "s", 3, 5).await;
        unlock(&engine, &r, "s", 4, 1).await;

        let report = DuplicateMerger::new(engine.clone())
            .merge_by_email(&AdminContext::new("ops"), email)
            .await
            .unwrap();

        assert_eq!(report.primary, q);
        let mut absorbed = report.absorbed.clone();
        absorbed.sort();
        assert_eq!(absorbed, vec![p.clone(), r.clone(), s.clone()]);
        assert_eq!(report.balance_before, 90);
        assert_eq!(report.balance_after, 100);
        assert_eq!(
            report.entitlements_added,
            vec![Entitlement::new("s", 1), Entitlement::new("s", 4)]
        );

        let primary = engine.account(&q).unwrap();
        assert_eq!(primary.balance, 100);
        assert_eq!(
            primary.entitlements.iter().cloned().collect::<Vec<_>>(),
            (1..=4).map(|ep| Entitlement::new("s", ep)).collect::<Vec<_>>()
        );
        for id in [&p, &r, &s] {
            assert!(engine.storage().get_account(id).unwrap().is_none());
            assert_eq!(engine.resolve_account_id(id).unwrap(), q);
        }
        assert_eq!(engine.accounts_by_email(email).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_merge_carries_earlier_absorptions() {
        let (engine, _temp) = test_engine();
        let merger = DuplicateMerger::new(engine.clone());
        let email = "chain@example.com";

        // a: 90 + 1 ep (140) absorbs b: 100 (100); a ends at 100 credits
        let a = open(&engine, "a", email).await;
        let b = open(&engine, "b", email).await;
        unlock(&engine, &a, "s", 1, 10).await;
        let first = merger
            .merge_by_email(&AdminContext::new("ops"), email)
            .await
            .unwrap();
        assert_eq!((first.primary.clone(), first.absorbed), (a.clone(), vec![b.clone()]));

        // c: 98 + 2 eps (198) beats a: 100 + 1 ep (150)
        let c = open(&engine, "c", email).await;
        unlock(&engine, &c, "s", 2, 1).await;
        unlock(&engine, &c, "s", 3, 1).await;
        let second = merger
            .merge_by_email(&AdminContext::new("ops"), email)
            .await
            .unwrap();
        assert_eq!(second.primary, c);
        assert_eq!(second.absorbed, vec![a.clone()]);
        assert_eq!(second.balance_after, 100);

        // b's subject follows b -> a -> c
        let reopened = open(&engine, "b", email).await;
        assert_eq!(reopened, c);
        let applied = engine
            .apply_entry(
                &b,
                -5,
                EntryMetadata::Spend(SpendTarget::Episode(Entitlement::new("s", 9))),
            )
            .await
            .unwrap();
        assert_eq!(applied.entry.account_id, c);
        assert_eq!(engine.account(&c).unwrap().entitlements.len(), 4);
    }

    #[tokio::test]
    async fn test_single_account_is_noop() {
        let (engine, _temp) = test_engine();
        let a = open(&engine, "a", "solo@example.com").await;

        let report = DuplicateMerger::new(engine.clone())
            .merge_by_email(&AdminContext::new("ops"), "solo@example.com")
            .await
            .unwrap();
        assert_eq!(report.primary, a);
        assert!(report.absorbed.is_empty());
        assert_eq!(report.entry_id, None);
        assert_eq!(engine.account(&a).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_unknown_email() {
        let (engine, _temp) = test_engine();
        assert!(matches!(
            DuplicateMerger::new(engine)
                .merge_by_email(&AdminContext::new("ops"), "nobody@example.com")
                .await,
            Err(Error::NoDuplicatesFound(_))
        ));
    }
}
