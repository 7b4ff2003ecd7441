//! Episode unlocks
//!
//! Unlocking is idempotent: asking for an episode the account already owns
//! succeeds without a second debit.

use crate::{
    engine::BalanceEngine,
    notify::{Notification, NotificationHandle},
    types::{AccountId, Entitlement, EntryMetadata, SpendTarget},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of an unlock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementResult {
    /// Requesting account
    pub account_id: AccountId,
    /// Requested episode
    pub entitlement: Entitlement,
    /// False when the account already owned the episode
    pub newly_unlocked: bool,
    /// Balance after the request
    pub balance: i64,
    /// Spend entry, present only for a fresh unlock
    pub entry_id: Option<Uuid>,
}

/// Unlocks episodes against the balance engine
#[derive(Debug, Clone)]
pub struct EntitlementService {
    engine: Arc<BalanceEngine>,
    notifier: NotificationHandle,
}

impl EntitlementService {
    /// Create service
    pub fn new(engine: Arc<BalanceEngine>, notifier: NotificationHandle) -> Self {
        Self { engine, notifier }
    }

    /// Unlock an episode for `cost` credits
    pub async fn unlock_episode(
        &self,
        account_id: &AccountId,
        series_id: &str,
        episode_number: u32,
        cost: i64,
    ) -> Result<EntitlementResult> {
        if cost < 0 {
            return Err(Error::InvalidEntry("unlock cost must not be negative".into()));
        }
        let entitlement = Entitlement::new(series_id, episode_number);

        let metadata = EntryMetadata::Spend(SpendTarget::Episode(entitlement.clone()));
        match self.engine.apply_entry(account_id, -cost, metadata).await {
            Ok(applied) => {
                let account_id = applied.entry.account_id.clone();
                self.engine.metrics().record_unlock();
                self.notifier.notify(Notification::EpisodeUnlocked {
                    account_id: account_id.clone(),
                    entitlement: entitlement.clone(),
                    cost,
                    entry_id: applied.entry_id,
                });
                Ok(EntitlementResult {
                    account_id,
                    entitlement,
                    newly_unlocked: true,
                    balance: applied.new_balance,
                    entry_id: Some(applied.entry_id),
                })
            }
            Err(Error::AlreadyUnlocked(_)) => {
                let account = self.engine.live_account(account_id)?;
                tracing::debug!(
                    account_id = %account.id,
                    entitlement = %entitlement,
                    "Episode already unlocked"
                );
                Ok(EntitlementResult {
                    account_id: account.id,
                    entitlement,
                    newly_unlocked: false,
                    balance: account.balance,
                    entry_id: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the account may watch the episode; unknown accounts own nothing
    pub fn has_access(
        &self,
        account_id: &AccountId,
        series_id: &str,
        episode_number: u32,
    ) -> Result<bool> {
        let entitlement = Entitlement::new(series_id, episode_number);
        match self.engine.live_account(account_id) {
            Ok(account) => Ok(account.has_entitlement(&entitlement)),
            Err(Error::AccountNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Everything the account has unlocked
    pub fn entitlements(&self, account_id: &AccountId) -> Result<Vec<Entitlement>> {
        Ok(self
            .engine
            .live_account(account_id)?
            .entitlements
            .into_iter()
            .collect())
    }
}
