//! Contest voting
//!
//! Every account gets one free vote per account-local calendar day and can buy
//! premium/super votes with credits. Each account votes at most once per
//! submission; a vote adds its tier weight to the submission's tally.
//!
//! Lock order: account → contest activity → submission.

use crate::{
    config::ContestConfig,
    engine::{AppliedEntry, BalanceEngine},
    locks::LockKey,
    storage::check_key_component,
    types::{
        AccountId, ContestActivity, EntryMetadata, SpendTarget, SubmissionTally, TierCounts,
        VoteRecord, VoteTier,
    },
    Error, Result,
};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    /// Move forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Jump to an instant
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Result of a daily claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyClaim {
    /// Free votes granted by this claim
    pub votes_granted: u32,
    /// Whether the streak bonus was included
    pub streak_bonus: bool,
    /// Activity after the claim
    pub activity: ContestActivity,
}

/// Result of a package purchase
#[derive(Debug, Clone)]
pub struct PackagePurchase {
    /// Spend entry
    pub applied: AppliedEntry,
    /// Activity after the purchase
    pub activity: ContestActivity,
}

/// Result of a cast vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    /// Recorded vote
    pub vote: VoteRecord,
    /// Submission tally after the vote
    pub tally: SubmissionTally,
    /// Votes the account has left in the contest
    pub votes_remaining: TierCounts,
}

/// Per-contest vote accounting
#[derive(Debug, Clone)]
pub struct ContestVoteLedger {
    engine: Arc<BalanceEngine>,
    config: ContestConfig,
    clock: Arc<dyn Clock>,
}

impl ContestVoteLedger {
    /// Create ledger
    pub fn new(engine: Arc<BalanceEngine>, config: ContestConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            config,
            clock,
        }
    }

    fn load_activity(&self, account_id: &AccountId, contest_id: &str) -> Result<ContestActivity> {
        Ok(self
            .engine
            .storage()
            .get_activity(account_id, contest_id)?
            .unwrap_or_else(|| ContestActivity::new(account_id.clone(), contest_id)))
    }

    fn reject(&self, account_id: &AccountId, contest_id: &str, err: Error) -> Error {
        self.engine.metrics().record_rejection(err.kind());
        tracing::warn!(
            account_id = %account_id,
            contest_id = %contest_id,
            error = %err,
            "Contest request rejected"
        );
        err
    }

    /// Claim today's free vote.
    ///
    /// "Today" is the calendar date at `local_offset`. Claiming on the day
    /// after the previous claim extends the streak, otherwise it restarts at 1.
    pub async fn claim_daily_vote(
        &self,
        account_id: &AccountId,
        contest_id: &str,
        local_offset: FixedOffset,
    ) -> Result<DailyClaim> {
        check_key_component("contest_id", contest_id)?;
        let account_id = &self.engine.resolve_account_id(account_id)?;
        let _guard = self
            .engine
            .locks()
            .lock(LockKey::Contest(account_id.clone(), contest_id.to_string()))
            .await;

        let now = self.clock.now();
        let today = now.with_timezone(&local_offset).date_naive();
        let mut activity = self.load_activity(account_id, contest_id)?;

        // A claim dated after "today" means the caller moved west; still one per day
        if let Some(last) = activity.last_daily_claim {
            if last >= today {
                return Err(self.reject(account_id, contest_id, Error::AlreadyClaimedToday(last)));
            }
        }

        activity.daily_streak = match activity.last_daily_claim {
            Some(last) if today.pred_opt() == Some(last) => activity.daily_streak + 1,
            _ => 1,
        };
        activity.last_daily_claim = Some(today);

        let streak_bonus = self.config.streak_bonus_days > 0
            && activity.daily_streak % self.config.streak_bonus_days == 0;
        let votes_granted = if streak_bonus { 2 } else { 1 };
        activity.votes_remaining.add(VoteTier::Free, votes_granted);
        activity.updated_at = now;

        let mut tx = self.engine.storage().transaction();
        tx.put_activity(&activity)?;
        self.engine.commit(tx, &[])?;

        tracing::info!(
            account_id = %account_id,
            contest_id = %contest_id,
            streak = activity.daily_streak,
            votes_granted,
            "Daily vote claimed"
        );

        Ok(DailyClaim {
            votes_granted,
            streak_bonus,
            activity,
        })
    }

    /// Buy a vote package with credits
    pub async fn purchase_vote_package(
        &self,
        account_id: &AccountId,
        contest_id: &str,
        package: &str,
    ) -> Result<PackagePurchase> {
        check_key_component("contest_id", contest_id)?;
        let Some(bundle) = self.config.packages.get(package) else {
            return Err(self.reject(
                account_id,
                contest_id,
                Error::UnknownPackage(package.to_string()),
            ));
        };

        let (_account_guard, mut account) = self.engine.lock_live_account(account_id).await?;
        let account_id = &account.id.clone();
        let _contest_guard = self
            .engine
            .locks()
            .lock(LockKey::Contest(account_id.clone(), contest_id.to_string()))
            .await;

        let mut activity = self.load_activity(account_id, contest_id)?;

        let mut tx = self.engine.storage().transaction();
        let entry = self.engine.stage_entry(
            &mut tx,
            &mut account,
            -bundle.cost,
            EntryMetadata::Spend(SpendTarget::VotePackage {
                contest_id: contest_id.to_string(),
                package: package.to_string(),
            }),
        )?;

        activity.votes_remaining.add_all(&bundle.votes);
        activity.updated_at = self.clock.now();
        tx.put_activity(&activity)?;
        self.engine.commit(tx, std::slice::from_ref(&entry))?;

        tracing::info!(
            account_id = %account_id,
            contest_id = %contest_id,
            package = %package,
            cost = bundle.cost,
            balance = entry.balance_after,
            "Vote package purchased"
        );

        Ok(PackagePurchase {
            applied: entry.into(),
            activity,
        })
    }

    /// Spend one vote of `tier` on a submission
    pub async fn cast_vote(
        &self,
        account_id: &AccountId,
        contest_id: &str,
        submission_id: &str,
        tier: VoteTier,
    ) -> Result<VoteReceipt> {
        check_key_component("contest_id", contest_id)?;
        check_key_component("submission_id", submission_id)?;
        let account_id = &self.engine.resolve_account_id(account_id)?;
        let locks = self.engine.locks();
        let _contest_guard = locks
            .lock(LockKey::Contest(account_id.clone(), contest_id.to_string()))
            .await;
        let _submission_guard = locks
            .lock(LockKey::Submission(submission_id.to_string()))
            .await;

        let storage = self.engine.storage();
        if storage.get_vote(submission_id, account_id)?.is_some() {
            return Err(self.reject(
                account_id,
                contest_id,
                Error::AlreadyVoted {
                    account_id: account_id.clone(),
                    submission_id: submission_id.to_string(),
                },
            ));
        }

        let mut tally = storage
            .get_tally(submission_id)?
            .unwrap_or_else(|| SubmissionTally::new(contest_id, submission_id));
        if tally.contest_id != contest_id {
            return Err(self.reject(
                account_id,
                contest_id,
                Error::InvalidEntry(format!(
                    "submission {} belongs to contest {}",
                    submission_id, tally.contest_id
                )),
            ));
        }

        let mut activity = self.load_activity(account_id, contest_id)?;
        if !activity.votes_remaining.take_one(tier) {
            return Err(self.reject(account_id, contest_id, Error::NoVotesRemaining(tier)));
        }

        let now = self.clock.now();
        activity.votes_used.add(tier, 1);
        activity.updated_at = now;
        tally.record(tier);
        let vote = VoteRecord {
            account_id: account_id.clone(),
            contest_id: contest_id.to_string(),
            submission_id: submission_id.to_string(),
            tier,
            weight: tier.weight(),
            cast_at: now,
        };

        let mut tx = storage.transaction();
        tx.put_activity(&activity)?;
        tx.put_vote(&vote)?;
        tx.put_tally(&tally)?;
        self.engine.commit(tx, &[])?;
        self.engine.metrics().record_vote(tier.as_str());

        tracing::info!(
            account_id = %account_id,
            contest_id = %contest_id,
            submission_id = %submission_id,
            tier = %tier,
            score = tally.score,
            "Vote cast"
        );

        Ok(VoteReceipt {
            vote,
            tally,
            votes_remaining: activity.votes_remaining,
        })
    }

    /// Voting state of an account in a contest
    pub fn activity(&self, account_id: &AccountId, contest_id: &str) -> Result<ContestActivity> {
        let account_id = match self.engine.resolve_account_id(account_id) {
            Ok(live) => live,
            Err(Error::AccountNotFound(_)) => account_id.clone(),
            Err(e) => return Err(e),
        };
        self.load_activity(&account_id, contest_id)
    }

    /// Current tally of a submission
    pub fn tally(&self, submission_id: &str) -> Result<Option<SubmissionTally>> {
        self.engine.storage().get_tally(submission_id)
    }
}
