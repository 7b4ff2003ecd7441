//! Property-based tests for ledger invariants
//!
//! - Balance conservation: balance == Σ(entry amounts) after any operation mix
//! - No negative balance, sequentially or under concurrent spends
//! - Failed operations write nothing

use credit_ledger::{
    types::{AdjustmentReason, EntryMetadata, SpendTarget},
    AccountId, Config, CreditLedger, Entitlement, Error, Identity,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Purchase(i64),
    Unlock { series: u8, episode: u32, cost: i64 },
    Adjust(i64),
    VotePackage(&'static str),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..500).prop_map(Op::Purchase),
        (0u8..3, 0u32..5, 0i64..120).prop_map(|(series, episode, cost)| Op::Unlock {
            series,
            episode,
            cost
        }),
        (-150i64..150).prop_map(Op::Adjust),
        prop_oneof![Just("basic"), Just("pro"), Just("ultimate")].prop_map(Op::VotePackage),
    ]
}

/// Test ledger; keep the `TempDir` alive for as long as the ledger
async fn create_test_ledger() -> (CreditLedger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.notifications.enabled = false;

    (CreditLedger::open(config).await.unwrap(), temp_dir)
}

fn identity(sub: &str) -> Identity {
    Identity {
        account_id: AccountId::new(sub),
        email: None,
        display_name: None,
        roles: Vec::new(),
        is_admin: false,
    }
}

/// Errors a well-formed request may legitimately get
fn is_expected_rejection(err: &Error) -> bool {
    matches!(
        err,
        Error::InsufficientCredits { .. } | Error::AlreadyUnlocked(_)
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: the cached balance always equals the ledger sum and never goes negative
    #[test]
    fn prop_balance_equals_ledger_sum(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let id = ledger.account_for(&identity("prop-user")).await.unwrap().id;
            let engine = ledger.engine();

            let mut committed = 1usize;
            for (n, op) in ops.iter().enumerate() {
                let result = match op {
                    Op::Purchase(credits) => engine
                        .apply_entry(
                            &id,
                            *credits,
                            EntryMetadata::Purchase {
                                package_id: "custom".to_string(),
                                external_reference: format!("pi_{}", n),
                                amount_paid: Decimal::new(*credits, 2),
                                currency: "USD".to_string(),
                            },
                        )
                        .await
                        .map(|_| ()),
                    Op::Unlock { series, episode, cost } => ledger
                        .entitlements()
                        .unlock_episode(&id, &format!("series-{}", series), *episode, *cost)
                        .await
                        .map(|result| {
                            if !result.newly_unlocked {
                                committed -= 1;
                            }
                        }),
                    Op::Adjust(delta) => engine
                        .apply_entry(
                            &id,
                            *delta,
                            EntryMetadata::AdminAdjustment {
                                acting_admin_id: "prop".to_string(),
                                reason: AdjustmentReason::Manual { note: "prop".to_string() },
                            },
                        )
                        .await
                        .map(|_| ()),
                    Op::VotePackage(package) => ledger
                        .contests()
                        .purchase_vote_package(&id, "contest", package)
                        .await
                        .map(|_| ()),
                };

                match result {
                    Ok(()) => committed += 1,
                    Err(e) => prop_assert!(is_expected_rejection(&e), "unexpected error: {}", e),
                }
            }

            let account = engine.account(&id).unwrap();
            let entries = engine.storage().entries_in_order(&id).unwrap();
            let sum: i64 = entries.iter().map(|e| e.amount).sum();

            prop_assert_eq!(account.balance, sum);
            prop_assert!(account.balance >= 0);
            prop_assert_eq!(entries.len(), committed);
            prop_assert!(entries.iter().all(|e| e.balance_after >= 0));
            prop_assert!(ledger.reconciliation().reconcile(&id).unwrap().is_balanced());

            Ok(())
        })?;
    }

    /// Property: concurrent spends never overdraw and succeed exactly as often as funds allow
    #[test]
    fn prop_concurrent_spends_never_overdraw(cost in 1i64..60, tasks in 2usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let ledger = Arc::new(ledger);
            let id = ledger.account_for(&identity("racer")).await.unwrap().id;

            let handles: Vec<_> = (0..tasks)
                .map(|n| {
                    let ledger = ledger.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        ledger
                            .engine()
                            .apply_entry(
                                &id,
                                -cost,
                                EntryMetadata::Spend(SpendTarget::Episode(Entitlement::new(
                                    "race",
                                    n as u32,
                                ))),
                            )
                            .await
                    })
                })
                .collect();

            let mut successes = 0i64;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => successes += 1,
                    Err(e) => prop_assert!(
                        matches!(e, Error::InsufficientCredits { .. }),
                        "unexpected error: {}",
                        e
                    ),
                }
            }

            let expected = std::cmp::min(tasks as i64, 100 / cost);
            let account = ledger.engine().account(&id).unwrap();
            prop_assert_eq!(successes, expected);
            prop_assert_eq!(account.balance, 100 - expected * cost);
            prop_assert!(account.balance >= 0);

            Ok(())
        })?;
    }
}
