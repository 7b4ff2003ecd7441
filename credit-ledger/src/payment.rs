//! Payment intake
//!
//! Completed payments arrive from the processor at least once. The
//! `external_reference` is the idempotency key: a redelivered event reports
//! the entry that already credited it.

use crate::{
    config::PaymentConfig,
    engine::BalanceEngine,
    notify::{Notification, NotificationHandle},
    types::{AccountId, EntryMetadata},
    Error, Result,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Completed payment reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Account to credit
    pub account_id: AccountId,
    /// Credit package bought
    pub package_id: String,
    /// Credits to add
    pub credits: i64,
    /// Money charged
    pub amount: Decimal,
    /// ISO 4217 currency
    pub currency: String,
    /// Processor reference
    pub external_reference: String,
}

/// What happened to a payment event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentOutcome {
    /// Credits were added
    Credited {
        /// Purchase entry
        entry_id: Uuid,
        /// Balance after the purchase
        new_balance: i64,
    },
    /// The reference was credited before
    AlreadyProcessed {
        /// Entry that credited it
        entry_id: Uuid,
    },
}

/// Turns completed payments into purchase entries
#[derive(Debug, Clone)]
pub struct PaymentService {
    engine: Arc<BalanceEngine>,
    config: PaymentConfig,
    notifier: NotificationHandle,
}

impl PaymentService {
    /// Create service
    pub fn new(
        engine: Arc<BalanceEngine>,
        config: PaymentConfig,
        notifier: NotificationHandle,
    ) -> Self {
        Self {
            engine,
            config,
            notifier,
        }
    }

    /// Credit a completed payment exactly once
    pub async fn handle_completed_payment(&self, event: PaymentEvent) -> Result<PaymentOutcome> {
        self.validate(&event)?;

        if let Some(entry_id) = self.already_processed(&event.external_reference)? {
            return Ok(PaymentOutcome::AlreadyProcessed { entry_id });
        }

        let metadata = EntryMetadata::Purchase {
            package_id: event.package_id.clone(),
            external_reference: event.external_reference.clone(),
            amount_paid: event.amount,
            currency: event.currency.clone(),
        };

        let applied = match self
            .engine
            .apply_entry(&event.account_id, event.credits, metadata)
            .await
        {
            Ok(applied) => applied,
            // Lost a race with a concurrent delivery of the same event
            Err(Error::DuplicateExternalReference(reference)) => {
                return match self.already_processed(&reference)? {
                    Some(entry_id) => Ok(PaymentOutcome::AlreadyProcessed { entry_id }),
                    None => Err(Error::DuplicateExternalReference(reference)),
                };
            }
            Err(e) => return Err(e),
        };

        // A merged account's payment lands on the account that absorbed it
        let credited = applied.entry.account_id.clone();
        tracing::info!(
            account_id = %credited,
            requested_account_id = %event.account_id,
            entry_id = %applied.entry_id,
            package_id = %event.package_id,
            credits = event.credits,
            "Payment credited"
        );

        self.notifier.notify(Notification::CreditPurchaseSucceeded {
            account_id: credited,
            credits: event.credits,
            new_balance: applied.new_balance,
            entry_id: applied.entry_id,
        });

        Ok(PaymentOutcome::Credited {
            entry_id: applied.entry_id,
            new_balance: applied.new_balance,
        })
    }

    fn already_processed(&self, reference: &str) -> Result<Option<Uuid>> {
        let entry_id = self.engine.storage().entry_for_external_reference(reference)?;
        if let Some(id) = entry_id {
            tracing::info!(
                external_reference = %reference,
                entry_id = %id,
                "Payment already processed"
            );
        }
        Ok(entry_id)
    }

    fn validate(&self, event: &PaymentEvent) -> Result<()> {
        if event.external_reference.trim().is_empty() {
            return Err(Error::InvalidEntry("payment has no external reference".into()));
        }
        if event.credits <= 0 {
            return Err(Error::InvalidEntry("payment must grant credits".into()));
        }
        if event.amount.is_sign_negative() {
            return Err(Error::InvalidEntry("payment amount is negative".into()));
        }
        if let Some(expected) = self.config.credit_packages.get(&event.package_id) {
            if *expected != event.credits {
                return Err(Error::InvalidEntry(format!(
                    "package {} grants {} credits, event carries {}",
                    event.package_id, expected, event.credits
                )));
            }
        }
        Ok(())
    }
}
