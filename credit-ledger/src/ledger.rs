//! Top-level ledger handle
//!
//! Wires storage, locks, metrics and notifications into the individual
//! services and exposes them behind one value.
//!
//! # Example
//!
//! ```no_run
//! use credit_ledger::{Config, CreditLedger};
//!
//! #[tokio::main]
//! async fn main() -> credit_ledger::Result<()> {
//!     let mut config = Config::default();
//!     config.identity.hmac_secret = Some("secret".to_string());
//!     let ledger = CreditLedger::open(config).await?;
//!
//!     let identity = ledger.authenticate("Bearer eyJ...")?;
//!     let account = ledger.account_for(&identity).await?;
//!     ledger
//!         .entitlements()
//!         .unlock_episode(&account.id, "series-1", 1, 30)
//!         .await?;
//!
//!     ledger.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::{
    contest::{Clock, ContestVoteLedger, SystemClock},
    engine::BalanceEngine,
    entitlement::EntitlementService,
    identity::{Identity, IdentityResolver},
    locks::KeyedLocks,
    merge::DuplicateMerger,
    metrics::Metrics,
    notify::{spawn_notifier, NotificationHandle, NotificationSink, TracingSink},
    payment::PaymentService,
    reconciliation::ReconciliationEngine,
    types::Account,
    Config, Error, Result, Storage,
};
use std::sync::Arc;

/// Main ledger interface
#[derive(Debug)]
pub struct CreditLedger {
    engine: Arc<BalanceEngine>,
    identity: Option<IdentityResolver>,
    entitlements: EntitlementService,
    payments: PaymentService,
    reconciliation: ReconciliationEngine,
    merger: DuplicateMerger,
    contests: ContestVoteLedger,
    notifier: NotificationHandle,
    config: Config,
}

impl CreditLedger {
    /// Open with the logging notification sink and the wall clock
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(TracingSink), Arc::new(SystemClock)).await
    }

    /// Open with a custom notification sink and clock
    pub async fn open_with(
        config: Config,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;
        let engine = Arc::new(BalanceEngine::new(
            storage,
            Arc::new(KeyedLocks::new()),
            metrics,
            config.ledger.clone(),
        ));

        // Operator tooling runs without token verification
        let identity = match (
            &config.identity.hmac_secret,
            &config.identity.rsa_public_key_path,
        ) {
            (None, None) => None,
            _ => Some(IdentityResolver::from_config(&config.identity)?),
        };

        let notifier = if config.notifications.enabled {
            spawn_notifier(sink, config.notifications.channel_capacity)
        } else {
            NotificationHandle::disabled()
        };

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            identity = identity.is_some(),
            notifications = config.notifications.enabled,
            "Credit ledger ready"
        );

        Ok(Self {
            entitlements: EntitlementService::new(engine.clone(), notifier.clone()),
            payments: PaymentService::new(
                engine.clone(),
                config.payments.clone(),
                notifier.clone(),
            ),
            reconciliation: ReconciliationEngine::new(engine.clone()),
            merger: DuplicateMerger::new(engine.clone()),
            contests: ContestVoteLedger::new(engine.clone(), config.contest.clone(), clock),
            engine,
            identity,
            notifier,
            config,
        })
    }

    /// Verify a bearer token
    pub fn authenticate(&self, bearer: &str) -> Result<Identity> {
        match &self.identity {
            Some(resolver) => resolver.resolve(bearer),
            None => Err(Error::InvalidCredential(
                "token verification is not configured".to_string(),
            )),
        }
    }

    /// Get or create the caller's account
    pub async fn account_for(&self, identity: &Identity) -> Result<Account> {
        self.engine.open_account(identity).await
    }

    /// Balance engine
    pub fn engine(&self) -> &Arc<BalanceEngine> {
        &self.engine
    }

    /// Episode unlocks
    pub fn entitlements(&self) -> &EntitlementService {
        &self.entitlements
    }

    /// Payment intake
    pub fn payments(&self) -> &PaymentService {
        &self.payments
    }

    /// Reconciliation and repair
    pub fn reconciliation(&self) -> &ReconciliationEngine {
        &self.reconciliation
    }

    /// Duplicate merging
    pub fn merger(&self) -> &DuplicateMerger {
        &self.merger
    }

    /// Contest voting
    pub fn contests(&self) -> &ContestVoteLedger {
        &self.contests
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        self.engine.metrics()
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wait for queued notifications to reach the sink
    pub async fn flush_notifications(&self) {
        self.notifier.flush().await;
    }

    /// Drain notifications and release idle locks
    pub async fn shutdown(self) {
        self.notifier.shutdown().await;
        self.engine.locks().prune();
        tracing::info!("Credit ledger shut down");
    }
}
