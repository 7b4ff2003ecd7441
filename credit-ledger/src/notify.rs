//! Outbound notifications
//!
//! Fire-and-forget delivery of ledger events to an external sink (email,
//! push, analytics). Producers never wait on delivery and a delivery failure
//! never rolls back the ledger write that triggered it.
//!
//! ```text
//!  services ──try_send──▶ mpsc (bounded) ──▶ NotificationActor ──▶ NotificationSink
//! ```

use crate::types::{AccountId, Entitlement};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Event published after a committed ledger write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// A payment was credited
    CreditPurchaseSucceeded {
        /// Credited account
        account_id: AccountId,
        /// Credits added
        credits: i64,
        /// Balance after the purchase
        new_balance: i64,
        /// Ledger entry
        entry_id: Uuid,
    },
    /// An episode was unlocked for the first time
    EpisodeUnlocked {
        /// Unlocking account
        account_id: AccountId,
        /// Unlocked episode
        entitlement: Entitlement,
        /// Credits paid
        cost: i64,
        /// Ledger entry
        entry_id: Uuid,
    },
}

impl Notification {
    /// Short event name
    pub fn name(&self) -> &'static str {
        match self {
            Notification::CreditPurchaseSucceeded { .. } => "credit_purchase_succeeded",
            Notification::EpisodeUnlocked { .. } => "episode_unlocked",
        }
    }

    /// Account the event concerns
    pub fn account_id(&self) -> &AccountId {
        match self {
            Notification::CreditPurchaseSucceeded { account_id, .. }
            | Notification::EpisodeUnlocked { account_id, .. } => account_id,
        }
    }
}

/// Destination for notifications
pub trait NotificationSink: Send + Sync + 'static {
    /// Deliver one notification
    fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

/// Sink that only logs
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, notification: &Notification) -> Result<(), String> {
        tracing::info!(
            event = notification.name(),
            account_id = %notification.account_id(),
            "Notification delivered"
        );
        Ok(())
    }
}

enum NotifyMessage {
    Deliver(Notification),
    Flush { response: oneshot::Sender<()> },
    Shutdown { response: oneshot::Sender<()> },
}

/// Background task draining the mailbox into the sink
struct NotificationActor {
    sink: Arc<dyn NotificationSink>,
    mailbox: mpsc::Receiver<NotifyMessage>,
}

impl NotificationActor {
    async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                NotifyMessage::Deliver(notification) => self.deliver(&notification),
                NotifyMessage::Flush { response } => {
                    let _ = response.send(());
                }
                NotifyMessage::Shutdown { response } => {
                    self.drain().await;
                    let _ = response.send(());
                    break;
                }
            }
        }
        tracing::debug!("Notification dispatcher stopped");
    }

    /// Deliver what is already queued and refuse anything new
    async fn drain(&mut self) {
        self.mailbox.close();
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                NotifyMessage::Deliver(notification) => self.deliver(&notification),
                NotifyMessage::Flush { response } | NotifyMessage::Shutdown { response } => {
                    let _ = response.send(());
                }
            }
        }
    }

    fn deliver(&self, notification: &Notification) {
        if let Err(e) = self.sink.deliver(notification) {
            tracing::error!(
                event = notification.name(),
                account_id = %notification.account_id(),
                error = %e,
                "Notification delivery failed"
            );
        }
    }
}

/// Cheap handle for publishing notifications
#[derive(Clone, Debug)]
pub struct NotificationHandle {
    sender: Option<mpsc::Sender<NotifyMessage>>,
}

impl std::fmt::Debug for NotifyMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyMessage::Deliver(n) => write!(f, "Deliver({})", n.name()),
            NotifyMessage::Flush { .. } => f.write_str("Flush"),
            NotifyMessage::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl NotificationHandle {
    /// Handle that drops every notification
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Publish without waiting; a full or closed mailbox drops the event
    pub fn notify(&self, notification: Notification) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(NotifyMessage::Deliver(notification)) {
            tracing::warn!(error = %e, "Dropped notification");
        }
    }

    /// Wait until everything published so far was handed to the sink
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(NotifyMessage::Flush { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Drain the mailbox, stop the dispatcher and wait for it to finish
    pub async fn shutdown(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if sender
            .send(NotifyMessage::Shutdown { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Spawn the dispatcher and return its handle
pub fn spawn_notifier(sink: Arc<dyn NotificationSink>, capacity: usize) -> NotificationHandle {
    let (sender, mailbox) = mpsc::channel(capacity.max(1));
    let actor = NotificationActor { sink, mailbox };
    tokio::spawn(actor.run());
    NotificationHandle {
        sender: Some(sender),
    }
}
