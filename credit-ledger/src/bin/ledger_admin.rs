//! Operator CLI for the credit ledger
//!
//! Runs directly against the data directory. Every mutating command records
//! the `--admin` operator on the entry it writes.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use credit_ledger::{
    types::{AdjustmentReason, EntryMetadata},
    AccountId, AdminContext, Config, CreditLedger,
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ledger-admin")]
#[command(about = "Inspect and repair credit ledger accounts")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults to CREDIT_LEDGER_* environment)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Operator recorded on admin entries
    #[arg(long, global = true, default_value = "ledger-admin")]
    admin: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show an account projection
    Balance {
        /// Account ID
        account: String,
    },

    /// List ledger entries, newest first
    History {
        /// Account ID
        account: String,

        /// Page size
        #[arg(short, long)]
        limit: Option<usize>,

        /// Cursor from a previous page
        #[arg(long)]
        before: Option<u64>,
    },

    /// Compare an account with its ledger
    Reconcile {
        /// Account ID
        account: String,
    },

    /// Reconcile every account
    ReconcileAll,

    /// Approximate store sizes
    Stats,

    /// Reconcile and repair an account
    Repair {
        /// Account ID
        account: String,
    },

    /// Merge accounts sharing an email
    Merge {
        /// Email address
        email: String,
    },

    /// Grant credits
    Grant {
        /// Account ID
        account: String,

        /// Credits to add
        amount: i64,

        /// Operator note
        #[arg(short, long)]
        reason: String,
    },

    /// Apply a signed balance correction
    Adjust {
        /// Account ID
        account: String,

        /// Signed credit delta
        #[arg(allow_hyphen_values = true)]
        amount: i64,

        /// Operator note
        #[arg(short, long)]
        note: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    // Operators act directly; no delivery of user notifications from here
    config.notifications.enabled = false;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(&cli)?;
    let ledger = CreditLedger::open(config)
        .await
        .context("opening credit ledger")?;
    let admin = AdminContext::new(cli.admin.clone());

    let result = run(&ledger, &admin, cli.command).await;
    ledger.shutdown().await;
    result
}

async fn run(ledger: &CreditLedger, admin: &AdminContext, command: Commands) -> anyhow::Result<()> {
    let engine = ledger.engine();

    match command {
        Commands::Balance { account } => {
            print_json(&engine.account(&AccountId::new(account))?)?;
        }
        Commands::History {
            account,
            limit,
            before,
        } => {
            print_json(&engine.list_entries(&AccountId::new(account), limit, before)?)?;
        }
        Commands::Reconcile { account } => {
            print_json(&ledger.reconciliation().reconcile(&AccountId::new(account))?)?;
        }
        Commands::ReconcileAll => {
            print_json(&ledger.reconciliation().reconcile_all()?)?;
        }
        Commands::Stats => {
            print_json(&engine.storage().get_stats()?)?;
        }
        Commands::Repair { account } => {
            let account_id = AccountId::new(account);
            let report = ledger.reconciliation().reconcile(&account_id)?;
            match ledger
                .reconciliation()
                .repair(admin, &account_id, &report)
                .await?
            {
                Some(applied) => print_json(&applied.entry)?,
                None => print_json(&report)?,
            }
        }
        Commands::Merge { email } => {
            print_json(&ledger.merger().merge_by_email(admin, &email).await?)?;
        }
        Commands::Grant {
            account,
            amount,
            reason,
        } => {
            if amount <= 0 {
                bail!("grant amount must be positive");
            }
            let applied = engine
                .apply_entry(
                    &AccountId::new(account),
                    amount,
                    EntryMetadata::AdminGrant {
                        acting_admin_id: admin.admin_id().to_string(),
                        reason,
                    },
                )
                .await?;
            print_json(&applied.entry)?;
        }
        Commands::Adjust {
            account,
            amount,
            note,
        } => {
            let applied = engine
                .apply_entry(
                    &AccountId::new(account),
                    amount,
                    EntryMetadata::AdminAdjustment {
                        acting_admin_id: admin.admin_id().to_string(),
                        reason: AdjustmentReason::Manual { note },
                    },
                )
                .await?;
            print_json(&applied.entry)?;
        }
    }

    Ok(())
}
