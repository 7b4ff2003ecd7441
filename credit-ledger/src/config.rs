//! Configuration for the credit ledger

use crate::types::TierCounts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Ledger policy
    pub ledger: LedgerPolicy,

    /// Token verification
    pub identity: IdentityConfig,

    /// Contest voting
    pub contest: ContestConfig,

    /// Payment intake
    pub payments: PaymentConfig,

    /// Notification dispatch
    pub notifications: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/credit-ledger"),
            service_name: "credit-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            ledger: LedgerPolicy::default(),
            identity: IdentityConfig::default(),
            contest: ContestConfig::default(),
            payments: PaymentConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Balance and merge policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerPolicy {
    /// Credits granted when an account is opened
    pub welcome_bonus: i64,

    /// Weight of one entitlement when scoring merge candidates
    pub merge_entitlement_weight: i64,

    /// History page size when the caller passes no limit
    pub default_page_size: usize,

    /// Upper bound on a single history page
    pub max_page_size: usize,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            welcome_bonus: 100,
            merge_entitlement_weight: 50,
            default_page_size: 50,
            max_page_size: 500,
        }
    }
}

/// Bearer token verification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// HS256 shared secret
    pub hmac_secret: Option<String>,

    /// RS256 public key (PEM file); takes precedence over the secret
    pub rsa_public_key_path: Option<PathBuf>,

    /// Required `iss` claim
    pub issuer: Option<String>,

    /// Required `aud` claim
    pub audience: Option<String>,

    /// Role granting administrative operations
    pub admin_role: Option<String>,
}

/// A purchasable bundle of contest votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePackage {
    /// Credit cost
    pub cost: i64,
    /// Votes granted per tier
    pub votes: TierCounts,
}

/// Contest voting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContestConfig {
    /// Vote packages by name
    pub packages: BTreeMap<String, VotePackage>,

    /// Consecutive daily claims needed for a bonus vote
    pub streak_bonus_days: u32,
}

impl Default for ContestConfig {
    fn default() -> Self {
        let mut packages = BTreeMap::new();
        packages.insert(
            "basic".to_string(),
            VotePackage {
                cost: 10,
                votes: TierCounts {
                    free: 0,
                    premium: 3,
                    super_votes: 0,
                },
            },
        );
        packages.insert(
            "pro".to_string(),
            VotePackage {
                cost: 25,
                votes: TierCounts {
                    free: 0,
                    premium: 8,
                    super_votes: 1,
                },
            },
        );
        packages.insert(
            "ultimate".to_string(),
            VotePackage {
                cost: 50,
                votes: TierCounts {
                    free: 0,
                    premium: 15,
                    super_votes: 4,
                },
            },
        );

        Self {
            packages,
            streak_bonus_days: 3,
        }
    }
}

/// Payment intake configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Known credit packages and the credits they grant. Events for packages
    /// listed here must carry exactly this many credits.
    pub credit_packages: BTreeMap<String, i64>,
}

/// Notification dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Enable the dispatcher
    pub enabled: bool,

    /// Mailbox capacity; events beyond it are dropped with a warning
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("CREDIT_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(secret) = std::env::var("CREDIT_LEDGER_JWT_SECRET") {
            config.identity.hmac_secret = Some(secret);
        }

        if let Ok(path) = std::env::var("CREDIT_LEDGER_JWT_PUBLIC_KEY") {
            config.identity.rsa_public_key_path = Some(PathBuf::from(path));
        }

        if let Ok(issuer) = std::env::var("CREDIT_LEDGER_JWT_ISSUER") {
            config.identity.issuer = Some(issuer);
        }

        if let Ok(bonus) = std::env::var("CREDIT_LEDGER_WELCOME_BONUS") {
            config.ledger.welcome_bonus = bonus
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid welcome bonus: {}", e)))?;
        }

        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledger.welcome_bonus < 0 {
            return Err(crate::Error::Config(
                "welcome_bonus must not be negative".to_string(),
            ));
        }
        if self.ledger.default_page_size == 0 || self.ledger.max_page_size == 0 {
            return Err(crate::Error::Config("page sizes must be positive".to_string()));
        }
        if let Some((name, _)) = self.contest.packages.iter().find(|(_, p)| p.cost <= 0) {
            return Err(crate::Error::Config(format!(
                "vote package {} must cost credits",
                name
            )));
        }
        if let Some((name, _)) = self.payments.credit_packages.iter().find(|(_, c)| **c <= 0) {
            return Err(crate::Error::Config(format!(
                "credit package {} must grant credits",
                name
            )));
        }
        Ok(())
    }
}
