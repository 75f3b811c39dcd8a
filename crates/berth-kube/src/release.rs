//! Stored release records and their state machine

use berth_core::{ChartMetadata, ReleaseStatus, Values};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default timeout for pending operations (5 minutes)
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::minutes(5);

/// One version of a release as persisted by a storage driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredRelease {
    /// Release name
    pub name: String,

    /// Kubernetes namespace
    pub namespace: String,

    /// Version number (1-indexed, increments with each upgrade or rollback)
    pub version: u32,

    /// Current state with timing information
    pub state: ReleaseState,

    /// Chart metadata at deploy time
    pub chart: ChartMetadata,

    /// User supplied values (chart defaults are not included)
    pub values: Values,

    /// Rendered manifest (all Kubernetes objects)
    pub manifest: String,

    /// Custom labels for filtering/querying
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl StoredRelease {
    /// Create version 1 of a release, pending install
    pub fn for_install(
        name: String,
        namespace: String,
        chart: ChartMetadata,
        values: Values,
        manifest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            namespace,
            version: 1,
            state: ReleaseState::PendingInstall {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
            },
            chart,
            values,
            manifest,
            labels: BTreeMap::new(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create the next version of `previous`, pending upgrade
    pub fn for_upgrade(
        previous: &StoredRelease,
        chart: ChartMetadata,
        values: Values,
        manifest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: previous.name.clone(),
            namespace: previous.namespace.clone(),
            version: previous.version + 1,
            state: ReleaseState::PendingUpgrade {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
                previous_version: previous.version,
            },
            chart,
            values,
            manifest,
            labels: previous.labels.clone(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create version `next_version` restoring the content of `target`
    pub fn for_rollback(target: &StoredRelease, next_version: u32) -> Self {
        let now = Utc::now();
        Self {
            name: target.name.clone(),
            namespace: target.namespace.clone(),
            version: next_version,
            state: ReleaseState::PendingRollback {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
                target_version: target.version,
            },
            chart: target.chart.clone(),
            values: target.values.clone(),
            manifest: target.manifest.clone(),
            labels: target.labels.clone(),
            description: Some(format!("Rollback to {}", target.version)),
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key for this release
    pub fn storage_key(&self) -> String {
        storage_key(&self.name, self.version)
    }

    /// Coarse status of this record
    pub fn status(&self) -> ReleaseStatus {
        self.state.status()
    }

    pub fn is_deployed(&self) -> bool {
        matches!(self.state, ReleaseState::Deployed)
    }

    /// Set the timeout carried by a pending state
    pub fn set_timeout(&mut self, value: Duration) {
        match &mut self.state {
            ReleaseState::PendingInstall { timeout, .. }
            | ReleaseState::PendingUpgrade { timeout, .. }
            | ReleaseState::PendingRollback { timeout, .. }
            | ReleaseState::Uninstalling { timeout, .. } => *timeout = value,
            _ => {}
        }
    }

    pub fn mark_deployed(&mut self) {
        self.state = ReleaseState::Deployed;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, reason: String) {
        let now = Utc::now();
        self.state = ReleaseState::Failed {
            reason,
            failed_at: now,
        };
        self.updated_at = now;
    }

    /// Mark the release as superseded (replaced by a newer version)
    pub fn mark_superseded(&mut self) {
        self.state = ReleaseState::Superseded;
        self.updated_at = Utc::now();
    }

    pub fn mark_uninstalling(&mut self, timeout: Duration) {
        let now = Utc::now();
        self.state = ReleaseState::Uninstalling {
            started_at: now,
            timeout,
        };
        self.updated_at = now;
    }

    pub fn mark_uninstalled(&mut self) {
        self.state = ReleaseState::Uninstalled;
        self.updated_at = Utc::now();
    }
}

/// Storage key for a release version
pub fn storage_key(name: &str, version: u32) -> String {
    format!("sh.berth.release.v1.{}.v{}", name, version)
}

/// Release state with timing information for pending operations
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseState {
    #[default]
    Unknown,

    /// Installation in progress
    PendingInstall {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
    },

    /// Upgrade in progress
    PendingUpgrade {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
        previous_version: u32,
    },

    /// Rollback in progress
    PendingRollback {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
        target_version: u32,
    },

    Deployed,

    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },

    /// Replaced by a newer version
    Superseded,

    Uninstalled,

    /// Uninstallation in progress
    Uninstalling {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
    },
}

impl ReleaseState {
    /// Check if this is a pending (transitional) state
    pub fn is_pending(&self) -> bool {
        self.status().is_pending()
    }

    /// Check if this pending state has outlived its timeout
    pub fn is_stale(&self) -> bool {
        match self {
            Self::PendingInstall { started_at, timeout }
            | Self::PendingUpgrade {
                started_at, timeout, ..
            }
            | Self::PendingRollback {
                started_at, timeout, ..
            }
            | Self::Uninstalling { started_at, timeout } => {
                Utc::now().signed_duration_since(*started_at) > *timeout
            }
            _ => false,
        }
    }

    pub fn status(&self) -> ReleaseStatus {
        match self {
            Self::Unknown => ReleaseStatus::Unknown,
            Self::PendingInstall { .. } => ReleaseStatus::PendingInstall,
            Self::PendingUpgrade { .. } => ReleaseStatus::PendingUpgrade,
            Self::PendingRollback { .. } => ReleaseStatus::PendingRollback,
            Self::Deployed => ReleaseStatus::Deployed,
            Self::Failed { .. } => ReleaseStatus::Failed,
            Self::Superseded => ReleaseStatus::Superseded,
            Self::Uninstalled => ReleaseStatus::Uninstalled,
            Self::Uninstalling { .. } => ReleaseStatus::Uninstalling,
        }
    }

    /// Human-readable status name
    pub fn status_name(&self) -> &'static str {
        self.status().as_str()
    }
}

impl std::fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason, .. } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.status_name()),
        }
    }
}

/// Serialization helper for chrono::Duration
mod duration_serde {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.num_seconds().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(seconds))
    }
}
