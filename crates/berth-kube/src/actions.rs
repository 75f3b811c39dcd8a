//! Action configurations and the options that adjust them
//!
//! Every release action runs from a config struct built by the caller. Options
//! are applied to the config in order before the action starts; the first
//! option that refuses aborts the action before anything is mutated.

use chrono::Duration;
use std::collections::BTreeMap;

use crate::error::{KubeError, Result};
use crate::release::DEFAULT_OPERATION_TIMEOUT;

/// Longest accepted release description
pub const MAX_DESCRIPTION_LEN: usize = 512;

/// Default number of versions kept per release
pub const DEFAULT_MAX_HISTORY: u32 = 10;

/// Configuration for an install
#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub name: String,
    pub namespace: String,

    /// Bound on the apply phase
    pub timeout: Duration,

    /// Render and build the record without persisting or applying anything
    pub dry_run: bool,

    /// Labels recorded on the release
    pub labels: BTreeMap<String, String>,

    pub description: Option<String>,
}

impl InstallConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
            dry_run: false,
            labels: BTreeMap::new(),
            description: None,
        }
    }
}

/// Configuration for an upgrade
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    pub name: String,
    pub namespace: String,
    pub timeout: Duration,
    pub dry_run: bool,
    pub labels: BTreeMap<String, String>,
    pub description: Option<String>,

    /// Delete and recreate objects whose patch is rejected
    pub force: bool,

    /// Versions kept after the upgrade succeeds
    pub max_history: u32,
}

impl UpgradeConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
            dry_run: false,
            labels: BTreeMap::new(),
            description: None,
            force: false,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// Configuration for a rollback
#[derive(Debug, Clone)]
pub struct RollbackConfig {
    pub name: String,
    pub namespace: String,

    /// Version to restore; 0 selects the newest usable version before the latest
    pub version: u32,

    pub timeout: Duration,
    pub force: bool,
    pub max_history: u32,
    pub description: Option<String>,
}

impl RollbackConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version: 0,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            force: false,
            max_history: DEFAULT_MAX_HISTORY,
            description: None,
        }
    }

    pub fn to_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Configuration for an uninstall
#[derive(Debug, Clone)]
pub struct UninstallConfig {
    pub name: String,
    pub namespace: String,
    pub timeout: Duration,

    /// Keep the release records after the objects are gone
    pub keep_history: bool,

    pub description: Option<String>,
}

impl UninstallConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
            keep_history: false,
            description: None,
        }
    }
}

/// Adjusts an action config before the action runs
///
/// Closures of the form `Fn(&mut C) -> Result<()>` are options too.
pub trait ActionOption<C>: Send + Sync {
    fn apply(&self, config: &mut C) -> Result<()>;
}

impl<C, F> ActionOption<C> for F
where
    F: Fn(&mut C) -> Result<()> + Send + Sync,
{
    fn apply(&self, config: &mut C) -> Result<()> {
        self(config)
    }
}

pub type InstallOption = Box<dyn ActionOption<InstallConfig>>;
pub type UpgradeOption = Box<dyn ActionOption<UpgradeConfig>>;
pub type UninstallOption = Box<dyn ActionOption<UninstallConfig>>;

/// Apply options in order, stopping at the first rejection
pub fn apply_options<C>(
    action: &'static str,
    config: &mut C,
    options: &[Box<dyn ActionOption<C>>],
) -> Result<()> {
    for option in options {
        option
            .apply(config)
            .map_err(|e| KubeError::OptionRejected {
                action,
                message: e.to_string(),
            })?;
    }
    Ok(())
}

/// Bound the apply phase; must be positive
#[derive(Debug, Clone, Copy)]
pub struct Timeout(pub Duration);

impl Timeout {
    fn checked(&self) -> Result<Duration> {
        if self.0 <= Duration::zero() {
            return Err(KubeError::InvalidConfig(format!(
                "timeout must be positive, got {}s",
                self.0.num_seconds()
            )));
        }
        Ok(self.0)
    }
}

/// Free-form description recorded on the release
#[derive(Debug, Clone)]
pub struct Description(pub String);

impl Description {
    fn checked(&self) -> Result<String> {
        if self.0.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(KubeError::InvalidConfig(format!(
                "description longer than {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DryRun(pub bool);

/// Labels merged into the release labels
#[derive(Debug, Clone)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    fn merge_into(&self, labels: &mut BTreeMap<String, String>) -> Result<()> {
        if self.0.keys().any(|k| k.trim().is_empty()) {
            return Err(KubeError::InvalidConfig("label keys must not be empty".to_string()));
        }
        labels.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForceUpgrade(pub bool);

/// Versions kept per release; must be at least 1
#[derive(Debug, Clone, Copy)]
pub struct MaxHistory(pub u32);

impl MaxHistory {
    fn checked(&self) -> Result<u32> {
        if self.0 == 0 {
            return Err(KubeError::InvalidConfig("max history must be at least 1".to_string()));
        }
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeepHistory(pub bool);

/// Implement [`ActionOption`] for an option on several configs
macro_rules! action_option {
    ($option:ty => $($config:ty),+ ; |$opt:ident, $cfg:ident| $body:block) => {
        $(
            impl ActionOption<$config> for $option {
                fn apply(&self, $cfg: &mut $config) -> Result<()> {
                    let $opt = self;
                    $body
                }
            }
        )+
    };
}

action_option!(Timeout => InstallConfig, UpgradeConfig, RollbackConfig, UninstallConfig; |opt, cfg| {
    cfg.timeout = opt.checked()?;
    Ok(())
});

action_option!(Description => InstallConfig, UpgradeConfig, RollbackConfig, UninstallConfig; |opt, cfg| {
    cfg.description = Some(opt.checked()?);
    Ok(())
});

action_option!(DryRun => InstallConfig, UpgradeConfig; |opt, cfg| {
    cfg.dry_run = opt.0;
    Ok(())
});

action_option!(Labels => InstallConfig, UpgradeConfig; |opt, cfg| {
    opt.merge_into(&mut cfg.labels)
});

action_option!(ForceUpgrade => UpgradeConfig, RollbackConfig; |opt, cfg| {
    cfg.force = opt.0;
    Ok(())
});

action_option!(MaxHistory => UpgradeConfig, RollbackConfig; |opt, cfg| {
    cfg.max_history = opt.checked()?;
    Ok(())
});

action_option!(KeepHistory => UninstallConfig; |opt, cfg| {
    cfg.keep_history = opt.0;
    Ok(())
});
