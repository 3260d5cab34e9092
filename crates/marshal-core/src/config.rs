use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use marshal_types::RiskLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt:
    /// exponential in the attempt number, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Which risk bands may bypass human approval when a task opts into
/// `auto_approve`. Low risk never requires approval at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    pub auto_approve_up_to: RiskLevel,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_up_to: RiskLevel::Low,
        }
    }
}

impl ApprovalPolicy {
    pub fn requires_approval(&self, risk: RiskLevel, auto_approve: bool) -> bool {
        if risk == RiskLevel::Low {
            return false;
        }
        !(auto_approve && risk <= self.auto_approve_up_to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub approval: ApprovalPolicy,
    pub lock_wait_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub event_capacity: usize,
    pub task_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            approval: ApprovalPolicy::default(),
            lock_wait_timeout_ms: 30_000,
            tool_timeout_ms: 120_000,
            event_capacity: 256,
            task_retention_secs: 3_600,
        }
    }
}

impl EngineConfig {
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    /// Resolution order: explicit path (must parse), workspace
    /// `.marshal/config.yaml`, global config dir, built-in defaults.
    /// Environment overrides (`MARSHAL_*`) win over every file layer.
    pub async fn load(explicit: Option<&Path>, workspace: &Path) -> anyhow::Result<Self> {
        let mut config = match Self::first_config_file(explicit, workspace) {
            Some(path) => {
                let text = tokio::fs::read_to_string(&path).await.map_err(|err| {
                    anyhow::anyhow!("cannot read config `{}`: {err}", path.display())
                })?;
                serde_yaml::from_str(&text).map_err(|err| {
                    anyhow::anyhow!("cannot parse config `{}`: {err}", path.display())
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn first_config_file(explicit: Option<&Path>, workspace: &Path) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let local = workspace.join(".marshal").join("config.yaml");
        if local.is_file() {
            return Some(local);
        }
        let global = dirs::config_dir()?.join("marshal").join("config.yaml");
        global.is_file().then_some(global)
    }

    pub fn apply_env_overrides_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("MARSHAL_RETRY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = value;
        }
        if let Some(value) = get("MARSHAL_RETRY_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry.base_delay_ms = value;
        }
        if let Some(value) = get("MARSHAL_LOCK_WAIT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.lock_wait_timeout_ms = value;
        }
        if let Some(value) = get("MARSHAL_TOOL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.tool_timeout_ms = value;
        }
        if let Some(value) = get("MARSHAL_EVENT_CAPACITY").and_then(|v| v.parse().ok()) {
            self.event_capacity = value;
        }
        if let Some(value) = get("MARSHAL_TASK_RETENTION_SECS").and_then(|v| v.parse().ok()) {
            self.task_retention_secs = value;
        }
        if let Some(value) = get("MARSHAL_AUTO_APPROVE_UP_TO").and_then(|v| parse_risk(&v)) {
            self.approval.auto_approve_up_to = value;
        }
    }
}

fn parse_risk(input: &str) -> Option<RiskLevel> {
    match input.trim().to_ascii_lowercase().as_str() {
        "low" => Some(RiskLevel::Low),
        "medium" => Some(RiskLevel::Medium),
        "high" => Some(RiskLevel::High),
        "critical" => Some(RiskLevel::Critical),
        _ => None,
    }
}
