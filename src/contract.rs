//! Runtime Contract Layer
//!
//! Declares the externally observable behavior of a produced image: the
//! listening port, the recognized environment keys, and the liveness probe
//! schedule. The contract performs no logic at runtime; it is metadata the
//! orchestrator consumes, validated for internal consistency at build time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::variants::{BasePolicy, VariantId};

/// Environment key the service reads its listening port from.
pub const ENV_PORT: &str = "PORT";
/// Environment key selecting release vs debug behavior.
pub const ENV_RUN_MODE: &str = "RUN_MODE";
/// Environment key controlling log verbosity.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
/// Environment key telling the binary which variant identity it serves.
pub const ENV_VARIANT: &str = "VARIANT";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Declared port {declared} does not match {ENV_PORT}={env}")]
    PortMismatch { declared: u16, env: String },

    #[error("Required environment key missing from contract: {0}")]
    MissingKey(&'static str),

    #[error("Zero-OS image cannot carry an in-container probe (no probe tool exists)")]
    ProbeNotSupported,
}

/// Liveness probe schedule: interval/timeout/retries plus the HTTP path the
/// orchestrator checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_start_period")]
    pub start_period_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_interval() -> u64 {
    30
}
fn default_timeout() -> u64 {
    10
}
fn default_start_period() -> u64 {
    5
}
fn default_retries() -> u32 {
    3
}
fn default_path() -> String {
    "/health".to_string()
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            start_period_secs: default_start_period(),
            retries: default_retries(),
            path: default_path(),
        }
    }
}

/// A single failed liveness check, as observed by the orchestrator's prober.
/// Never produced or handled inside the image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeVerdict {
    Healthy,
    Unhealthy,
}

impl HealthProbe {
    /// In-container check command for probe-capable images.
    pub fn check_command(&self, port: u16) -> String {
        format!("curl -f http://localhost:{}{} || exit 1", port, self.path)
    }

    /// Fold a window of recent check results into a verdict.
    ///
    /// The container is unhealthy once `retries` consecutive checks have
    /// failed. The verdict is for the orchestrator; the image itself takes
    /// no corrective action.
    pub fn classify(&self, recent: &[Result<(), ProbeFailure>]) -> ProbeVerdict {
        let trailing_failures = recent
            .iter()
            .rev()
            .take_while(|outcome| outcome.is_err())
            .count();
        if trailing_failures as u32 >= self.retries {
            ProbeVerdict::Unhealthy
        } else {
            ProbeVerdict::Healthy
        }
    }
}

/// Where liveness is evaluated for a given image form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "placement")]
pub enum ProbePlacement {
    /// Minimal-OS images: the orchestrator shells the check command into the
    /// container on the probe schedule.
    InContainer { probe: HealthProbe },
    /// Zero-OS images: no check tool exists inside the container; liveness
    /// must be verified by an external network probe against the port.
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContract {
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub probe: ProbePlacement,
}

impl RuntimeContract {
    /// Build the contract for one variant.
    pub fn for_variant(
        variant_id: &VariantId,
        port: u16,
        base: BasePolicy,
        probe: Option<HealthProbe>,
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert(ENV_PORT.to_string(), port.to_string());
        env.insert(ENV_RUN_MODE.to_string(), "release".to_string());
        env.insert(ENV_LOG_LEVEL.to_string(), "info".to_string());
        env.insert(ENV_VARIANT.to_string(), variant_id.clone());
        let probe = match base {
            BasePolicy::MinimalOs => ProbePlacement::InContainer {
                probe: probe.unwrap_or_default(),
            },
            BasePolicy::ZeroOs => ProbePlacement::External,
        };
        Self { port, env, probe }
    }

    /// Check the contract for internal consistency.
    ///
    /// The exposed port must match what the PORT key will make the service
    /// bind, and the probe placement must be possible under the base policy.
    pub fn validate(&self, base: BasePolicy) -> Result<(), ContractError> {
        for key in [ENV_PORT, ENV_RUN_MODE, ENV_LOG_LEVEL, ENV_VARIANT] {
            if !self.env.contains_key(key) {
                return Err(ContractError::MissingKey(key));
            }
        }
        let env_port = &self.env[ENV_PORT];
        if env_port.parse::<u16>().ok() != Some(self.port) {
            return Err(ContractError::PortMismatch {
                declared: self.port,
                env: env_port.clone(),
            });
        }
        if base == BasePolicy::ZeroOs {
            if let ProbePlacement::InContainer { .. } = self.probe {
                return Err(ContractError::ProbeNotSupported);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() -> Result<(), ProbeFailure> {
        Err(ProbeFailure {
            reason: "connection refused".to_string(),
        })
    }

    #[test]
    fn three_consecutive_failures_are_unhealthy() {
        let probe = HealthProbe::default();
        assert_eq!(probe.retries, 3);
        let window = vec![Ok(()), fail(), fail(), fail()];
        assert_eq!(probe.classify(&window), ProbeVerdict::Unhealthy);
    }

    #[test]
    fn interrupted_failures_stay_healthy() {
        let probe = HealthProbe::default();
        let window = vec![fail(), fail(), Ok(()), fail(), fail()];
        assert_eq!(probe.classify(&window), ProbeVerdict::Healthy);
    }

    #[test]
    fn contract_port_must_match_env() {
        let id = "svc-gateway".to_string();
        let mut contract =
            RuntimeContract::for_variant(&id, 8080, BasePolicy::MinimalOs, None);
        assert!(contract.validate(BasePolicy::MinimalOs).is_ok());

        contract
            .env
            .insert(ENV_PORT.to_string(), "9999".to_string());
        assert!(matches!(
            contract.validate(BasePolicy::MinimalOs),
            Err(ContractError::PortMismatch { .. })
        ));
    }

    #[test]
    fn zero_os_rejects_in_container_probe() {
        let id = "agent-billing".to_string();
        let mut contract =
            RuntimeContract::for_variant(&id, 8080, BasePolicy::ZeroOs, None);
        assert_eq!(contract.probe, ProbePlacement::External);
        assert!(contract.validate(BasePolicy::ZeroOs).is_ok());

        contract.probe = ProbePlacement::InContainer {
            probe: HealthProbe::default(),
        };
        assert!(matches!(
            contract.validate(BasePolicy::ZeroOs),
            Err(ContractError::ProbeNotSupported)
        ));
    }

    #[test]
    fn check_command_targets_declared_port() {
        let probe = HealthProbe::default();
        assert_eq!(
            probe.check_command(8080),
            "curl -f http://localhost:8080/health || exit 1"
        );
    }
}
