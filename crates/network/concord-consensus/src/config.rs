//! Configuration for the consensus engine

use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Deadline applied when a request does not carry its own
    pub default_timeout_ms: u64,
    /// Upper bound on the serialized proposal payload
    pub max_payload_bytes: usize,
    /// Mark agents detected by the Byzantine algorithm as malicious in the registry
    pub flag_detected_malicious: bool,
    /// Finished outcomes kept for `result` lookups; the oldest are evicted first
    pub max_retained_results: usize,
    pub quorum: QuorumConfig,
    pub weighted: WeightedConfig,
    pub byzantine: ByzantineConfig,
    pub leader: LeaderConfig,
    pub gossip: GossipConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_payload_bytes: 1024 * 1024,
            flag_detected_malicious: true,
            max_retained_results: 1024,
            quorum: QuorumConfig::default(),
            weighted: WeightedConfig::default(),
            byzantine: ByzantineConfig::default(),
            leader: LeaderConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_quorum_threshold(mut self, threshold: f64) -> Self {
        self.quorum.threshold = threshold;
        self
    }

    pub fn with_weighted_threshold(mut self, threshold: f64) -> Self {
        self.weighted.threshold = threshold;
        self
    }

    /// Set the number of tolerated Byzantine agents (f)
    pub fn with_fault_tolerance(mut self, f: usize) -> Self {
        self.byzantine.fault_tolerance = f;
        self
    }

    pub fn with_byzantine_rounds(mut self, rounds: u64) -> Self {
        self.byzantine.max_rounds = rounds;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.leader.election_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_flag_detected_malicious(mut self, enabled: bool) -> Self {
        self.flag_detected_malicious = enabled;
        self
    }

    pub fn with_max_retained_results(mut self, limit: usize) -> Self {
        self.max_retained_results = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(invalid("default_timeout_ms must be positive"));
        }
        if self.max_payload_bytes == 0 {
            return Err(invalid("max_payload_bytes must be positive"));
        }
        validate_threshold("quorum.threshold", self.quorum.threshold)?;
        validate_threshold("weighted.threshold", self.weighted.threshold)?;
        self.byzantine.validate()?;
        if self.leader.election_timeout_ms == 0 {
            return Err(invalid("leader.election_timeout_ms must be positive"));
        }
        self.gossip.validate()
    }
}

/// Simple count threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Fraction of eligible agents that must vote FOR, in (0, 1]
    pub threshold: f64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightedConfig {
    /// Fraction of eligible weight that must vote FOR, in (0, 1]
    pub threshold: f64,
}

impl Default for WeightedConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByzantineConfig {
    /// Tolerated faulty agents (f); requires n >= 3f+1
    pub fault_tolerance: usize,
    /// Rounds run while the swarm still disagrees
    pub max_rounds: u64,
    pub detection: DetectionPolicy,
}

impl Default for ByzantineConfig {
    fn default() -> Self {
        Self {
            fault_tolerance: 1,
            max_rounds: 3,
            detection: DetectionPolicy::default(),
        }
    }
}

impl ByzantineConfig {
    /// Minimum eligible participants (3f+1)
    pub fn min_participants(&self) -> usize {
        3 * self.fault_tolerance + 1
    }

    /// Honest FOR votes needed to approve (2f+1)
    pub fn approval_quorum(&self) -> usize {
        2 * self.fault_tolerance + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(invalid("byzantine.max_rounds must be at least 1"));
        }
        if self.detection.min_inconsistent_rounds == 0 {
            return Err(invalid(
                "byzantine.detection.min_inconsistent_rounds must be at least 1",
            ));
        }
        Ok(())
    }
}

/// When an agent counts as malicious.
///
/// An agent is flagged once its non-abstain votes disagree with the eventual
/// majority in at least `min_inconsistent_rounds` rounds. With
/// `require_equivocation` the agent must also have changed its vote between
/// rounds, which spares consistent dissenters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionPolicy {
    pub min_inconsistent_rounds: usize,
    pub require_equivocation: bool,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            min_inconsistent_rounds: 2,
            require_equivocation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// A term ends when the leader stays silent this long
    pub election_timeout_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1_500,
        }
    }
}

impl LeaderConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Peers contacted by each agent per round
    pub fanout: usize,
    /// Consecutive rounds the leading opinion must hold
    pub stable_rounds: usize,
    pub max_rounds: usize,
    /// Share of agents that must hold the leading opinion
    pub convergence_ratio: f64,
    /// Fixed RNG seed; derived from the proposal id when unset
    pub seed: Option<u64>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            stable_rounds: 3,
            max_rounds: 32,
            convergence_ratio: 0.9,
            seed: None,
        }
    }
}

impl GossipConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fanout == 0 {
            return Err(invalid("gossip.fanout must be at least 1"));
        }
        if self.stable_rounds == 0 || self.max_rounds < self.stable_rounds {
            return Err(invalid(
                "gossip.stable_rounds must be between 1 and gossip.max_rounds",
            ));
        }
        validate_threshold("gossip.convergence_ratio", self.convergence_ratio)
    }
}

fn invalid(msg: &str) -> ConsensusError {
    ConsensusError::InvalidConfiguration(msg.to_string())
}

fn validate_threshold(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(ConsensusError::InvalidConfiguration(format!(
            "{name} must be in (0, 1], got {value}"
        )));
    }
    Ok(())
}
