//! # Concord Consensus
//!
//! Pluggable consensus for agent swarms.
//!
//! A [`ConsensusManager`] keeps the swarm membership and a registry of named
//! algorithms. Callers submit a [`Proposal`] under an algorithm name; the
//! manager collects votes until the algorithm can decide or the deadline
//! passes, and returns a [`ConsensusOutcome`].
//!
//! ## Algorithms
//!
//! - **quorum**: FOR votes reach `ceil(threshold * n)` and outnumber AGAINST
//! - **weighted**: FOR weight reaches a share of the total eligible weight
//! - **byzantine**: multi-round voting with malicious-agent detection, `n >= 3f+1`
//! - **leader**: Raft-style terms and a replicated log with total commit order
//! - **gossip**: seeded epidemic dissemination reporting convergence, not a verdict
//!
//! ## Example
//!
//! ```rust,no_run
//! use concord_consensus::{ConsensusManager, MembershipRegistry, Proposal, Vote, VoteDecision};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(MembershipRegistry::new());
//!     for agent in ["scout", "worker", "planner"] {
//!         registry.add_agent(agent, 1.0)?;
//!     }
//!     let manager = Arc::new(ConsensusManager::with_defaults(registry));
//!
//!     let proposal = Proposal::new("planner", serde_json::json!({"action": "scale_out"}));
//!     let id = proposal.id;
//!
//!     let voter = Arc::clone(&manager);
//!     tokio::spawn(async move {
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!         for agent in ["scout", "worker"] {
//!             let _ = voter.submit_vote(Vote::new(id, agent, VoteDecision::For));
//!         }
//!     });
//!
//!     let outcome = manager
//!         .request_consensus(proposal, "quorum", Some(Duration::from_secs(1)))
//!         .await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod algorithms;
pub mod config;
pub mod error;
pub mod manager;
pub mod membership;
pub mod reputation;
pub mod traits;
pub mod types;
pub mod voting;

pub use algorithms::{
    ByzantineConsensus, GossipConsensus, LeaderConsensus, QuorumConsensus, WeightedConsensus,
};
pub use config::{
    ByzantineConfig, ConsensusConfig, DetectionPolicy, GossipConfig, LeaderConfig, QuorumConfig,
    WeightedConfig,
};
pub use error::{ConsensusError, Result};
pub use manager::{ConsensusManager, ConsensusStats};
pub use membership::{
    Agent, AgentStatus, MembershipEvent, MembershipRegistry, MembershipSnapshot, Topology,
};
pub use reputation::{InMemoryReputation, Offense, ReputationStore};
pub use traits::{ConsensusAlgorithm, NoopAnnouncer, Progress, ProposalAnnouncer, VoteSink};
pub use types::{
    AgentId, AlgorithmMetadata, ConsensusDecision, ConsensusOutcome, ConsensusResult,
    GossipConvergence, Proposal, ProposalId, Vote, VoteDecision, VoteTally,
};
pub use voting::BallotBox;
