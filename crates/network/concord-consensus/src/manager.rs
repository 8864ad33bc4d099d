//! Consensus manager: the caller-facing entry point
//!
//! The manager owns the membership registry and the algorithm registry. A
//! request validates the proposal, announces it, collects votes until the
//! algorithm is ready, the deadline passes, or the caller cancels, and then
//! decides against the membership snapshot taken at decide time.

use crate::algorithms::{
    ByzantineConsensus, GossipConsensus, LeaderConsensus, QuorumConsensus, WeightedConsensus,
};
use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::membership::{Agent, AgentStatus, MembershipRegistry, MembershipSnapshot};
use crate::reputation::{InMemoryReputation, ReputationStore};
use crate::traits::{ConsensusAlgorithm, NoopAnnouncer, Progress, ProposalAnnouncer, VoteSink};
use crate::types::{
    AgentId, AlgorithmMetadata, ConsensusDecision, ConsensusOutcome, Proposal, ProposalId, Vote,
};
use crate::voting::{BallotBox, VoteReceipt};
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Aggregate counters for the lifetime of a manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusStats {
    pub requests: u64,
    pub approved: u64,
    pub rejected: u64,
    pub converged: u64,
    pub not_converged: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub votes_received: u64,
    pub superseded_votes: u64,
    pub avg_decision_ms: f64,
}

struct PendingRequest {
    algorithm: Arc<dyn ConsensusAlgorithm>,
    sink: VoteSink,
    ballot: Arc<Mutex<BallotBox>>,
    cancel: watch::Sender<bool>,
    wake: Arc<Notify>,
}

/// Algorithm cleanups still running for abandoned requests, keyed by proposal
type Draining = Arc<DashMap<ProposalId, Arc<Notify>>>;

/// Releases a pending request when `request_consensus` is dropped before it
/// returns, e.g. under `tokio::time::timeout` or a losing `select!` branch.
struct PendingGuard<'a> {
    pending: &'a DashMap<ProposalId, PendingRequest>,
    draining: &'a Draining,
    proposal_id: ProposalId,
    algorithm: Arc<dyn ConsensusAlgorithm>,
    wake: Arc<Notify>,
    armed: bool,
}

impl PendingGuard<'_> {
    /// Remove the pending entry if it still belongs to this request
    fn release(&self) {
        self.pending
            .remove_if(&self.proposal_id, |_, p| Arc::ptr_eq(&p.wake, &self.wake));
    }

    fn disarm(&mut self) {
        self.release();
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.release();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                proposal = %self.proposal_id,
                "Request dropped outside a runtime; algorithm state kept"
            );
            return;
        };

        let done = Arc::new(Notify::new());
        self.draining.insert(self.proposal_id, Arc::clone(&done));
        let draining = Arc::clone(self.draining);
        let algorithm = Arc::clone(&self.algorithm);
        let proposal_id = self.proposal_id;
        runtime.spawn(async move {
            algorithm.cancel(&proposal_id).await;
            draining.remove_if(&proposal_id, |_, n| Arc::ptr_eq(n, &done));
            done.notify_one();
        });
        counter!("concord_consensus_abandoned_total").increment(1);
        debug!(proposal = %proposal_id, "Abandoned request released");
    }
}

pub struct ConsensusManager {
    registry: Arc<MembershipRegistry>,
    algorithms: RwLock<HashMap<String, Arc<dyn ConsensusAlgorithm>>>,
    announcer: Arc<dyn ProposalAnnouncer>,
    pending: DashMap<ProposalId, PendingRequest>,
    draining: Draining,
    results: DashMap<ProposalId, ConsensusOutcome>,
    result_order: Mutex<VecDeque<ProposalId>>,
    stats: RwLock<ConsensusStats>,
    config: ConsensusConfig,
}

impl ConsensusManager {
    /// Manager with no algorithms registered
    pub fn new(registry: Arc<MembershipRegistry>, config: ConsensusConfig) -> Self {
        Self {
            registry,
            algorithms: RwLock::new(HashMap::new()),
            announcer: Arc::new(NoopAnnouncer),
            pending: DashMap::new(),
            draining: Arc::new(DashMap::new()),
            results: DashMap::new(),
            result_order: Mutex::new(VecDeque::new()),
            stats: RwLock::new(ConsensusStats::default()),
            config,
        }
    }

    /// Manager with quorum, weighted, byzantine, leader and gossip registered
    pub fn with_builtin_algorithms(
        registry: Arc<MembershipRegistry>,
        config: ConsensusConfig,
        reputation: Arc<dyn ReputationStore>,
    ) -> Self {
        let manager = Self::new(registry, config.clone());
        manager.register_algorithm(Arc::new(QuorumConsensus::new(config.quorum.clone())));
        manager.register_algorithm(Arc::new(WeightedConsensus::new(config.weighted.clone())));
        manager.register_algorithm(Arc::new(ByzantineConsensus::new(
            config.byzantine.clone(),
            reputation,
        )));
        manager.register_algorithm(Arc::new(LeaderConsensus::new(config.leader.clone())));
        manager.register_algorithm(Arc::new(GossipConsensus::new(config.gossip.clone())));
        manager
    }

    /// Built-in algorithms backed by an in-memory reputation store
    pub fn with_defaults(registry: Arc<MembershipRegistry>) -> Self {
        Self::with_builtin_algorithms(
            registry,
            ConsensusConfig::default(),
            Arc::new(InMemoryReputation::default()),
        )
    }

    pub fn with_announcer(mut self, announcer: Arc<dyn ProposalAnnouncer>) -> Self {
        self.announcer = announcer;
        self
    }

    /// Register an algorithm under its name; returns the one it replaced
    pub fn register_algorithm(
        &self,
        algorithm: Arc<dyn ConsensusAlgorithm>,
    ) -> Option<Arc<dyn ConsensusAlgorithm>> {
        let name = algorithm.name().to_string();
        debug!(algorithm = %name, "Registering consensus algorithm");
        self.algorithms.write().insert(name, algorithm)
    }

    pub fn algorithm(&self, name: &str) -> Option<Arc<dyn ConsensusAlgorithm>> {
        self.algorithms.read().get(name).cloned()
    }

    /// Registered algorithm names, sorted
    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.algorithms.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn ConsensusAlgorithm>> {
        self.algorithm(name)
            .ok_or_else(|| ConsensusError::UnknownAlgorithm(name.to_string()))
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        self.registry.snapshot()
    }

    pub fn add_agent(&self, id: impl Into<AgentId>, weight: f64) -> Result<Agent> {
        let agent = self.registry.add_agent(id, weight)?;
        self.wake_pending();
        Ok(agent)
    }

    /// Remove an agent and drop its votes from every pending request
    pub fn remove_agent(&self, id: &AgentId) -> Option<Agent> {
        let removed = self.registry.remove_agent(id)?;
        for entry in self.pending.iter() {
            let dropped = entry.ballot.lock().discard_agent(id);
            if dropped > 0 {
                debug!(
                    proposal = %entry.key(),
                    agent = %id,
                    dropped,
                    "Discarded votes of departed agent"
                );
            }
            entry.wake.notify_one();
        }
        Some(removed)
    }

    pub fn flag_agent(&self, id: &AgentId, status: AgentStatus) -> Result<AgentStatus> {
        if status == AgentStatus::Removed {
            return self
                .remove_agent(id)
                .map(|_| AgentStatus::Removed)
                .ok_or_else(|| ConsensusError::AgentNotFound(id.clone()));
        }
        let previous = self.registry.flag_agent(id, status)?;
        self.wake_pending();
        Ok(previous)
    }

    fn wake_pending(&self) {
        for entry in self.pending.iter() {
            entry.wake.notify_one();
        }
    }

    /// Validate a proposal and hand it to an algorithm without collecting votes
    pub async fn propose(&self, proposal: &Proposal, algorithm: &str) -> Result<ProposalId> {
        let algorithm = self.lookup(algorithm)?;
        proposal.validate(self.config.max_payload_bytes)?;
        algorithm.propose(proposal, &self.registry.snapshot()).await
    }

    /// Decide a proposal from externally collected votes
    pub async fn decide(
        &self,
        algorithm: &str,
        proposal_id: &ProposalId,
        votes: &[Vote],
        timeout_reached: bool,
    ) -> Result<ConsensusOutcome> {
        let algorithm = self.lookup(algorithm)?;
        let snapshot = self.registry.snapshot();
        let outcome = algorithm
            .decide(proposal_id, votes, &snapshot, timeout_reached)
            .await?;
        self.finish(&outcome, None);
        Ok(outcome)
    }

    /// Run a proposal to completion.
    ///
    /// Returns an outcome whether or not the deadline passed; only
    /// validation failures, unknown algorithms, insufficient participants
    /// and cancellation surface as errors. Dropping the returned future
    /// releases the request, so the same id can be proposed again.
    pub async fn request_consensus(
        &self,
        proposal: Proposal,
        algorithm: &str,
        timeout: Option<Duration>,
    ) -> Result<ConsensusOutcome> {
        let algorithm = self.lookup(algorithm)?;
        proposal.validate(self.config.max_payload_bytes)?;
        if self.pending.contains_key(&proposal.id) {
            return Err(ConsensusError::InvalidProposal(format!(
                "proposal {} is already pending",
                proposal.id
            )));
        }
        if let Some((_, done)) = self.draining.remove(&proposal.id) {
            // Let the previous attempt's cleanup finish before reopening the id
            done.notified().await;
        }

        let started = Instant::now();
        let deadline = started + timeout.unwrap_or_else(|| self.config.default_timeout());
        let snapshot = self.registry.snapshot();
        let proposal_id = algorithm.propose(&proposal, &snapshot).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (cancel, mut cancelled) = watch::channel(false);
        let sink = VoteSink::new(proposal_id, tx);
        let ballot = Arc::new(Mutex::new(BallotBox::new(proposal_id)));
        let wake = Arc::new(Notify::new());
        self.pending.insert(
            proposal_id,
            PendingRequest {
                algorithm: Arc::clone(&algorithm),
                sink: sink.clone(),
                ballot: Arc::clone(&ballot),
                cancel,
                wake: Arc::clone(&wake),
            },
        );
        let mut guard = PendingGuard {
            pending: &self.pending,
            draining: &self.draining,
            proposal_id,
            algorithm: Arc::clone(&algorithm),
            wake: Arc::clone(&wake),
            armed: true,
        };
        self.stats.write().requests += 1;
        counter!("concord_consensus_requests_total", "algorithm" => algorithm.name().to_string())
            .increment(1);
        info!(
            proposal = %proposal_id,
            algorithm = algorithm.name(),
            participants = snapshot.eligible_count(),
            "Consensus requested"
        );

        let first_round = algorithm.current_round(&proposal_id);
        self.announce(&proposal, first_round, &snapshot, &sink).await;

        let timeout_reached = loop {
            let ready = tokio::select! {
                biased;
                _ = cancelled.changed() => {
                    guard.disarm();
                    algorithm.cancel(&proposal_id).await;
                    return Err(ConsensusError::Cancelled(proposal_id));
                }
                vote = rx.recv() => match vote {
                    Some(vote) => {
                        self.stats.write().votes_received += 1;
                        algorithm.heartbeat(&vote.agent_id);
                        if ballot.lock().record(vote) == VoteReceipt::Superseded {
                            self.stats.write().superseded_votes += 1;
                        }
                        self.evaluate(&algorithm, &proposal, &proposal_id, &ballot, &sink)
                            .await
                    }
                    None => true,
                },
                _ = wake.notified() => {
                    self.evaluate(&algorithm, &proposal, &proposal_id, &ballot, &sink)
                        .await
                }
                _ = tokio::time::sleep_until(deadline) => break true,
            };
            if ready {
                break false;
            }
        };

        let votes = ballot.lock().votes().to_vec();
        let decide_snapshot = self.registry.snapshot();
        let decided = algorithm
            .decide(&proposal_id, &votes, &decide_snapshot, timeout_reached)
            .await;
        guard.disarm();

        match decided {
            Ok(outcome) => {
                self.finish(&outcome, Some(started.elapsed()));
                Ok(outcome)
            }
            Err(err) => {
                self.stats.write().failed += 1;
                warn!(proposal = %proposal_id, error = %err, "Consensus decision failed");
                Err(err)
            }
        }
    }

    /// Re-check progress; returns true once the algorithm is ready to decide
    async fn evaluate(
        &self,
        algorithm: &Arc<dyn ConsensusAlgorithm>,
        proposal: &Proposal,
        proposal_id: &ProposalId,
        ballot: &Arc<Mutex<BallotBox>>,
        sink: &VoteSink,
    ) -> bool {
        let votes = ballot.lock().votes().to_vec();
        let snapshot = self.registry.snapshot();
        match algorithm.progress(proposal_id, &votes, &snapshot) {
            Progress::Ready => true,
            Progress::Collecting => false,
            Progress::Advance(round) => {
                debug!(proposal = %proposal_id, round, "Announcing next round");
                self.announce(proposal, round, &snapshot, sink).await;
                false
            }
        }
    }

    async fn announce(
        &self,
        proposal: &Proposal,
        round: u64,
        snapshot: &MembershipSnapshot,
        sink: &VoteSink,
    ) {
        let mut announced = proposal.clone();
        announced.round = round;
        let voters = snapshot.eligible_ids();
        if let Err(err) = self
            .announcer
            .announce(&announced, round, &voters, sink.clone())
            .await
        {
            // Votes may still arrive through submit_vote
            warn!(proposal = %proposal.id, round, error = %err, "Proposal announcement failed");
        }
    }

    fn finish(&self, outcome: &ConsensusOutcome, elapsed: Option<Duration>) {
        let algorithm = outcome.algorithm().to_string();
        let label = match outcome {
            ConsensusOutcome::Deterministic(r) if r.decision == ConsensusDecision::Approved => {
                "approved"
            }
            ConsensusOutcome::Deterministic(_) => "rejected",
            ConsensusOutcome::Probabilistic(c) if c.converged => "converged",
            ConsensusOutcome::Probabilistic(_) => "not_converged",
        };

        {
            let mut stats = self.stats.write();
            match label {
                "approved" => stats.approved += 1,
                "rejected" => stats.rejected += 1,
                "converged" => stats.converged += 1,
                _ => stats.not_converged += 1,
            }
            if outcome.timeout_reached() {
                stats.timeouts += 1;
            }
            if let Some(elapsed) = elapsed {
                let decided =
                    stats.approved + stats.rejected + stats.converged + stats.not_converged;
                let ms = elapsed.as_secs_f64() * 1000.0;
                stats.avg_decision_ms += (ms - stats.avg_decision_ms) / (decided as f64).max(1.0);
            }
        }

        counter!(
            "concord_consensus_outcomes_total",
            "algorithm" => algorithm.clone(),
            "outcome" => label
        )
        .increment(1);
        if outcome.timeout_reached() {
            counter!("concord_consensus_timeouts_total", "algorithm" => algorithm.clone())
                .increment(1);
        }
        if let Some(elapsed) = elapsed {
            histogram!("concord_consensus_decision_seconds", "algorithm" => algorithm.clone())
                .record(elapsed.as_secs_f64());
        }

        if let ConsensusOutcome::Deterministic(result) = outcome {
            if let AlgorithmMetadata::Byzantine { malicious_agents, .. } = &result.metadata {
                if self.config.flag_detected_malicious {
                    for agent in malicious_agents {
                        if let Err(err) = self.registry.flag_agent(agent, AgentStatus::Malicious) {
                            debug!(agent = %agent, error = %err, "Could not flag detected agent");
                        }
                    }
                }
            }
        }

        info!(
            proposal = %outcome.proposal_id(),
            algorithm = %algorithm,
            outcome = label,
            timeout_reached = outcome.timeout_reached(),
            "Consensus finished"
        );
        self.retain_result(outcome);
    }

    fn retain_result(&self, outcome: &ConsensusOutcome) {
        let id = outcome.proposal_id();
        let mut order = self.result_order.lock();
        if self.results.insert(id, outcome.clone()).is_none() {
            order.push_back(id);
        }
        while order.len() > self.config.max_retained_results {
            if let Some(oldest) = order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }

    /// Forward a liveness signal from `agent` to every algorithm.
    ///
    /// Leader-based consensus re-elects once its leader stays silent past the
    /// election timeout; an idle leader calls this to keep its term.
    pub fn heartbeat(&self, agent: &AgentId) -> bool {
        let algorithms: Vec<Arc<dyn ConsensusAlgorithm>> =
            self.algorithms.read().values().cloned().collect();
        algorithms
            .iter()
            .fold(false, |acted, algorithm| algorithm.heartbeat(agent) || acted)
    }

    /// Feed a vote into a pending request
    pub fn submit_vote(&self, vote: Vote) -> Result<()> {
        let pending = self
            .pending
            .get(&vote.proposal_id)
            .ok_or(ConsensusError::UnknownProposal(vote.proposal_id))?;
        pending.sink.submit(vote)
    }

    /// Round in which a pending request currently expects votes
    pub fn current_round(&self, proposal_id: &ProposalId) -> Option<u64> {
        self.pending
            .get(proposal_id)
            .map(|p| p.algorithm.current_round(proposal_id))
    }

    /// Cancel a pending request; a no-op for unknown or finished proposals
    pub async fn cancel(&self, proposal_id: &ProposalId) -> Result<()> {
        match self.pending.remove(proposal_id) {
            Some((_, pending)) => {
                let _ = pending.cancel.send(true);
                pending.algorithm.cancel(proposal_id).await;
                self.stats.write().cancelled += 1;
                counter!("concord_consensus_cancelled_total").increment(1);
                info!(proposal = %proposal_id, "Consensus request cancelled");
            }
            None => {
                let algorithms: Vec<Arc<dyn ConsensusAlgorithm>> =
                    self.algorithms.read().values().cloned().collect();
                for algorithm in algorithms {
                    algorithm.cancel(proposal_id).await;
                }
            }
        }
        Ok(())
    }

    pub fn is_pending(&self, proposal_id: &ProposalId) -> bool {
        self.pending.contains_key(proposal_id)
    }

    pub fn pending_proposals(&self) -> Vec<ProposalId> {
        self.pending.iter().map(|e| *e.key()).collect()
    }

    /// Outcome of a finished proposal, while it is still retained
    pub fn result(&self, proposal_id: &ProposalId) -> Option<ConsensusOutcome> {
        self.results.get(proposal_id).map(|r| r.value().clone())
    }

    /// Drop a retained outcome once the caller has consumed it
    pub fn forget_result(&self, proposal_id: &ProposalId) -> Option<ConsensusOutcome> {
        let mut order = self.result_order.lock();
        let (_, outcome) = self.results.remove(proposal_id)?;
        order.retain(|id| id != proposal_id);
        Some(outcome)
    }

    pub fn retained_results(&self) -> usize {
        self.results.len()
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats.read().clone()
    }
}
