//! Property tests for the deterministic algorithms

use concord_consensus::{
    Agent, AlgorithmMetadata, ByzantineConfig, ByzantineConsensus, ConsensusAlgorithm,
    ConsensusDecision, ConsensusOutcome, InMemoryReputation, MembershipSnapshot, Proposal,
    ProposalId, QuorumConfig, QuorumConsensus, Topology, Vote, VoteDecision, WeightedConfig,
    WeightedConsensus,
};
use proptest::prelude::*;
use std::sync::Arc;
use tokio_test::block_on;

fn decision_strategy() -> impl Strategy<Value = VoteDecision> {
    prop_oneof![
        Just(VoteDecision::For),
        Just(VoteDecision::Against),
        Just(VoteDecision::Abstain),
    ]
}

fn swarm(n: usize) -> MembershipSnapshot {
    MembershipSnapshot::from_agents(
        (0..n).map(|i| Agent::new(format!("agent-{i:02}"), 1.0 + i as f64)),
        Topology::FullMesh,
    )
}

fn ballots(id: ProposalId, decisions: &[VoteDecision]) -> Vec<Vote> {
    decisions
        .iter()
        .enumerate()
        .map(|(i, d)| Vote::new(id, format!("agent-{i:02}"), *d))
        .collect()
}

fn verdict(outcome: ConsensusOutcome) -> (ConsensusDecision, usize) {
    let result = outcome.as_deterministic().unwrap();
    (result.decision, result.tally.for_votes)
}

proptest! {
    #[test]
    fn quorum_ignores_arrival_order(
        decisions in prop::collection::vec(decision_strategy(), 1..20),
        threshold in 0.1f64..=1.0,
        seed in any::<u64>(),
    ) {
        let algo = QuorumConsensus::new(QuorumConfig { threshold });
        let snapshot = swarm(decisions.len());
        let id = ProposalId::new();
        let votes = ballots(id, &decisions);

        let mut shuffled = votes.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();

        let a = block_on(algo.decide(&id, &votes, &snapshot, false)).unwrap();
        let b = block_on(algo.decide(&id, &shuffled, &snapshot, false)).unwrap();
        prop_assert_eq!(verdict(a), verdict(b));
    }

    #[test]
    fn quorum_approval_matches_rule(
        decisions in prop::collection::vec(decision_strategy(), 1..20),
        threshold in 0.1f64..=1.0,
    ) {
        let algo = QuorumConsensus::new(QuorumConfig { threshold });
        let n = decisions.len();
        let id = ProposalId::new();
        let votes = ballots(id, &decisions);
        let outcome = block_on(algo.decide(&id, &votes, &swarm(n), false)).unwrap();
        let result = outcome.as_deterministic().unwrap();

        let for_votes = decisions.iter().filter(|d| **d == VoteDecision::For).count();
        let against = decisions.iter().filter(|d| **d == VoteDecision::Against).count();
        // Strictly above the boundary, or everyone when the boundary is n itself
        let boundary = threshold * n as f64;
        let clears = for_votes as f64 > boundary + 1e-9 || for_votes == n;
        prop_assert_eq!(result.is_approved(), clears && for_votes > against);
        let smallest_above = (1..=n).find(|k| *k as f64 > boundary + 1e-9);
        prop_assert_eq!(algo.required(n), smallest_above.unwrap_or(n));
        let on_boundary = (for_votes as f64 - boundary).abs() < 1e-9 && for_votes < n;
        if for_votes == against || on_boundary {
            prop_assert!(!result.is_approved());
        }
    }

    #[test]
    fn weighted_never_approves_below_threshold(
        decisions in prop::collection::vec(decision_strategy(), 1..16),
        threshold in 0.1f64..=1.0,
    ) {
        let algo = WeightedConsensus::new(WeightedConfig { threshold });
        let snapshot = swarm(decisions.len());
        let id = ProposalId::new();
        let votes = ballots(id, &decisions);
        let outcome = block_on(algo.decide(&id, &votes, &snapshot, false)).unwrap();
        let result = outcome.as_deterministic().unwrap();

        let share = result.tally.for_weight / result.tally.eligible_weight;
        if result.is_approved() {
            prop_assert!(share + 1e-9 >= threshold);
        } else {
            prop_assert!(share < threshold + 1e-9);
        }
    }

    #[test]
    fn byzantine_outcome_survives_reordering_with_f_faulty(
        f in 1usize..3,
        honest_decision in prop::bool::ANY,
        faulty_pattern in prop::collection::vec(decision_strategy(), 3),
        rotation in 0usize..64,
    ) {
        let config = ByzantineConfig { fault_tolerance: f, ..ByzantineConfig::default() };
        let n = 3 * f + 1;
        let snapshot = swarm(n);
        let honest = if honest_decision { VoteDecision::For } else { VoteDecision::Against };

        let run = |rotate: usize| {
            let reputation = Arc::new(InMemoryReputation::default());
            let algo = ByzantineConsensus::new(config.clone(), reputation);
            block_on(async {
                let proposal = Proposal::new("agent-00", serde_json::json!({"f": f}));
                let id = algo.propose(&proposal, &snapshot).await.unwrap();
                let mut votes = Vec::new();
                for round in 1..=config.max_rounds {
                    for i in 0..n {
                        let decision = if i < f {
                            faulty_pattern[(round - 1) as usize]
                        } else {
                            honest
                        };
                        let voter = format!("agent-{i:02}");
                        votes.push(Vote::new(id, voter, decision).in_round(round));
                    }
                }
                let len = votes.len();
                votes.rotate_left(rotate % len);
                algo.decide(&id, &votes, &snapshot, false).await.unwrap()
            })
        };

        let a = run(0);
        let b = run(rotation);
        let ra = a.as_deterministic().unwrap();
        let rb = b.as_deterministic().unwrap();
        prop_assert_eq!(ra.decision, rb.decision);
        prop_assert_eq!(ra.is_approved(), honest_decision);

        if let AlgorithmMetadata::Byzantine { malicious_count, byzantine_safe, .. } = &ra.metadata {
            prop_assert!(*malicious_count <= f);
            prop_assert!(*byzantine_safe);
        } else {
            prop_assert!(false, "expected byzantine metadata");
        }
    }
}

fn split(for_votes: usize, against: usize) -> Vec<VoteDecision> {
    let mut decisions = vec![VoteDecision::For; for_votes];
    decisions.extend(vec![VoteDecision::Against; against]);
    decisions
}

#[tokio::test]
async fn quorum_of_ten_needs_six() {
    let algo = QuorumConsensus::default();
    let snapshot = swarm(10);

    let id = ProposalId::new();
    let outcome = algo.decide(&id, &ballots(id, &split(6, 4)), &snapshot, false).await.unwrap();
    assert_eq!(verdict(outcome), (ConsensusDecision::Approved, 6));

    let id = ProposalId::new();
    let outcome = algo.decide(&id, &ballots(id, &split(5, 5)), &snapshot, false).await.unwrap();
    assert_eq!(verdict(outcome), (ConsensusDecision::Rejected, 5));
}

#[tokio::test]
async fn weighted_example_clears_sixty_five_percent() {
    let algo = WeightedConsensus::new(WeightedConfig { threshold: 0.65 });
    let weights = [("a", 3.0), ("b", 2.0), ("c", 2.0), ("d", 2.5), ("e", 2.5)];
    let snapshot = MembershipSnapshot::from_agents(
        weights.iter().map(|(name, weight)| Agent::new(*name, *weight)),
        Topology::FullMesh,
    );

    let id = ProposalId::new();
    let votes: Vec<Vote> = weights
        .iter()
        .map(|(name, _)| {
            let decision = if *name == "d" { VoteDecision::Against } else { VoteDecision::For };
            Vote::new(id, *name, decision)
        })
        .collect();
    let outcome = algo.decide(&id, &votes, &snapshot, false).await.unwrap();
    let result = outcome.as_deterministic().unwrap();

    assert!(result.is_approved());
    assert!((result.tally.for_weight - 9.5).abs() < 1e-9);
    assert!((result.tally.eligible_weight - 12.0).abs() < 1e-9);
}
