//! Decision-path benchmarks for the built-in algorithms

use concord_consensus::{
    Agent, ByzantineConfig, ByzantineConsensus, ConsensusAlgorithm, GossipConfig, GossipConsensus,
    InMemoryReputation, MembershipSnapshot, Proposal, ProposalId, QuorumConsensus, Topology, Vote,
    VoteDecision,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn swarm(n: usize, topology: Topology) -> MembershipSnapshot {
    MembershipSnapshot::from_agents(
        (0..n).map(|i| Agent::new(format!("agent-{i:04}"), 1.0)),
        topology,
    )
}

fn votes(id: ProposalId, n: usize, round: u64) -> Vec<Vote> {
    (0..n)
        .map(|i| {
            let decision = if i % 4 == 0 { VoteDecision::Against } else { VoteDecision::For };
            Vote::new(id, format!("agent-{i:04}"), decision).in_round(round)
        })
        .collect()
}

fn bench_quorum(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let algo = QuorumConsensus::default();
    let mut group = c.benchmark_group("quorum_decide");
    for n in [16usize, 128, 1024] {
        let snapshot = swarm(n, Topology::FullMesh);
        let id = ProposalId::new();
        let ballots = votes(id, n, 1);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                rt.block_on(algo.decide(black_box(&id), black_box(&ballots), &snapshot, false))
            })
        });
    }
    group.finish();
}

fn bench_byzantine(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("byzantine_decide");
    for f in [1usize, 5, 20] {
        let n = 3 * f + 1;
        let snapshot = swarm(n, Topology::FullMesh);
        let config = ByzantineConfig {
            fault_tolerance: f,
            ..ByzantineConfig::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    let reputation = Arc::new(InMemoryReputation::default());
                    let algo = ByzantineConsensus::new(config.clone(), reputation);
                    let proposal = Proposal::new("agent-0000", serde_json::json!("bench"));
                    let id = algo.propose(&proposal, &snapshot).await.unwrap();
                    let mut ballots = votes(id, n, 1);
                    ballots.extend(votes(id, n, 2));
                    algo.decide(&id, &ballots, &snapshot, false).await.unwrap()
                })
            })
        });
    }
    group.finish();
}

fn bench_gossip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let algo = GossipConsensus::new(GossipConfig::default().with_seed(1));
    let mut group = c.benchmark_group("gossip_converge");
    for n in [16usize, 64, 256] {
        let snapshot = swarm(n, Topology::Hierarchical { fanout: 4 });
        let id = ProposalId::new();
        let ballots = votes(id, n, 1);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| rt.block_on(algo.decide(&id, black_box(&ballots), &snapshot, false)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_quorum, bench_byzantine, bench_gossip);
criterion_main!(benches);
