//! Built-in consensus algorithms

pub mod byzantine;
pub mod gossip;
pub mod leader;
pub mod quorum;
pub mod weighted;

pub use byzantine::{ByzantineConsensus, BYZANTINE};
pub use gossip::{GossipConsensus, GOSSIP};
pub use leader::{EntryState, LeaderConsensus, LogEntry, LEADER};
pub use quorum::{QuorumConsensus, QUORUM};
pub use weighted::{WeightedConsensus, WEIGHTED};
