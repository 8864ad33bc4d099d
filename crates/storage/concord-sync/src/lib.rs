//! # Concord Sync
//!
//! Keeps keyed shared state consistent across the members of a swarm.
//!
//! Every `(swarm, key)` pair carries a monotonically increasing version.
//! Writes are broadcast to the agent's peers under the current
//! [`Topology`](concord_consensus::Topology) (all-to-all in a full mesh,
//! relayed along the tree when hierarchical). Divergent versions go through
//! the [`ConflictResolver`]:
//!
//! - **last-write-wins**: higher version wins, ties go to the greater writer id
//! - **crdt**: type-specific merge for keys declared as counter, set or register
//! - **manual**: a [`ConflictRecord`] is raised and nothing changes until
//!   [`StateSynchronizer::resolve_conflict`] is called
//!
//! Resolved entries are persisted through a [`StateStore`] before they are
//! acknowledged, and each committed change gets a gap-free per-swarm
//! sequence number. [`StateSynchronizer::delta_sync`] serves those changes
//! to reconnecting replicas and falls back to a full transfer once the
//! requested range has been compacted.
//!
//! Unreachable peers are retried with bounded exponential backoff and then
//! reported in the [`SyncReport`]; synchronization never fails because a peer
//! is down.
//!
//! ```rust,no_run
//! use concord_consensus::MembershipRegistry;
//! use concord_sync::{
//!     InMemoryStateStore, InProcessNetwork, StateSynchronizer, SwarmId, SyncConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> concord_sync::Result<()> {
//! let registry = Arc::new(MembershipRegistry::new());
//! registry.add_agent("agent-a", 1.0)?;
//! registry.add_agent("agent-b", 1.0)?;
//!
//! let network = InProcessNetwork::new();
//! let a = Arc::new(StateSynchronizer::new(
//!     "agent-a",
//!     registry.clone(),
//!     Arc::new(InMemoryStateStore::new()),
//!     network.clone(),
//!     SyncConfig::default(),
//! )?);
//! network.join(&a);
//!
//! let swarm = SwarmId::from("swarm-1");
//! a.set_state(&swarm, "plan", serde_json::json!({"step": 1}), None).await?;
//! let complete = a.synchronize_state(&swarm, "plan").await?;
//! # let _ = complete;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod recorder;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod synchronizer;
pub mod types;

pub use config::{RetryConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use link::{InProcessNetwork, PeerLink};
pub use recorder::record_membership;
pub use resolver::{ConflictResolver, Resolution};
pub use retry::RetryPolicy;
pub use store::{AgentRecord, EventRecord, InMemoryStateStore, SqliteStateStore, StateStore};
pub use synchronizer::{CatchUpReport, StateSynchronizer};
pub use types::{
    value_digest, ChangeCause, ConflictRecord, DeltaSync, ResolutionStrategy, StateChange,
    StateEntry, SwarmId, SyncReport, VersionedValue,
};
