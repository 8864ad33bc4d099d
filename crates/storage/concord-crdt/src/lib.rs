//! # Concord CRDT
//!
//! State-based conflict-free replicated data types used for merge-typed keys
//! in swarm shared state.
//!
//! - [`PnCounter`]: increment/decrement counter
//! - [`OrSet`]: observed-remove set with add-wins semantics
//! - [`LwwRegister`]: last-writer-wins register ordered by a logical stamp
//! - [`CrdtValue`]: tagged union stored as JSON under a state key
//!
//! ## Example
//!
//! ```rust
//! use concord_crdt::{ActorId, Mergeable, PnCounter};
//!
//! let mut a = PnCounter::new();
//! let mut b = PnCounter::new();
//! a.increment(&ActorId::from("agent-a"), 2);
//! b.increment(&ActorId::from("agent-b"), 3);
//! assert_eq!(a.merged(&b).value(), 5);
//! ```

pub mod error;
pub mod lww_register;
pub mod or_set;
pub mod pn_counter;
pub mod traits;
pub mod value;

pub use error::{CrdtError, Result};
pub use lww_register::{LwwRegister, Stamp};
pub use or_set::{ElementTag, OrSet};
pub use pn_counter::PnCounter;
pub use traits::{ActorId, Mergeable};
pub use value::{CrdtValue, MergeType};
