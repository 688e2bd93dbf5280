//! Parent/child job joins.
//!
//! A parent job declares that it waits on a child through a `JoinRecord`.
//! Sync joins park the calling thread; async joins detach the parent and leave
//! enough state behind for the wakeup scheduler to resume it on any node.

pub mod coordinator;
pub mod store;
pub mod types;

pub use coordinator::{JoinCoordinator, Recheck};
pub use store::{InMemoryJoinStore, JoinInsert, JoinStore, JoinStoreError};
pub use types::{AsyncJoin, JoinMode, JoinRecord, JoinResult, JoinState};
