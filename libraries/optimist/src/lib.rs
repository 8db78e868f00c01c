//! This is a library for optimistic mutations against a server that pushes change notifications.
//! It was created for a ward-management client, so it doesn't include much that was not needed for that project.
//!
//! Mutation strategy:
//! 1. Every mutation kind has an optimistic plan, registered under a stable key. A plan turns the mutation's variables into reversible cache patches.
//! 2. When the app runs a mutation, it is recorded in a pending queue and a durable outbox, its patches are applied to the cache, and only then is it sent.
//! 3. If the server confirms it, the record is dropped. If the server rejects it, the patches are rolled back and the record is dropped.
//! 4. When the server pushes a change notification:
//!   1. If a local mutation for that entity is still pending, local state wins and the notification is ignored.
//!   2. If the notification is an echo of a mutation this client just made, it is ignored.
//!   3. Otherwise the entity is re-fetched, and written to the cache only if its revision is newer than the cached one.
//! 5. The cache is snapshotted to durable storage (debounced). After a reload the snapshot is restored, then every mutation still in the outbox has its patches re-applied by looking its plan up by key.
//!
//! Sounds simple, but there are a few tricky parts that this library handles.
//!
//! The engine is single-threaded: run it inside a [`tokio::task::LocalSet`].

pub mod cache;
pub mod clock;
pub mod config;
mod engine;
pub mod error;
pub mod listeners;
pub mod merge;
mod persist;
pub mod plan;
pub mod queue;
pub mod runner;
pub mod status;
pub mod store;
pub mod tracker;
pub mod transport;

pub use cache::{Cache, CacheChange, CacheSnapshot, EntityKey, QueryKey};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConflictStrategy, EngineConfig};
pub use engine::Engine;
pub use error::{ConflictInfo, MutationError, PatchError, StoreError, TransportError};
pub use listeners::ListenerKey;
pub use merge::{EntityQuery, MergeConfig, MergeOutcome, SubscriptionHandle};
pub use plan::{EntityPatch, OptimisticPatch, OptimisticPlan, Patches, PlanRegistry, QueryPatch};
pub use queue::{PendingMutationRecord, PendingQueue};
pub use runner::{ConflictChoice, ConflictHandler, MutateOptions};
pub use status::{ConnectionStatus, RefreshingSnapshot};
pub use store::{DisabledStore, DurableStore, FileStore, MemoryStore};
pub use tracker::EchoTracker;
pub use transport::{FetchPolicy, Notification, NotificationKind, Operation, Transport};
