//! # Durable stores
//! Where the outbox and the cache snapshot survive a reload. Durability is an optimization: the
//! engine logs and discards every [`StoreError`], so a store may fail or be entirely unavailable
//! without affecting the running session.

use std::cell::RefCell;

use indexmap::IndexMap;

use crate::cache::CacheSnapshot;
use crate::error::StoreError;
use crate::queue::PendingMutationRecord;

pub mod file;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Pending records keyed by mutation id, plus a single cache-snapshot slot.
#[allow(async_fn_in_trait)]
pub trait DurableStore {
    /// Insert or replace. Replacing keeps the record's original position.
    async fn put_pending(&self, record: &PendingMutationRecord) -> Result<(), StoreError>;
    async fn delete_pending(&self, client_mutation_id: &str) -> Result<(), StoreError>;
    /// Every stored record, in insertion order.
    async fn all_pending(&self) -> Result<Vec<PendingMutationRecord>, StoreError>;
    async fn put_snapshot(&self, snapshot: &CacheSnapshot) -> Result<(), StoreError>;
    async fn snapshot(&self) -> Result<Option<CacheSnapshot>, StoreError>;
}

/// Keeps everything in memory. Lost on reload.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pending: RefCell<IndexMap<String, PendingMutationRecord>>,
    snapshot: RefCell<Option<CacheSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    async fn put_pending(&self, record: &PendingMutationRecord) -> Result<(), StoreError> {
        self.pending
            .borrow_mut()
            .insert(record.client_mutation_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_pending(&self, client_mutation_id: &str) -> Result<(), StoreError> {
        self.pending.borrow_mut().shift_remove(client_mutation_id);
        Ok(())
    }

    async fn all_pending(&self) -> Result<Vec<PendingMutationRecord>, StoreError> {
        Ok(self.pending.borrow().values().cloned().collect())
    }

    async fn put_snapshot(&self, snapshot: &CacheSnapshot) -> Result<(), StoreError> {
        *self.snapshot.borrow_mut() = Some(snapshot.clone());
        Ok(())
    }

    async fn snapshot(&self) -> Result<Option<CacheSnapshot>, StoreError> {
        Ok(self.snapshot.borrow().clone())
    }
}

/// Storage switched off. Every call fails with [`StoreError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

impl DurableStore for DisabledStore {
    async fn put_pending(&self, _record: &PendingMutationRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn delete_pending(&self, _client_mutation_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn all_pending(&self) -> Result<Vec<PendingMutationRecord>, StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn put_snapshot(&self, _snapshot: &CacheSnapshot) -> Result<(), StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn snapshot(&self) -> Result<Option<CacheSnapshot>, StoreError> {
        Err(StoreError::Unavailable)
    }
}

impl<S: DurableStore + ?Sized> DurableStore for std::rc::Rc<S> {
    async fn put_pending(&self, record: &PendingMutationRecord) -> Result<(), StoreError> {
        (**self).put_pending(record).await
    }

    async fn delete_pending(&self, client_mutation_id: &str) -> Result<(), StoreError> {
        (**self).delete_pending(client_mutation_id).await
    }

    async fn all_pending(&self) -> Result<Vec<PendingMutationRecord>, StoreError> {
        (**self).all_pending().await
    }

    async fn put_snapshot(&self, snapshot: &CacheSnapshot) -> Result<(), StoreError> {
        (**self).put_snapshot(snapshot).await
    }

    async fn snapshot(&self) -> Result<Option<CacheSnapshot>, StoreError> {
        (**self).snapshot().await
    }
}
