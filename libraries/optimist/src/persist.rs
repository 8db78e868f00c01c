//! # Cache persistence
//! Debounced cache snapshots, rehydration on startup, and replay of the outbox onto the
//! rehydrated cache. Replay only restores what the user saw; it never re-sends anything.

use std::rc::Rc;

use crate::Engine;
use crate::runner::rollback_patches;
use crate::store::DurableStore;
use crate::transport::Transport;

impl<T: Transport, S: DurableStore> Engine<T, S> {
    /// Write the cache snapshot now, cancelling any scheduled write.
    pub async fn persist_now(&self) {
        if let Some(pending) = self.persist_task.borrow_mut().take() {
            pending.abort();
        }
        self.write_snapshot().await;
    }

    async fn write_snapshot(&self) {
        let snapshot = self.cache.borrow().extract();
        match self.store.put_snapshot(&snapshot).await {
            Ok(()) => log::debug!("Persisted cache snapshot ({} entries)", snapshot.len()),
            Err(e) => log::warn!("Failed to persist cache snapshot: {e}"),
        }
    }

    /// Restore the stored snapshot into the cache. Returns false when there was nothing to restore.
    pub async fn rehydrate(&self) -> bool {
        let snapshot = match self.store.snapshot().await {
            Ok(Some(snapshot)) if !snapshot.is_empty() => snapshot,
            Ok(_) => return false,
            Err(e) => {
                log::warn!("Failed to read cache snapshot: {e}");
                return false;
            }
        };
        log::info!("Rehydrating cache with {} entries", snapshot.len());
        self.update_cache(|cache| cache.restore(snapshot));
        true
    }

    /// Re-apply every stored pending mutation's patches and put it back in the queue.
    ///
    /// Records whose plan is not registered, or whose patches fail, are skipped and left in the
    /// store. Returns the number of records replayed.
    pub async fn replay_pending(&self) -> usize {
        let records = match self.store.all_pending().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Failed to read pending mutations: {e}");
                return 0;
            }
        };

        let total = records.len();
        let mut replayed = 0;
        for record in records {
            let Some(plan) = self.registry.borrow().get(&record.plan_key) else {
                log::debug!(
                    "No plan `{}` for pending mutation {}, skipping",
                    record.plan_key,
                    record.client_mutation_id
                );
                continue;
            };

            let mut patches = match plan.patches(&record.variables) {
                Ok(patches) => patches,
                Err(e) => {
                    log::warn!(
                        "Could not compute patches for pending mutation {}: {e}",
                        record.client_mutation_id
                    );
                    continue;
                }
            };

            let applied = self.update_cache(|cache| {
                for index in 0..patches.len() {
                    if let Err(e) = patches[index].apply(cache, &record.variables) {
                        log::warn!(
                            "Replaying pending mutation {} failed: {e}",
                            record.client_mutation_id
                        );
                        rollback_patches(cache, &mut patches[..index], &record.variables);
                        return false;
                    }
                }
                true
            });

            if applied {
                self.queue.borrow_mut().add(record);
                replayed += 1;
            }
        }

        log::info!("Replayed {replayed} of {total} pending mutations");
        replayed
    }
}

impl<T: Transport + 'static, S: DurableStore + 'static> Engine<T, S> {
    /// Write a snapshot once no further call has arrived for the debounce period.
    ///
    /// # Panics
    ///
    /// Panics when called outside a [`tokio::task::LocalSet`].
    pub fn schedule_persist(self: &Rc<Self>) {
        let engine = self.clone();
        let debounce = self.config.persist_debounce();
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(debounce).await;
            engine.write_snapshot().await;
        });
        if let Some(previous) = self.persist_task.borrow_mut().replace(task) {
            previous.abort();
        }
    }
}
