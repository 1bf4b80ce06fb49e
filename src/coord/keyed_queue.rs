//! Per-key FIFO mutual exclusion
//!
//! Each key has a chain of completion signals. Enqueueing swaps the key's
//! tail for a fresh signal and spawns a task that first waits on the old
//! tail, so queue position is fixed at the moment `enqueue` is called and
//! not when the runtime first polls the task.

use dashmap::mapref::entry::Entry as SlotEntry;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

struct Slot {
    /// Signal fired when the most recently enqueued task releases the slot
    tail: Option<oneshot::Receiver<()>>,
    /// Tasks enqueued and not yet released
    pending: usize,
}

/// Serializes tasks per key; distinct keys run concurrently
pub struct KeyedQueue<K>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, Slot>>,
    runtime: Handle,
}

impl<K> Clone for KeyedQueue<K>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            runtime: self.runtime.clone(),
        }
    }
}

impl<K> fmt::Debug for KeyedQueue<K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedQueue")
            .field("active_keys", &self.slots.len())
            .finish()
    }
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create a queue whose tasks are spawned on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            runtime,
        }
    }

    /// Queue `task` behind every task already enqueued for `key`
    ///
    /// The slot is released when the task finishes, fails, panics or is
    /// dropped with the runtime, so one bad task never wedges its key.
    pub fn enqueue<F>(&self, key: K, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();

        let previous = {
            let mut slot = self.slots.entry(key.clone()).or_insert_with(|| Slot {
                tail: None,
                pending: 0,
            });
            slot.pending += 1;
            trace!("Enqueued task for {:?}, pending: {}", key, slot.pending);
            slot.tail.replace(done_rx)
        };

        let release = SlotRelease {
            slots: Arc::clone(&self.slots),
            key: Some(key),
            done: Some(done_tx),
        };

        self.runtime.spawn(async move {
            let _release = release;
            if let Some(previous) = previous {
                // A closed channel also means the previous holder is gone
                let _ = previous.await;
            }
            task.await
        })
    }

    /// Tasks queued or running for `key`
    pub fn pending(&self, key: &K) -> usize {
        self.slots.get(key).map(|slot| slot.pending).unwrap_or(0)
    }

    /// Keys with at least one queued or running task
    pub fn active_keys(&self) -> usize {
        self.slots.len()
    }
}

/// Releases a key's slot when the owning task ends
struct SlotRelease<K>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, Slot>>,
    key: Option<K>,
    done: Option<oneshot::Sender<()>>,
}

impl<K> Drop for SlotRelease<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let SlotEntry::Occupied(mut occupied) = self.slots.entry(key) {
                let slot = occupied.get_mut();
                slot.pending = slot.pending.saturating_sub(1);
                if slot.pending == 0 {
                    occupied.remove();
                }
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
