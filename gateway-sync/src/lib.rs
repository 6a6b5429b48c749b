#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]

//! # Named-Lock Mutex
//!
//! A string-addressed mutex with a priority FIFO queue, per-lock and
//! per-queue-entry timeouts, and deadlock-free multi-lock acquisition by
//! lexicographic ordering.
//!
//! The gateway uses one [`NamedLockMutex`] to serialise order placement
//! per `(accountId, orderType)` pair (lock name `cm_order_{account}_{type}`)
//! without blocking unrelated requests against the same account.

use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Priority of a queued acquire request. High-priority entries are inserted
/// ahead of the first non-high entry in the global queue; normal and low
/// priority entries are appended at the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Errors surfaced by [`NamedLockMutex`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("queue is at capacity ({0})")]
    QueueFull(usize),
    #[error("timed out waiting in queue for lock {0:?}")]
    QueueTimeout(String),
    #[error("queue entry for lock {0:?} rejected by reset")]
    Reset(String),
}

/// Outcome of a successful [`NamedLockMutex::acquire`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireReceipt {
    pub wait_time: Duration,
    pub queue_position: usize,
}

/// Observability events. Correctness never depends on anyone consuming
/// these; they exist for dashboards/metrics collaborators outside this
/// core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired { name: String, holder: String },
    Released { name: String, holder: String },
    ForceReleased { name: String, holder: String },
}

/// Tunables for a [`NamedLockMutex`]. Defaults follow §4.B / §5 of the
/// gateway design: 30s lock timeout, 60s queue timeout, 50-entry queue cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub lock_timeout: Duration,
    pub queue_timeout: Duration,
    pub max_queue_size: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(60),
            max_queue_size: 50,
        }
    }
}

struct Holder {
    id: String,
    acquired_at: Instant,
    generation: u64,
    timeout_task: tokio::task::JoinHandle<()>,
}

struct QueueEntry {
    name: String,
    id: String,
    priority: Priority,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<AcquireReceipt, LockError>>,
}

struct Inner {
    holders: HashMap<String, Holder>,
    queue: VecDeque<QueueEntry>,
}

/// Deadlock-free, priority-queued, string-addressed mutex.
///
/// Cloning shares the same underlying state (it is an `Arc` handle), which
/// matches how the router holds one instance and hands it to every request
/// handler.
#[derive(Clone)]
pub struct NamedLockMutex {
    inner: Arc<AsyncMutex<Inner>>,
    config: LockConfig,
    events: broadcast::Sender<LockEvent>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for NamedLockMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockMutex")
            .field("config", &self.config)
            .finish()
    }
}

impl NamedLockMutex {
    pub fn new(config: LockConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(AsyncMutex::new(Inner {
                holders: HashMap::new(),
                queue: VecDeque::new(),
            })),
            config,
            events,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to `lockAcquired` / `lockReleased` / `lockForceReleased`
    /// events. Purely observational; dropped receivers lose events silently.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// Acquire the named lock, waiting in the global priority queue if it is
    /// currently held. Resolves with the measured wait time and the queue
    /// position the caller entered at, or rejects with [`LockError::QueueFull`]
    /// / [`LockError::QueueTimeout`].
    pub async fn acquire(
        &self,
        name: impl Into<String>,
        id: impl Into<String>,
        priority: Priority,
    ) -> Result<AcquireReceipt, LockError> {
        let name = name.into();
        let id = id.into();
        let start = Instant::now();

        let rx = {
            let mut guard = self.inner.lock().await;
            if !guard.holders.contains_key(&name) {
                let generation = self.next_generation();
                self.grant(&mut guard, &name, &id, generation);
                return Ok(AcquireReceipt {
                    wait_time: Duration::ZERO,
                    queue_position: 0,
                });
            }

            if guard.queue.len() >= self.config.max_queue_size {
                return Err(LockError::QueueFull(self.config.max_queue_size));
            }

            let (tx, rx) = oneshot::channel();
            let position = Self::enqueue(
                &mut guard.queue,
                QueueEntry {
                    name: name.clone(),
                    id: id.clone(),
                    priority,
                    enqueued_at: start,
                    responder: tx,
                },
            );
            debug!(lock = %name, holder = %id, position, "queued for named lock");
            rx
        };

        let timeout = self.config.queue_timeout;
        let name_for_timeout = name.clone();
        tokio::select! {
            result = rx => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(LockError::QueueTimeout(name_for_timeout)),
            },
            _ = tokio::time::sleep(timeout) => {
                self.expire_queue_entry(&name, &id).await;
                Err(LockError::QueueTimeout(name_for_timeout))
            }
        }
    }

    /// Acquire every lock in `names`, sorted lexicographically first, so
    /// that two callers requesting overlapping lock sets can never deadlock
    /// each other. On any failure, releases everything already acquired.
    pub async fn acquire_multiple(
        &self,
        names: &[&str],
        id: impl Into<String>,
        priority: Priority,
    ) -> Result<Vec<AcquireReceipt>, LockError> {
        let id = id.into();
        let mut ordered: Vec<&str> = names.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut acquired = Vec::with_capacity(ordered.len());
        for name in &ordered {
            match self.acquire(*name, id.clone(), priority).await {
                Ok(receipt) => acquired.push(((*name).to_string(), receipt)),
                Err(err) => {
                    for (held_name, _) in acquired {
                        self.release(&held_name, &id).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(acquired.into_iter().map(|(_, r)| r).collect())
    }

    /// Release a held lock. A mismatched `id` is logged and ignored per the
    /// contract: only the holder that acquired a lock may release it.
    pub async fn release(&self, name: impl AsRef<str>, id: impl AsRef<str>) {
        let name = name.as_ref();
        let id = id.as_ref();
        let mut guard = self.inner.lock().await;
        match guard.holders.get(name) {
            Some(holder) if holder.id == id => {
                let holder = guard.holders.remove(name).expect("checked above");
                holder.timeout_task.abort();
                let _ = self.events.send(LockEvent::Released {
                    name: name.to_string(),
                    holder: holder.id.clone(),
                });
                self.process_queue_for(&mut guard, name);
            }
            Some(holder) => {
                warn!(
                    lock = %name,
                    expected = %holder.id,
                    actual = %id,
                    "release() called by non-holder; ignored"
                );
            }
            None => {
                debug!(lock = %name, holder = %id, "release() called on unheld lock; ignored");
            }
        }
    }

    /// Acquire `name`, run `fn_`, and release in every exit path (success or
    /// error), matching the `withLock` scope guard from the design.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        name: impl Into<String>,
        id: impl Into<String>,
        priority: Priority,
        fn_: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let name = name.into();
        let id = id.into();
        self.acquire(name.clone(), id.clone(), priority)
            .await
            .map_err(E::from)?;
        let result = fn_().await;
        self.release(&name, &id).await;
        result
    }

    /// Reject every queued entry with [`LockError::Reset`]. Held locks are
    /// left untouched; callers that still hold a lock must release it
    /// explicitly. Used during shutdown.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        for entry in guard.queue.drain(..) {
            let _ = entry.responder.send(Err(LockError::Reset(entry.name)));
        }
    }

    fn enqueue(queue: &mut VecDeque<QueueEntry>, entry: QueueEntry) -> usize {
        if entry.priority == Priority::High {
            let position = queue
                .iter()
                .position(|e| e.priority != Priority::High)
                .unwrap_or(queue.len());
            queue.insert(position, entry);
            position
        } else {
            queue.push_back(entry);
            queue.len() - 1
        }
    }

    fn grant(&self, guard: &mut Inner, name: &str, id: &str, generation: u64) {
        let timeout_task = self.spawn_timeout(name.to_string(), id.to_string(), generation);
        guard.holders.insert(
            name.to_string(),
            Holder {
                id: id.to_string(),
                acquired_at: Instant::now(),
                generation,
                timeout_task,
            },
        );
        let _ = self.events.send(LockEvent::Acquired {
            name: name.to_string(),
            holder: id.to_string(),
        });
    }

    fn spawn_timeout(
        &self,
        name: String,
        id: String,
        generation: u64,
    ) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let events = self.events.clone();
        let lock_timeout = self.config.lock_timeout;
        let generation_counter = self.generation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lock_timeout).await;
            let mut guard = inner.lock().await;
            let should_force = matches!(
                guard.holders.get(&name),
                Some(holder) if holder.id == id && holder.generation == generation
            );
            if should_force {
                guard.holders.remove(&name);
                warn!(lock = %name, holder = %id, "lock force-released after timeout");
                let _ = events.send(LockEvent::ForceReleased {
                    name: name.clone(),
                    holder: id,
                });
                let next_generation = generation_counter.fetch_add(1, Ordering::Relaxed);
                Self::process_queue_for_static(
                    &events,
                    &inner,
                    &mut guard,
                    &name,
                    lock_timeout,
                    next_generation,
                    generation_counter,
                );
            }
        })
    }

    fn process_queue_for(&self, guard: &mut Inner, name: &str) {
        if let Some(index) = guard.queue.iter().position(|e| e.name == name) {
            let entry = guard.queue.remove(index).expect("position just found");
            let wait_time = entry.enqueued_at.elapsed();
            let generation = self.next_generation();
            self.grant(guard, name, &entry.id, generation);
            let _ = entry.responder.send(Ok(AcquireReceipt {
                wait_time,
                queue_position: index,
            }));
        }
    }

    /// Static variant used from within the force-release timeout task, which
    /// already holds `guard` and cannot reborrow `self`. Grants the freed
    /// lock to the next queued entry for `name`, if any, and arms a fresh
    /// force-release timeout for it.
    fn process_queue_for_static(
        events: &broadcast::Sender<LockEvent>,
        inner: &Arc<AsyncMutex<Inner>>,
        guard: &mut Inner,
        name: &str,
        lock_timeout: Duration,
        generation: u64,
        generation_counter: Arc<AtomicU64>,
    ) {
        if let Some(index) = guard.queue.iter().position(|e| e.name == name) {
            let entry = guard.queue.remove(index).expect("position just found");
            let wait_time = entry.enqueued_at.elapsed();
            let timeout_task = {
                let inner = inner.clone();
                let events = events.clone();
                let name_owned = name.to_string();
                let id_owned = entry.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(lock_timeout).await;
                    let mut guard = inner.lock().await;
                    let should_force = matches!(
                        guard.holders.get(&name_owned),
                        Some(h) if h.id == id_owned && h.generation == generation
                    );
                    if should_force {
                        guard.holders.remove(&name_owned);
                        warn!(lock = %name_owned, holder = %id_owned, "lock force-released after timeout");
                        let _ = events.send(LockEvent::ForceReleased {
                            name: name_owned.clone(),
                            holder: id_owned,
                        });
                        let next_generation = generation_counter.fetch_add(1, Ordering::Relaxed);
                        Self::process_queue_for_static(
                            &events,
                            &inner,
                            &mut guard,
                            &name_owned,
                            lock_timeout,
                            next_generation,
                            generation_counter.clone(),
                        );
                    }
                })
            };
            guard.holders.insert(
                name.to_string(),
                Holder {
                    id: entry.id.clone(),
                    acquired_at: Instant::now(),
                    generation,
                    timeout_task,
                },
            );
            let _ = events.send(LockEvent::Acquired {
                name: name.to_string(),
                holder: entry.id.clone(),
            });
            let _ = entry.responder.send(Ok(AcquireReceipt {
                wait_time,
                queue_position: index,
            }));
        }
    }

    async fn expire_queue_entry(&self, name: &str, id: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(index) = guard
            .queue
            .iter()
            .position(|e| e.name == name && e.id == id)
        {
            guard.queue.remove(index);
        }
    }
}

/// Lock name for per-account, per-order-type serialisation, matching
/// `cm_order_{account}_{type}` from §5 of the design.
pub fn order_lock_name(account_id: &str, order_type: &str) -> String {
    format!("cm_order_{account_id}_{order_type}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn uncontended_acquire_is_immediate() {
        let lock = NamedLockMutex::new(LockConfig::default());
        let receipt = lock.acquire("alpha", "holder-1", Priority::Normal).await.unwrap();
        assert_eq!(receipt.wait_time, Duration::ZERO);
        lock.release("alpha", "holder-1").await;
    }

    #[tokio::test]
    async fn second_acquire_queues_until_release() {
        let lock = NamedLockMutex::new(LockConfig::default());
        lock.acquire("alpha", "holder-1", Priority::Normal).await.unwrap();

        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            lock2.acquire("alpha", "holder-2", Priority::Normal).await
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        lock.release("alpha", "holder-1").await;

        let receipt = waiter.await.unwrap().unwrap();
        assert!(receipt.wait_time >= StdDuration::from_millis(15));
        lock.release("alpha", "holder-2").await;
    }

    #[tokio::test]
    async fn high_priority_jumps_the_queue() {
        let lock = NamedLockMutex::new(LockConfig::default());
        lock.acquire("alpha", "holder-1", Priority::Normal).await.unwrap();

        let lock_normal = lock.clone();
        let normal = tokio::spawn(async move {
            lock_normal.acquire("alpha", "normal", Priority::Normal).await
        });
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        let lock_high = lock.clone();
        let high = tokio::spawn(async move {
            lock_high.acquire("alpha", "high", Priority::High).await
        });
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        lock.release("alpha", "holder-1").await;
        let first_granted = tokio::time::timeout(StdDuration::from_millis(200), high)
            .await
            .expect("high priority should be granted promptly")
            .unwrap()
            .unwrap();
        assert_eq!(first_granted.queue_position, 1);
        lock.release("alpha", "high").await;

        normal.await.unwrap().unwrap();
        lock.release("alpha", "normal").await;
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let lock = NamedLockMutex::new(LockConfig::default());
        lock.acquire("alpha", "holder-1", Priority::Normal).await.unwrap();
        lock.release("alpha", "impostor").await;

        // still held by holder-1: a second acquire must queue, not succeed immediately.
        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            tokio::time::timeout(
                StdDuration::from_millis(50),
                lock2.acquire("alpha", "holder-2", Priority::Normal),
            )
            .await
        });
        assert!(waiter.await.unwrap().is_err(), "acquire should not have resolved yet");
        lock.release("alpha", "holder-1").await;
    }

    #[tokio::test]
    async fn queue_full_rejects_immediately() {
        let lock = NamedLockMutex::new(LockConfig {
            max_queue_size: 1,
            ..LockConfig::default()
        });
        lock.acquire("alpha", "holder-1", Priority::Normal).await.unwrap();

        let lock2 = lock.clone();
        let _blocked = tokio::spawn(async move {
            lock2.acquire("alpha", "holder-2", Priority::Normal).await
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        let err = lock.acquire("alpha", "holder-3", Priority::Normal).await.unwrap_err();
        assert_eq!(err, LockError::QueueFull(1));
        lock.release("alpha", "holder-1").await;
    }

    #[tokio::test]
    async fn reset_rejects_queued_entries() {
        let lock = NamedLockMutex::new(LockConfig::default());
        lock.acquire("alpha", "holder-1", Priority::Normal).await.unwrap();

        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            lock2.acquire("alpha", "holder-2", Priority::Normal).await
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        lock.reset().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, LockError::Reset("alpha".to_string()));
    }

    #[tokio::test]
    async fn acquire_multiple_orders_lexicographically_and_rolls_back() {
        let lock = NamedLockMutex::new(LockConfig {
            queue_timeout: StdDuration::from_millis(50),
            ..LockConfig::default()
        });
        lock.acquire("beta", "blocker", Priority::Normal).await.unwrap();

        // Sorted order is alpha, beta, gamma: alpha grants immediately, beta
        // is held by "blocker" and times out in queue, so gamma is never
        // attempted and alpha must be rolled back.
        let err = lock
            .acquire_multiple(&["gamma", "alpha", "beta"], "caller", Priority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err, LockError::QueueTimeout("beta".to_string()));

        // alpha was rolled back: a fresh acquire must succeed immediately.
        let receipt = lock.acquire("alpha", "someone-else", Priority::Normal).await.unwrap();
        assert_eq!(receipt.wait_time, Duration::ZERO);

        lock.release("alpha", "someone-else").await;
        lock.release("beta", "blocker").await;
    }
}
