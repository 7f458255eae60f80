//! Resource registry
//!
//! Named mutexes and semaphores with fair, queued acquisition. Each
//! resource keeps a FIFO wait queue; released capacity is handed to the
//! longest-waiting acquirer. Grants release on drop, so a step that
//! panics or is cancelled still returns what it held.
//!
//! The registry always contains the built-in [`TRANSPORT_RESOURCE`]
//! mutex; command attempts hold it so transport bytes never interleave.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::model::{Resource, TRANSPORT_RESOURCE};

/// Point-in-time view of one resource, for status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// Resource id
    pub resource: String,
    /// Total capacity
    pub capacity: u32,
    /// Currently held permits
    pub in_use: u32,
    /// Owners of the held permits
    pub owners: Vec<String>,
    /// Length of the wait queue
    pub queued: usize,
}

struct Holder {
    grant_id: u64,
    owner: String,
}

struct Waiter {
    id: u64,
    owner: String,
    tx: oneshot::Sender<GrantPayload>,
}

struct GrantPayload {
    grant_id: u64,
    member: Option<String>,
}

struct ResourceState {
    capacity: u32,
    in_use: u32,
    free_members: VecDeque<String>,
    waiters: VecDeque<Waiter>,
    holders: Vec<Holder>,
}

struct Inner {
    states: Mutex<BTreeMap<String, ResourceState>>,
    next_waiter: AtomicU64,
    next_grant: AtomicU64,
}

impl Inner {
    /// Return a grant to its resource: hand it to the first live waiter
    /// or free the slot. An unknown grant id is a double release and is
    /// logged as a programming error.
    fn release(&self, resource: &str, grant_id: u64, member: Option<String>) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(resource) else {
            tracing::error!(resource, grant_id, "release against unknown resource");
            return;
        };
        match state.holders.iter().position(|h| h.grant_id == grant_id) {
            Some(index) => {
                state.holders.remove(index);
            }
            None => {
                tracing::error!(resource, grant_id, "double release of resource grant");
                return;
            }
        }

        let mut member = member;
        // Hand the permit down the queue; skip waiters whose receiving
        // side disappeared (their task was dropped mid-acquire).
        while let Some(waiter) = state.waiters.pop_front() {
            let new_id = self.next_grant.fetch_add(1, Ordering::Relaxed);
            state.holders.push(Holder {
                grant_id: new_id,
                owner: waiter.owner.clone(),
            });
            let payload = GrantPayload {
                grant_id: new_id,
                member: member.clone(),
            };
            if waiter.tx.send(payload).is_ok() {
                return;
            }
            state.holders.pop();
        }

        state.in_use -= 1;
        if let Some(m) = member.take() {
            state.free_members.push_back(m);
        }
    }
}

/// Registry of named mutexes and semaphores.
pub struct ResourceRegistry {
    inner: Arc<Inner>,
    clock: Arc<dyn Clock>,
}

impl ResourceRegistry {
    /// Build a registry from resource definitions plus the built-in
    /// transport mutex.
    pub fn new(resources: &BTreeMap<String, Resource>, clock: Arc<dyn Clock>) -> Self {
        let mut states = BTreeMap::new();
        states.insert(
            TRANSPORT_RESOURCE.to_string(),
            ResourceState {
                capacity: 1,
                in_use: 0,
                free_members: VecDeque::new(),
                waiters: VecDeque::new(),
                holders: Vec::new(),
            },
        );
        for (id, resource) in resources {
            states.insert(
                id.clone(),
                ResourceState {
                    capacity: resource.capacity(),
                    in_use: 0,
                    free_members: resource.members.iter().cloned().collect(),
                    waiters: VecDeque::new(),
                    holders: Vec::new(),
                },
            );
        }
        Self {
            inner: Arc::new(Inner {
                states: Mutex::new(states),
                next_waiter: AtomicU64::new(0),
                next_grant: AtomicU64::new(0),
            }),
            clock,
        }
    }

    /// Acquire a permit of `resource` for `owner`, waiting at most
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// `Ref` for an unknown resource, `ResourceTimeout` when the deadline
    /// passes in the queue, `Cancelled` when the token fires first.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> EngineResult<ResourceGrant> {
        let (waiter_id, mut rx) = {
            let mut states = self.inner.states.lock();
            let state = states.get_mut(resource).ok_or_else(|| EngineError::Ref {
                entity: "resource",
                id: resource.to_string(),
            })?;

            if state.in_use < state.capacity && state.waiters.is_empty() {
                let grant_id = self.inner.next_grant.fetch_add(1, Ordering::Relaxed);
                state.in_use += 1;
                let member = state.free_members.pop_front();
                state.holders.push(Holder {
                    grant_id,
                    owner: owner.to_string(),
                });
                return Ok(ResourceGrant {
                    inner: Arc::clone(&self.inner),
                    resource: resource.to_string(),
                    grant_id,
                    member,
                    released: false,
                });
            }

            let waiter_id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id: waiter_id,
                owner: owner.to_string(),
                tx,
            });
            (waiter_id, rx)
        };

        tokio::select! {
            granted = &mut rx => match granted {
                Ok(payload) => Ok(self.grant_from_payload(resource, payload)),
                // The registry itself went away; treat as cancellation.
                Err(_) => Err(EngineError::Cancelled),
            },
            outcome = self.clock.sleep(timeout, cancel) => {
                let removed = {
                    let mut states = self.inner.states.lock();
                    states
                        .get_mut(resource)
                        .and_then(|state| {
                            state
                                .waiters
                                .iter()
                                .position(|w| w.id == waiter_id)
                                .and_then(|i| state.waiters.remove(i))
                        })
                        .is_some()
                };
                if removed {
                    match outcome {
                        Ok(()) => Err(EngineError::ResourceTimeout {
                            resource: resource.to_string(),
                        }),
                        Err(_) => Err(EngineError::Cancelled),
                    }
                } else {
                    // The grant arrived between the deadline and the
                    // queue lock. Keep it on plain timeout; give it back
                    // on cancellation.
                    match rx.try_recv() {
                        Ok(payload) => {
                            let grant = self.grant_from_payload(resource, payload);
                            match outcome {
                                Ok(()) => Ok(grant),
                                Err(_) => {
                                    drop(grant);
                                    Err(EngineError::Cancelled)
                                }
                            }
                        }
                        Err(_) => Err(EngineError::ResourceTimeout {
                            resource: resource.to_string(),
                        }),
                    }
                }
            }
        }
    }

    fn grant_from_payload(&self, resource: &str, payload: GrantPayload) -> ResourceGrant {
        ResourceGrant {
            inner: Arc::clone(&self.inner),
            resource: resource.to_string(),
            grant_id: payload.grant_id,
            member: payload.member,
            released: false,
        }
    }

    /// Whether a resource id exists in this registry.
    pub fn contains(&self, resource: &str) -> bool {
        self.inner.states.lock().contains_key(resource)
    }

    /// Point-in-time view of every resource.
    pub fn snapshot(&self) -> Vec<ResourceStatus> {
        let states = self.inner.states.lock();
        states
            .iter()
            .map(|(id, state)| ResourceStatus {
                resource: id.clone(),
                capacity: state.capacity,
                in_use: state.in_use,
                owners: state.holders.iter().map(|h| h.owner.clone()).collect(),
                queued: state.waiters.len(),
            })
            .collect()
    }
}

/// Exclusive hold on one permit of a resource.
///
/// Dropping the grant releases the permit; `release` does the same
/// eagerly. A grant is released exactly once either way.
pub struct ResourceGrant {
    inner: Arc<Inner>,
    resource: String,
    grant_id: u64,
    member: Option<String>,
    released: bool,
}

impl ResourceGrant {
    /// The resource this grant belongs to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Assigned member for membered resources.
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// Release the permit now instead of at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner
            .release(&self.resource, self.grant_id, self.member.take());
    }
}

impl Drop for ResourceGrant {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for ResourceGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGrant")
            .field("resource", &self.resource)
            .field("grant_id", &self.grant_id)
            .field("member", &self.member)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SysClock;
    use crate::model::ResourceKind;

    fn registry_with(resources: &[(&str, Resource)]) -> ResourceRegistry {
        let map: BTreeMap<String, Resource> = resources
            .iter()
            .map(|(id, r)| (id.to_string(), r.clone()))
            .collect();
        ResourceRegistry::new(&map, Arc::new(SysClock))
    }

    fn mutex() -> Resource {
        Resource::default()
    }

    fn semaphore(permits: u32) -> Resource {
        Resource {
            kind: ResourceKind::Semaphore { permits },
            members: Vec::new(),
        }
    }

    #[tokio::test]
    async fn mutex_is_exclusive_until_released() {
        let registry = registry_with(&[("pump", mutex())]);
        let cancel = CancellationToken::new();

        let first = registry
            .acquire("pump", "a", Duration::from_millis(100), &cancel)
            .await
            .unwrap();

        let denied = registry
            .acquire("pump", "b", Duration::from_millis(30), &cancel)
            .await;
        assert!(matches!(denied, Err(EngineError::ResourceTimeout { .. })));

        drop(first);
        let second = registry
            .acquire("pump", "b", Duration::from_millis(100), &cancel)
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let registry = Arc::new(registry_with(&[("pump", mutex())]));
        let cancel = CancellationToken::new();

        let held = registry
            .acquire("pump", "holder", Duration::from_millis(500), &cancel)
            .await
            .unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel::<&'static str>();
        for name in ["first", "second"] {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let grant = registry
                    .acquire("pump", name, Duration::from_secs(2), &cancel)
                    .await
                    .unwrap();
                order_tx.send(name).unwrap();
                drop(grant);
            });
            // Give each task time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        drop(held);
        let a = order_rx.recv().await.unwrap();
        let b = order_rx.recv().await.unwrap();
        assert_eq!((a, b), ("first", "second"));
    }

    #[tokio::test]
    async fn semaphore_admits_up_to_capacity() {
        let registry = registry_with(&[("bath", semaphore(2))]);
        let cancel = CancellationToken::new();

        let g1 = registry
            .acquire("bath", "a", Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        let _g2 = registry
            .acquire("bath", "b", Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        let third = registry
            .acquire("bath", "c", Duration::from_millis(30), &cancel)
            .await;
        assert!(matches!(third, Err(EngineError::ResourceTimeout { .. })));

        drop(g1);
        let fourth = registry
            .acquire("bath", "c", Duration::from_millis(100), &cancel)
            .await;
        assert!(fourth.is_ok());
    }

    #[tokio::test]
    async fn members_are_assigned_and_recycled() {
        let resource = Resource {
            kind: ResourceKind::Mutex,
            members: vec!["left".to_string(), "right".to_string()],
        };
        let registry = registry_with(&[("arm", resource)]);
        let cancel = CancellationToken::new();

        let g1 = registry
            .acquire("arm", "a", Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert_eq!(g1.member(), Some("left"));
        let g2 = registry
            .acquire("arm", "b", Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert_eq!(g2.member(), Some("right"));

        drop(g1);
        let g3 = registry
            .acquire("arm", "c", Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert_eq!(g3.member(), Some("left"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting() {
        let registry = registry_with(&[("pump", mutex())]);
        let cancel = CancellationToken::new();

        let _held = registry
            .acquire("pump", "holder", Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let waiter_cancel = cancel.child_token();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = registry
            .acquire("pump", "waiter", Duration::from_secs(5), &waiter_cancel)
            .await;
        assert_eq!(result.unwrap_err(), EngineError::Cancelled);
    }

    #[tokio::test]
    async fn unknown_resource_is_a_ref_error() {
        let registry = registry_with(&[]);
        let cancel = CancellationToken::new();
        let result = registry
            .acquire("ghost", "a", Duration::from_millis(10), &cancel)
            .await;
        assert!(matches!(result, Err(EngineError::Ref { .. })));
    }

    #[tokio::test]
    async fn transport_mutex_is_built_in() {
        let registry = registry_with(&[]);
        let cancel = CancellationToken::new();
        let grant = registry
            .acquire(TRANSPORT_RESOURCE, "step", Duration::from_millis(50), &cancel)
            .await;
        assert!(grant.is_ok());
    }

    #[tokio::test]
    async fn snapshot_reports_owners_and_queue() {
        let registry = Arc::new(registry_with(&[("pump", mutex())]));
        let cancel = CancellationToken::new();

        let _grant = registry
            .acquire("pump", "seq-a", Duration::from_millis(500), &cancel)
            .await
            .unwrap();

        let registry2 = Arc::clone(&registry);
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            let _ = registry2
                .acquire("pump", "seq-b", Duration::from_secs(1), &cancel2)
                .await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = registry.snapshot();
        let pump = snapshot.iter().find(|s| s.resource == "pump").unwrap();
        assert_eq!(pump.in_use, 1);
        assert_eq!(pump.owners, vec!["seq-a".to_string()]);
        assert_eq!(pump.queued, 1);
    }
}
