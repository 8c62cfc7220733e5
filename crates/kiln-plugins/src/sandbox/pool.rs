//! Warm-instance pool.
//!
//! Each plugin gets a semaphore bounding concurrent instances and a small
//! idle queue. Checkout reuses the most recently returned instance whose
//! generation (artifact digest) still matches; anything stale, expired or
//! surplus is dropped, which ends its thread. Instances that hit a quota
//! never come back here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::instance::Instance;
use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

#[derive(Debug)]
struct Slot {
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Instance>>,
}

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolLimits {
    pub(crate) max_instances: usize,
    pub(crate) max_idle: usize,
    pub(crate) idle_ttl: Duration,
}

#[derive(Debug)]
pub(crate) struct InstancePool {
    limits: PoolLimits,
    slots: DashMap<PluginId, Arc<Slot>>,
}

/// A checked-out instance slot. Holds the concurrency permit for as long
/// as it lives.
#[derive(Debug)]
pub(crate) struct Lease {
    slot: Arc<Slot>,
    _permit: OwnedSemaphorePermit,
    /// A reusable instance, if one was idle.
    pub(crate) warm: Option<Instance>,
}

impl InstancePool {
    pub(crate) fn new(limits: PoolLimits) -> Self {
        Self {
            limits: PoolLimits {
                max_instances: limits.max_instances.max(1),
                ..limits
            },
            slots: DashMap::new(),
        }
    }

    fn slot(&self, id: &PluginId) -> Arc<Slot> {
        self.slots
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    permits: Arc::new(Semaphore::new(self.limits.max_instances)),
                    idle: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    /// Wait for a permit and pop a warm instance of `generation`, if any.
    pub(crate) async fn checkout(&self, id: &PluginId, generation: &str) -> PluginResult<Lease> {
        let slot = self.slot(id);
        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PluginError::Sandbox {
                plugin: id.to_string(),
                message: "instance pool closed".into(),
            })?;

        let warm = {
            let mut idle = slot.idle.lock().await;
            let ttl = self.limits.idle_ttl;
            idle.retain(|i| i.generation() == generation && i.idle_for() < ttl);
            idle.pop_back()
        };
        if warm.is_some() {
            tracing::trace!(plugin = %id, "Reusing warm instance");
        }

        Ok(Lease {
            slot,
            _permit: permit,
            warm,
        })
    }

    /// Return a healthy instance to the idle queue, evicting the oldest
    /// when full.
    pub(crate) async fn checkin(&self, lease: Lease, mut instance: Instance) {
        if self.limits.max_idle == 0 {
            return;
        }
        instance.touch();
        let mut idle = lease.slot.idle.lock().await;
        idle.push_back(instance);
        while idle.len() > self.limits.max_idle {
            idle.pop_front();
        }
    }

    /// Drop every idle instance of `id`. In-flight instances of an older
    /// generation are filtered out at the next checkout.
    pub(crate) async fn invalidate(&self, id: &PluginId) {
        let slot = self.slots.get(id).map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            let dropped = {
                let mut idle = slot.idle.lock().await;
                std::mem::take(&mut *idle)
            };
            if !dropped.is_empty() {
                tracing::debug!(plugin = %id, count = dropped.len(), "Invalidated idle instances");
            }
        }
    }

    /// Idle instances currently held for `id`.
    pub(crate) async fn idle_count(&self, id: &PluginId) -> usize {
        let slot = self.slots.get(id).map(|s| Arc::clone(s.value()));
        match slot {
            Some(slot) => slot.idle.lock().await.len(),
            None => 0,
        }
    }
}
