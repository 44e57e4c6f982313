//! Shared policy inputs: override mode, local policy, fleet policy.
//!
//! All three live behind one lock so a reader never sees a fleet policy from
//! one update paired with a mode from another.

use fleetwatch_common::{
    resolve, AgentOverrideMode, EffectivePolicy, FleetUpdatePolicy, PolicySpec,
};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::info;

/// One consistent view of every policy input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub mode: AgentOverrideMode,
    pub local: PolicySpec,
    pub fleet: Option<Arc<FleetUpdatePolicy>>,
}

impl PolicySnapshot {
    pub fn effective(&self) -> EffectivePolicy {
        resolve(self.mode, &self.local, self.fleet.as_deref())
    }
}

/// Where the update manager reads its policy inputs from.
pub trait PolicyProvider: Send + Sync {
    fn snapshot(&self) -> PolicySnapshot;

    fn get_auto_update_mode(&self) -> AgentOverrideMode {
        self.snapshot().mode
    }

    fn get_local_policy(&self) -> PolicySpec {
        self.snapshot().local
    }

    fn get_fleet_policy(&self) -> Option<Arc<FleetUpdatePolicy>> {
        self.snapshot().fleet
    }

    fn effective_policy(&self) -> EffectivePolicy {
        self.snapshot().effective()
    }
}

/// In-memory policy store with change notification.
pub struct PolicyStore {
    inner: RwLock<PolicySnapshot>,
    changed: watch::Sender<u64>,
}

impl PolicyStore {
    pub fn new(mode: AgentOverrideMode, local: PolicySpec) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: RwLock::new(PolicySnapshot {
                mode,
                local,
                fleet: None,
            }),
            changed,
        }
    }

    /// Replace (or clear) the fleet policy wholesale.
    pub fn set_fleet_policy(&self, fleet: Option<FleetUpdatePolicy>) {
        let effective = {
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            guard.fleet = fleet.map(Arc::new);
            guard.effective()
        };
        info!("Fleet policy updated, effective source now {}", effective.source());
        self.notify();
    }

    /// Replace mode and local policy, e.g. after a config reload.
    pub fn set_local(&self, mode: AgentOverrideMode, local: PolicySpec) {
        {
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if guard.mode == mode && guard.local == local {
                return;
            }
            guard.mode = mode;
            guard.local = local;
        }
        info!("Local update policy reloaded (mode: {})", mode);
        self.notify();
    }

    /// Receiver that changes whenever any input changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl PolicyProvider for PolicyStore {
    fn snapshot(&self) -> PolicySnapshot {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
