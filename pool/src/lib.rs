// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The set of devices which may still be handed out.
//!
//! [`DevicePool`] owns its lock: every operation takes it exactly once and never holds it across
//! an `.await`, so "shown as available" and "handed to a container" can never overlap.

#![deny(clippy::all, clippy::pedantic)]

use net::{InterfaceName, NetworkDevice};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("requested {requested} devices but only {available} are available")]
    Exhausted { requested: usize, available: usize },
}

#[derive(Debug, Clone)]
struct Assignment {
    device: NetworkDevice,
    /// The device has been seen missing from the host since it was handed out.
    away: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Last inventory, in scan order.
    inventory: Vec<NetworkDevice>,
    /// Healthy, unassigned devices, in scan order.
    available: Vec<NetworkDevice>,
    assigned: BTreeMap<InterfaceName, Assignment>,
}

impl PoolState {
    fn rebuild_available(&mut self) {
        let mut seen = BTreeSet::new();
        self.available = self
            .inventory
            .iter()
            .filter(|d| d.is_healthy())
            .filter(|d| !self.assigned.contains_key(&d.name))
            .filter(|d| seen.insert(d.name.clone()))
            .cloned()
            .collect();
    }

    fn assign(&mut self, devices: &[NetworkDevice]) {
        for device in devices {
            self.assigned.insert(
                device.name.clone(),
                Assignment {
                    device: device.clone(),
                    away: false,
                },
            );
        }
    }
}

#[derive(Debug, Default)]
pub struct DevicePool {
    state: Mutex<PoolState>,
}

impl DevicePool {
    #[must_use]
    pub fn new() -> DevicePool {
        DevicePool::default()
    }

    /// Replace the available set with the healthy devices of `inventory` which are not assigned.
    ///
    /// `inventory` must be a complete pass over the host: an assigned device missing from it is
    /// marked as away (it is in its container).  Seeing an away device again releases nothing;
    /// only [`DevicePool::release`] does.
    pub fn refresh(&self, inventory: &[NetworkDevice]) {
        let present: BTreeSet<&InterfaceName> = inventory.iter().map(|d| &d.name).collect();
        let mut state = self.state.lock();
        for (name, assignment) in &mut state.assigned {
            if !present.contains(name) && !assignment.away {
                debug!("{name} left the host");
                assignment.away = true;
            }
        }
        state.inventory = inventory.to_vec();
        state.rebuild_available();
        debug!(
            "Pool refreshed: {} available, {} assigned",
            state.available.len(),
            state.assigned.len()
        );
    }

    /// Take the first `n` available devices, or nothing at all.
    pub fn take(&self, n: usize) -> Result<Vec<NetworkDevice>, PoolError> {
        let mut state = self.state.lock();
        Self::take_locked(&mut state, n)
    }

    fn take_locked(state: &mut PoolState, n: usize) -> Result<Vec<NetworkDevice>, PoolError> {
        if state.available.len() < n {
            warn!(
                "Cannot allocate {n} devices: {} available",
                state.available.len()
            );
            return Err(PoolError::Exhausted {
                requested: n,
                available: state.available.len(),
            });
        }
        let taken: Vec<NetworkDevice> = state.available.drain(..n).collect();
        state.assign(&taken);
        Ok(taken)
    }

    /// Take exactly the `requested` devices if all of them are available; otherwise take as many
    /// devices as were requested from the front of the pool, or nothing at all.
    pub fn take_requested(
        &self,
        requested: &[InterfaceName],
    ) -> Result<Vec<NetworkDevice>, PoolError> {
        let mut state = self.state.lock();
        let distinct: BTreeSet<&InterfaceName> = requested.iter().collect();
        let all_available = distinct.len() == requested.len()
            && requested
                .iter()
                .all(|name| state.available.iter().any(|d| &d.name == name));
        if !all_available {
            debug!("Requested devices are not all available, allocating in pool order");
            return Self::take_locked(&mut state, requested.len());
        }
        let mut taken = Vec::with_capacity(requested.len());
        for name in requested {
            if let Some(position) = state.available.iter().position(|d| &d.name == name) {
                taken.push(state.available.remove(position));
            }
        }
        state.assign(&taken);
        Ok(taken)
    }

    /// Return devices to the pool.  Returns how many of them were assigned.
    ///
    /// A released device becomes available again only if the last inventory saw it healthy.
    pub fn release(&self, names: &[InterfaceName]) -> usize {
        let mut state = self.state.lock();
        let released = names
            .iter()
            .filter(|name| state.assigned.remove(*name).is_some())
            .count();
        if released > 0 {
            info!("Released {released} devices");
            state.rebuild_available();
        }
        released
    }

    /// Pick up to `size` devices to suggest for an allocation, without taking them.
    ///
    /// `must_include` comes first; the rest is filled from `candidates` in pool order.
    #[must_use]
    pub fn preferred(
        &self,
        candidates: &[InterfaceName],
        must_include: &[InterfaceName],
        size: usize,
    ) -> Vec<InterfaceName> {
        let state = self.state.lock();
        let mut chosen: Vec<InterfaceName> = Vec::with_capacity(size);
        for name in must_include {
            if chosen.len() < size && !chosen.contains(name) {
                chosen.push(name.clone());
            }
        }
        for device in &state.available {
            if chosen.len() >= size {
                break;
            }
            if candidates.contains(&device.name) && !chosen.contains(&device.name) {
                chosen.push(device.name.clone());
            }
        }
        chosen
    }

    /// Assigned devices which have been seen missing from the host since they were handed out.
    #[must_use]
    pub fn away(&self) -> BTreeSet<InterfaceName> {
        self.state
            .lock()
            .assigned
            .iter()
            .filter(|(_, a)| a.away)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Snapshot of the available devices, in pool order.
    #[must_use]
    pub fn available(&self) -> Vec<NetworkDevice> {
        self.state.lock().available.clone()
    }

    /// Snapshot of the assigned devices.
    #[must_use]
    pub fn assigned(&self) -> Vec<NetworkDevice> {
        self.state
            .lock()
            .assigned
            .values()
            .map(|a| a.device.clone())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use crate::{DevicePool, PoolError};
    use net::{Health, InterfaceName, NetworkDevice};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn device(name: &str, healthy: bool) -> NetworkDevice {
        NetworkDevice {
            name: InterfaceName::new(name).unwrap(),
            mac: None,
            addresses: vec![],
            mtu: 1500,
            health: Health::from(healthy),
        }
    }

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    fn names(devices: &[NetworkDevice]) -> Vec<&str> {
        devices.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn take_is_fifo_and_all_or_nothing() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth2", true)]);

        let taken = pool.take(2).unwrap();
        assert_eq!(names(&taken), vec!["eth1", "eth2"]);
        assert_eq!(
            pool.take(1),
            Err(PoolError::Exhausted {
                requested: 1,
                available: 0
            })
        );
    }

    #[test]
    fn exhaustion_leaves_pool_unchanged() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth2", true)]);
        assert!(pool.take(3).is_err());
        assert_eq!(names(&pool.available()), vec!["eth1", "eth2"]);
        assert!(pool.assigned().is_empty());
        assert!(pool.take(0).unwrap().is_empty());
    }

    #[test]
    fn refresh_never_resurrects_assigned_devices() {
        let pool = DevicePool::new();
        let inventory = [device("eth1", true), device("eth2", true)];
        pool.refresh(&inventory);
        pool.take(1).unwrap();
        pool.refresh(&inventory);
        assert_eq!(names(&pool.available()), vec!["eth2"]);
        assert_eq!(names(&pool.assigned()), vec!["eth1"]);
    }

    #[test]
    fn unhealthy_devices_are_not_allocatable() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", false), device("eth2", true)]);
        assert_eq!(names(&pool.take(1).unwrap()), vec!["eth2"]);
        assert!(pool.take(1).is_err());
    }

    #[test]
    fn duplicate_names_appear_once() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth1", true)]);
        assert_eq!(pool.available().len(), 1);
    }

    #[test]
    fn requested_devices_are_honoured_when_available() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth2", true), device("eth3", true)]);
        let taken = pool.take_requested(&[name("eth3"), name("eth1")]).unwrap();
        assert_eq!(names(&taken), vec!["eth3", "eth1"]);
        assert_eq!(names(&pool.available()), vec!["eth2"]);
    }

    #[test]
    fn unavailable_requests_fall_back_to_pool_order() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth2", true), device("eth3", true)]);
        pool.take_requested(&[name("eth2")]).unwrap();
        let taken = pool.take_requested(&[name("eth2"), name("eth3")]).unwrap();
        assert_eq!(names(&taken), vec!["eth1", "eth3"]);
        assert!(pool.take_requested(&[name("eth9")]).is_err());
    }

    #[test]
    fn release_returns_healthy_devices() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth2", true)]);
        pool.take(2).unwrap();
        assert_eq!(pool.release(&[name("eth2"), name("eth9")]), 1);
        assert_eq!(names(&pool.available()), vec!["eth2"]);
        assert_eq!(names(&pool.assigned()), vec!["eth1"]);
    }

    #[test]
    fn reappearing_devices_stay_assigned_until_released() {
        let pool = DevicePool::new();
        let inventory = [device("eth1", true), device("eth2", true)];
        pool.refresh(&inventory);
        pool.take(1).unwrap();

        // still on the host: the container has not started yet
        pool.refresh(&inventory);
        assert!(pool.away().is_empty());
        // moved into the container
        pool.refresh(&inventory[1..]);
        assert_eq!(pool.away(), BTreeSet::from([name("eth1")]));
        // seen again, but nothing says the container is gone
        pool.refresh(&inventory);
        assert_eq!(names(&pool.assigned()), vec!["eth1"]);
        assert_eq!(names(&pool.available()), vec!["eth2"]);

        assert_eq!(pool.release(&[name("eth1")]), 1);
        assert!(pool.away().is_empty());
        assert_eq!(names(&pool.available()), vec!["eth1", "eth2"]);
    }

    #[test]
    fn empty_pass_between_take_and_refresh_hands_out_nothing_twice() {
        let pool = DevicePool::new();
        let inventory = [device("eth1", true), device("eth2", true)];
        pool.refresh(&inventory);
        let first = pool.take(1).unwrap();
        assert_eq!(names(&first), vec!["eth1"]);

        pool.refresh(&[]);
        pool.refresh(&inventory);
        assert_eq!(
            pool.take(2),
            Err(PoolError::Exhausted {
                requested: 2,
                available: 1
            })
        );
        assert_eq!(names(&pool.take(1).unwrap()), vec!["eth2"]);
    }

    #[test]
    fn preferred_puts_must_include_first_and_takes_nothing() {
        let pool = DevicePool::new();
        pool.refresh(&[device("eth1", true), device("eth2", true), device("eth3", true)]);
        let chosen = pool.preferred(&[name("eth3"), name("eth2")], &[name("eth3")], 2);
        assert_eq!(chosen, vec![name("eth3"), name("eth2")]);
        assert_eq!(pool.available().len(), 3);
    }

    #[test]
    fn concurrent_takes_never_share_a_device() {
        let pool = Arc::new(DevicePool::new());
        let inventory: Vec<NetworkDevice> =
            (0..32).map(|i| device(&format!("eth{i}"), true)).collect();
        pool.refresh(&inventory);

        let taken: Vec<Vec<NetworkDevice>> = std::thread::scope(|scope| {
            let refresher = scope.spawn(|| {
                for _ in 0..100 {
                    pool.refresh(&inventory);
                }
            });
            let takers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut mine = Vec::new();
                        while let Ok(mut devices) = pool.take(1) {
                            mine.append(&mut devices);
                        }
                        mine
                    })
                })
                .collect();
            refresher.join().unwrap();
            takers.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let all: Vec<&str> = taken.iter().flat_map(|t| names(t)).collect();
        let distinct: BTreeSet<&str> = all.iter().copied().collect();
        assert_eq!(all.len(), distinct.len(), "a device was handed out twice");
        let available: BTreeSet<InterfaceName> =
            pool.available().into_iter().map(|d| d.name).collect();
        for name in &distinct {
            assert!(!available.contains(&InterfaceName::new(*name).unwrap()));
        }
        assert_eq!(distinct.len() + available.len(), 32);
    }
}
