use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::probe::GpuProbe;

/// Process-wide mapping from device id to owning queue id, per spec §4.3.
/// The ownership lock is the only lock in the engine; it is taken only for
/// the read-filter-acquire critical section, which is O(|devices|) and
/// never held across I/O or sleep.
#[derive(Default)]
struct Inner {
    owners: HashMap<u32, u32>,
}

#[derive(Clone)]
pub struct OwnershipMap {
    inner: Arc<Mutex<Inner>>,
}

impl OwnershipMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Succeeds iff none of `devices` are currently owned; on success
    /// inserts all mappings and returns a [`DeviceLease`] whose `Drop`
    /// releases them, guaranteeing "every acquire is followed by exactly
    /// one release" even if the holder panics.
    pub fn try_acquire(&self, devices: &[u32], queue: u32) -> Option<DeviceLease> {
        let mut guard = self.inner.lock();
        if devices.iter().any(|d| guard.owners.contains_key(d)) {
            return None;
        }
        for &d in devices {
            guard.owners.insert(d, queue);
        }
        Some(DeviceLease {
            map: self.clone(),
            devices: devices.to_vec(),
            queue,
            released: false,
        })
    }

    /// Removes mappings where the owner equals `queue`; entries owned by
    /// another queue are left alone (defensive — this should never happen
    /// by construction, per §4.3's invariant).
    fn release(&self, devices: &[u32], queue: u32) {
        let mut guard = self.inner.lock();
        for d in devices {
            if guard.owners.get(d) == Some(&queue) {
                guard.owners.remove(d);
            }
        }
    }

    pub fn owner_of(&self, device: u32) -> Option<u32> {
        self.inner.lock().owners.get(&device).copied()
    }

    /// The number of candidate devices that are either in the ownership
    /// map or foreign-occupied per the probe — the denominator for
    /// admission.
    pub fn count_devices_held_by_user(&self, candidates: &[u32], probe: &dyn GpuProbe) -> u32 {
        let guard = self.inner.lock();
        candidates
            .iter()
            .filter(|d| guard.owners.contains_key(d) || !probe.foreign_users_on(**d).is_empty())
            .count() as u32
    }

    /// Devices in `candidates` not currently in the ownership map.
    pub fn unowned(&self, candidates: &[u32]) -> Vec<u32> {
        let guard = self.inner.lock();
        candidates
            .iter()
            .copied()
            .filter(|d| !guard.owners.contains_key(d))
            .collect()
    }
}

/// RAII guard for a successful [`OwnershipMap::try_acquire`]. Releasing is
/// idempotent and also happens on `Drop`, so `run_commands` panicking
/// mid-execution still frees the devices.
pub struct DeviceLease {
    map: OwnershipMap,
    devices: Vec<u32>,
    queue: u32,
    released: bool,
}

impl DeviceLease {
    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.map.release(&self.devices, self.queue);
            self.released = true;
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
