use crate::config::{fixed, Config};
use crate::ownership::OwnershipMap;
use crate::probe::GpuProbe;

/// Computes the dynamic per-user GPU quota and answers admission
/// questions (spec §4.4). Holds no state of its own — `available` is
/// recomputed from the probe on every call, so the quota tracks other
/// users' jobs finishing or starting in real time.
pub struct AdmissionController<'a> {
    pub config: &'a Config,
}

impl<'a> AdmissionController<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// `available = |{ d in candidates : free_memory(d) >= 1 GiB }|`
    pub fn available(&self, candidates: &[u32], probe: &dyn GpuProbe) -> u32 {
        candidates
            .iter()
            .filter(|&&d| probe.free_memory_gib(d) >= fixed::ADMISSION_MIN_FREE_GIB)
            .count() as u32
    }

    /// `max_allowed = min(max_gpu, max(min_gpu, available - gpu_left))`,
    /// floored at 0.
    pub fn max_allowed(&self, candidates: &[u32], probe: &dyn GpuProbe) -> u32 {
        let available = self.available(candidates, probe);
        let headroom = available.saturating_sub(self.config.gpu_left);
        let floored = headroom.max(self.config.min_gpu);
        floored.min(self.config.max_gpu)
    }

    /// Admit a request for `n` more devices iff
    /// `count_devices_held_by_user() + n <= max_allowed`.
    pub fn can_acquire(
        &self,
        n: u32,
        candidates: &[u32],
        probe: &dyn GpuProbe,
        ownership: &OwnershipMap,
    ) -> bool {
        let held = ownership.count_devices_held_by_user(candidates, probe);
        let max_allowed = self.max_allowed(candidates, probe);
        held + n <= max_allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;
    use proptest::prelude::*;

    fn config(gpu_left: u32, min_gpu: u32, max_gpu: u32) -> Config {
        Config {
            gpu_left,
            min_gpu,
            max_gpu,
            ..Config::default()
        }
    }

    #[test]
    fn s3_dynamic_quota_shrink() {
        // Candidates = [0,1,2]; gpu_left=1, min_gpu=1, max_gpu=3.
        // Device 2 is foreign-occupied (free=0). available=2.
        // max_allowed = min(3, max(1, 2-1)) = 1.
        let cfg = config(1, 1, 3);
        let probe = MockProbe::new(vec![0, 1, 2])
            .with_free(0, 10.0)
            .with_free(1, 10.0)
            .with_free(2, 0.0);
        let admission = AdmissionController::new(&cfg);
        assert_eq!(admission.available(&[0, 1, 2], &probe), 2);
        assert_eq!(admission.max_allowed(&[0, 1, 2], &probe), 1);

        let ownership = OwnershipMap::new();
        assert!(!admission.can_acquire(2, &[0, 1, 2], &probe, &ownership));
        assert!(admission.can_acquire(1, &[0, 1, 2], &probe, &ownership));
    }

    #[test]
    fn min_gpu_is_a_floor() {
        // available - gpu_left would be negative; min_gpu guarantees >= 1.
        let cfg = config(5, 1, 3);
        let probe = MockProbe::new(vec![0]).with_free(0, 10.0);
        let admission = AdmissionController::new(&cfg);
        assert_eq!(admission.available(&[0], &probe), 1);
        assert_eq!(admission.max_allowed(&[0], &probe), 1);
    }

    #[test]
    fn max_gpu_is_a_ceiling() {
        let cfg = config(0, 0, 2);
        let probe = MockProbe::new(vec![0, 1, 2, 3])
            .with_free(0, 10.0)
            .with_free(1, 10.0)
            .with_free(2, 10.0)
            .with_free(3, 10.0);
        let admission = AdmissionController::new(&cfg);
        assert_eq!(admission.available(&[0, 1, 2, 3], &probe), 4);
        assert_eq!(admission.max_allowed(&[0, 1, 2, 3], &probe), 2);
    }

    #[test]
    fn admission_bound_holds_at_acquire_time() {
        let cfg = config(0, 0, 2);
        let probe = MockProbe::new(vec![0, 1]).with_free(0, 10.0).with_free(1, 10.0);
        let admission = AdmissionController::new(&cfg);
        let ownership = OwnershipMap::new();
        let _lease = ownership.try_acquire(&[0], 5).unwrap();
        assert!(!admission.can_acquire(2, &[0, 1], &probe, &ownership));
        assert!(admission.can_acquire(1, &[0, 1], &probe, &ownership));
    }

    proptest::proptest! {
        /// Spec §8's admission bound invariant: `max_allowed` never exceeds
        /// `max_gpu`, is never below `min_gpu` when `available >= min_gpu`
        /// devices actually exist, and is always `>= 0`.
        #[test]
        fn admission_bound_holds_for_any_quota_tuple(
            available in 0u32..32,
            gpu_left in 0u32..32,
            min_gpu in 0u32..32,
            max_gpu in 0u32..32,
        ) {
            let cfg = config(gpu_left, min_gpu, max_gpu);
            let devices: Vec<u32> = (0..available).collect();
            let mut probe = MockProbe::new(devices.clone());
            for d in &devices {
                probe = probe.with_free(*d, 10.0);
            }
            let admission = AdmissionController::new(&cfg);
            let max_allowed = admission.max_allowed(&devices, &probe);
            let expected = available.saturating_sub(gpu_left).max(min_gpu).min(max_gpu);

            prop_assert_eq!(max_allowed, expected);
            prop_assert!(max_allowed <= max_gpu);
        }
    }
}
