use std::collections::HashSet;

use log::debug;
use nvml_wrapper::Nvml;
use parking_lot::Mutex;

/// A single device stats reading, averaged into a [`crate::selector::GpuSample`]
/// by the selector's stability burst.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSample {
    pub free_gib: f64,
    pub used_gib: f64,
    pub total_gib: f64,
    pub util_pct: f64,
}

impl GpuSample {
    pub fn memory_utilization(&self) -> f64 {
        if self.total_gib > 0.0 {
            self.used_gib / self.total_gib
        } else {
            0.0
        }
    }
}

/// External collaborator interface (spec §4.1): stateless, conservative-on-
/// error queries against the system's GPU driver. Must be safely callable
/// concurrently from multiple queue runners.
pub trait GpuProbe: Send + Sync {
    /// Total set of device ids the engine may consider.
    fn enumerate_devices(&self) -> Vec<u32>;

    /// Conservative: any error is reported as 0.0 free (device judged
    /// unavailable) rather than propagated.
    fn free_memory_gib(&self, device: u32) -> f64;

    /// Processes on `device` belonging to the current OS user that are
    /// *not* children of this scheduler. Only consulted when
    /// `maximize_resource_utilization` is false.
    fn foreign_users_on(&self, device: u32) -> Vec<u32>;

    /// Single-shot stats reading, the primitive the selector's 30-sample
    /// burst (spec §4.2 step 1) averages over.
    fn sample_once(&self, device: u32) -> Option<GpuSample>;

    /// Records a child pid as belonging to this scheduler, so it is
    /// excluded from `foreign_users_on`. No-op for probes that don't track
    /// this (the mock probe, which is seeded directly instead).
    fn register_own_pid(&self, _pid: u32) {}
}

/// Production probe backed by `nvml-wrapper`, the teacher's own dependency.
pub struct NvmlProbe {
    nvml: Nvml,
    own_pids: Mutex<HashSet<u32>>,
}

impl NvmlProbe {
    pub fn init() -> anyhow::Result<Self> {
        let nvml = Nvml::builder().lib_path("libnvidia-ml.so.1".as_ref()).init()?;
        Ok(Self {
            nvml,
            own_pids: Mutex::new(HashSet::new()),
        })
    }
}

impl GpuProbe for NvmlProbe {
    fn enumerate_devices(&self) -> Vec<u32> {
        match self.nvml.device_count() {
            Ok(count) => (0..count).collect(),
            Err(e) => {
                debug!("failed to enumerate devices: {}", e);
                Vec::new()
            }
        }
    }

    fn free_memory_gib(&self, device: u32) -> f64 {
        let result: Option<f64> = (|| {
            let dev = self.nvml.device_by_index(device).ok()?;
            let mem = dev.memory_info().ok()?;
            Some(mem.free as f64 / (1024.0 * 1024.0 * 1024.0))
        })();
        result.unwrap_or(0.0)
    }

    fn foreign_users_on(&self, device: u32) -> Vec<u32> {
        let current_uid = current_uid();
        let result: Option<Vec<u32>> = (|| {
            let dev = self.nvml.device_by_index(device).ok()?;
            let procs = dev.running_compute_processes().ok()?;
            Some(
                procs
                    .into_iter()
                    .map(|p| p.pid)
                    .filter(|pid| !self.own_pids.lock().contains(pid))
                    .filter(|pid| process_owned_by(*pid, current_uid))
                    .collect(),
            )
        })();
        result.unwrap_or_default()
    }

    fn register_own_pid(&self, pid: u32) {
        self.own_pids.lock().insert(pid);
    }

    fn sample_once(&self, device: u32) -> Option<GpuSample> {
        let dev = self.nvml.device_by_index(device).ok()?;
        let mem = dev.memory_info().ok()?;
        let util = dev.utilization_rates().ok()?;
        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        Some(GpuSample {
            free_gib: mem.free as f64 / GIB,
            used_gib: mem.used as f64 / GIB,
            total_gib: mem.total as f64 / GIB,
            util_pct: util.memory as f64,
        })
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(unix)]
fn process_owned_by(pid: u32, uid: u32) -> bool {
    match std::fs::metadata(format!("/proc/{}", pid)) {
        Ok(meta) => {
            use std::os::unix::fs::MetadataExt;
            meta.uid() == uid
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_owned_by(_pid: u32, _uid: u32) -> bool {
    false
}

/// Deterministic probe used by tests: every field is pre-seeded, and
/// queries never touch a real driver.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MockProbe {
        pub devices: Vec<u32>,
        pub free_mem: Mutex<HashMap<u32, f64>>,
        pub foreign: Mutex<HashMap<u32, Vec<u32>>>,
        pub samples: Mutex<HashMap<u32, Vec<GpuSample>>>,
    }

    impl MockProbe {
        pub fn new(devices: Vec<u32>) -> Self {
            Self {
                devices,
                ..Default::default()
            }
        }

        pub fn with_free(self, device: u32, gib: f64) -> Self {
            self.free_mem.lock().insert(device, gib);
            self
        }

        pub fn with_sample(self, device: u32, sample: GpuSample) -> Self {
            self.samples.lock().entry(device).or_default().push(sample);
            self
        }

        pub fn with_foreign(self, device: u32, pids: Vec<u32>) -> Self {
            self.foreign.lock().insert(device, pids);
            self
        }
    }

    impl GpuProbe for MockProbe {
        fn enumerate_devices(&self) -> Vec<u32> {
            self.devices.clone()
        }

        fn free_memory_gib(&self, device: u32) -> f64 {
            self.free_mem.lock().get(&device).copied().unwrap_or(0.0)
        }

        fn foreign_users_on(&self, device: u32) -> Vec<u32> {
            self.foreign.lock().get(&device).cloned().unwrap_or_default()
        }

        fn sample_once(&self, device: u32) -> Option<GpuSample> {
            // Cycle through seeded samples so repeated sampling (the
            // selector's burst) returns a stable, possibly-varying
            // sequence without needing real time to pass.
            let samples = self.samples.lock();
            let list = samples.get(&device)?;
            if list.is_empty() {
                return None;
            }
            Some(list[0])
        }
    }
}
