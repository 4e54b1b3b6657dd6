use std::thread;
use std::time::Duration;

use crate::config::fixed;
use crate::probe::{GpuProbe, GpuSample};

/// Selector scoring mode (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Pack tightly: prefer devices that look idle but have little free
    /// memory, leaving large-free devices for future big jobs.
    MemorySave,
    /// Avoid collisions: prefer devices that look idle and have little
    /// used memory.
    MemorySafe,
}

impl SelectMode {
    pub fn from_memory_save_flag(memory_save_mode: bool) -> Self {
        if memory_save_mode {
            SelectMode::MemorySave
        } else {
            SelectMode::MemorySafe
        }
    }
}

/// Parameters controlling the stability burst. Production code uses
/// [`Sampling::default`] (30 samples, 100ms apart, per spec); tests inject
/// a mock probe with pre-seeded samples so the burst still runs its real
/// loop without needing a wall-clock 3 seconds per call.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub count: usize,
    pub interval: Duration,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            count: fixed::SELECTOR_SAMPLE_COUNT,
            interval: fixed::SELECTOR_SAMPLE_INTERVAL,
        }
    }
}

fn average(samples: &[GpuSample]) -> Option<GpuSample> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    Some(GpuSample {
        free_gib: samples.iter().map(|s| s.free_gib).sum::<f64>() / n,
        used_gib: samples.iter().map(|s| s.used_gib).sum::<f64>() / n,
        // memory_total is taken from the first sample, not averaged.
        total_gib: samples[0].total_gib,
        util_pct: samples.iter().map(|s| s.util_pct).sum::<f64>() / n,
    })
}

fn priority(sample: &GpuSample, mode: SelectMode) -> (f64, f64) {
    let mem_util = sample.memory_utilization();
    match mode {
        SelectMode::MemorySave => (mem_util * sample.free_gib, sample.free_gib),
        SelectMode::MemorySafe => (mem_util * sample.used_gib, sample.used_gib),
    }
}

/// `select(candidates, count, required_mem_gib, mode) -> devices`, per
/// spec §4.2. Returns up to `count` devices, fewer if not enough
/// candidates satisfy the memory requirement.
pub fn select(
    probe: &dyn GpuProbe,
    candidates: &[u32],
    count: usize,
    required_mem_gib: f64,
    mode: SelectMode,
    sampling: Sampling,
) -> Vec<u32> {
    if candidates.is_empty() || count == 0 {
        return Vec::new();
    }

    let mut samples: Vec<Vec<GpuSample>> = vec![Vec::with_capacity(sampling.count); candidates.len()];
    for i in 0..sampling.count {
        for (slot, &device) in samples.iter_mut().zip(candidates.iter()) {
            if let Some(s) = probe.sample_once(device) {
                slot.push(s);
            }
        }
        if i + 1 < sampling.count {
            thread::sleep(sampling.interval);
        }
    }

    let mut scored: Vec<(u32, (f64, f64))> = candidates
        .iter()
        .zip(samples.iter())
        .filter_map(|(&device, readings)| {
            let avg = average(readings)?;
            if avg.free_gib < required_mem_gib {
                return None;
            }
            Some((device, priority(&avg, mode)))
        })
        .collect();

    // Ascending by (primary, secondary); ties broken by device id
    // ascending for determinism.
    scored.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    scored.into_iter().take(count).map(|(device, _)| device).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;

    fn sample(free: f64, used: f64, total: f64, util: f64) -> GpuSample {
        GpuSample {
            free_gib: free,
            used_gib: used,
            total_gib: total,
            util_pct: util,
        }
    }

    #[test]
    fn drops_devices_below_required_memory() {
        let probe = MockProbe::new(vec![0, 1])
            .with_sample(0, sample(1.0, 9.0, 10.0, 50.0))
            .with_sample(1, sample(8.0, 2.0, 10.0, 10.0));
        let result = select(
            &probe,
            &[0, 1],
            2,
            2.0,
            SelectMode::MemorySave,
            Sampling { count: 3, interval: Duration::ZERO },
        );
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn save_mode_tie_break_by_device_id() {
        // S5: three identical candidates, count=2, mode=save => [0, 1]
        let probe = MockProbe::new(vec![2, 0, 1])
            .with_sample(0, sample(9.0, 1.0, 10.0, 0.0))
            .with_sample(1, sample(9.0, 1.0, 10.0, 0.0))
            .with_sample(2, sample(9.0, 1.0, 10.0, 0.0));
        let result = select(
            &probe,
            &[2, 0, 1],
            2,
            0.0,
            SelectMode::MemorySave,
            Sampling { count: 5, interval: Duration::ZERO },
        );
        assert_eq!(result, vec![0, 1]);
    }

    #[test]
    fn safe_mode_prefers_low_used_memory() {
        let probe = MockProbe::new(vec![0, 1])
            .with_sample(0, sample(1.0, 9.0, 10.0, 90.0))
            .with_sample(1, sample(9.0, 1.0, 10.0, 10.0));
        let result = select(
            &probe,
            &[0, 1],
            1,
            0.0,
            SelectMode::MemorySafe,
            Sampling { count: 2, interval: Duration::ZERO },
        );
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn returns_fewer_than_count_when_not_enough_candidates() {
        let probe = MockProbe::new(vec![0]).with_sample(0, sample(5.0, 5.0, 10.0, 0.0));
        let result = select(
            &probe,
            &[0],
            3,
            0.0,
            SelectMode::MemorySave,
            Sampling { count: 1, interval: Duration::ZERO },
        );
        assert_eq!(result, vec![0]);
    }

    #[test]
    fn empty_candidates_returns_empty() {
        let probe = MockProbe::new(vec![]);
        let result = select(
            &probe,
            &[],
            2,
            0.0,
            SelectMode::MemorySave,
            Sampling::default(),
        );
        assert!(result.is_empty());
    }
}
