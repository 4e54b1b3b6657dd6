//! Queue Runner & Dispatcher (spec §4.6) — one worker per queue, strict
//! intra-queue serial execution, inter-queue parallelism bounded by the
//! ownership map and the admission controller.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, select, Receiver};
use log::{error, info, warn};

use crate::admission::AdmissionController;
use crate::command::{device_mask, substitute_work_dir};
use crate::config::{fixed, Config};
use crate::error::FailureKind;
use crate::ownership::OwnershipMap;
use crate::probe::GpuProbe;
use crate::retry::{RetryPolicy, Transition};
use crate::selector::{self, SelectMode, Sampling};
use crate::status::{StatusEvent, StatusSink};
use crate::task::{Queue, Task, TaskState};

/// The single coordinator value passed to every worker (spec §9) — no
/// ambient process-wide singleton. `shutdown_flag` is checked at every
/// suspension point; `shutdown_rx` lets a worker wake immediately from a
/// sleep instead of waiting out the full interval (spec §5).
pub struct Engine {
    pub config: Arc<Config>,
    pub probe: Arc<dyn GpuProbe>,
    pub ownership: OwnershipMap,
    pub status: Arc<dyn StatusSink>,
    pub candidates: Vec<u32>,
    pub shutdown_flag: Arc<AtomicBool>,
    pub shutdown_rx: Receiver<()>,
    /// Parameters for the selector's stability burst. Production wiring
    /// uses [`Sampling::default`] (30 samples, 100ms apart, per spec §4.2);
    /// tests inject a near-instant sampling so the real burst loop still
    /// runs without costing wall-clock seconds per acquisition attempt.
    pub sampling: Sampling,
}

impl Engine {
    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `dur` unless shutdown fires first. Returns `true` if
    /// shutdown interrupted the sleep.
    fn interruptible_sleep(&self, dur: Duration) -> bool {
        select! {
            recv(self.shutdown_rx) -> _ => true,
            recv(after(dur)) -> _ => false,
        }
    }
}

/// What a queue worker reports to the supervisor when it stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Completed,
    Aborted { reason: String },
}

/// `eligible_devices(N, mem, q)` (spec §4.6): start from all candidates; in
/// non-maximize mode drop devices already owned or foreign-occupied; drop
/// devices under the memory requirement; delegate to the selector if enough
/// survive, else fall back to the first `N` of the survivors (the
/// documented degraded path).
fn eligible_devices(engine: &Engine, n: u32, mem_gib: f64) -> Option<Vec<u32>> {
    let mut pool = engine.candidates.clone();

    if !engine.config.maximize_resource_utilization {
        pool = engine.ownership.unowned(&pool);
        pool.retain(|&d| engine.probe.foreign_users_on(d).is_empty());
    }
    pool.retain(|&d| engine.probe.free_memory_gib(d) >= mem_gib);

    if (pool.len() as u32) < n {
        return None;
    }

    let mode = SelectMode::from_memory_save_flag(engine.config.memory_save_mode);
    let mut chosen = selector::select(
        engine.probe.as_ref(),
        &pool,
        n as usize,
        mem_gib,
        mode,
        engine.sampling,
    );
    if chosen.len() < n as usize {
        chosen = pool.into_iter().take(n as usize).collect();
    }
    Some(chosen)
}

/// The admission-aware acquire loop (spec §4.6). Polls `check_time` until
/// either devices are acquired or `wait_timeout` elapses.
fn wait_for_devices(
    engine: &Engine,
    queue_id: u32,
    n: u32,
    mem_gib: f64,
) -> Option<crate::ownership::DeviceLease> {
    let deadline = Instant::now() + fixed::DEVICE_WAIT_TIMEOUT;
    // Back-dated so the first iteration logs immediately; falls back to
    // "now" (delaying the first log by one check_time tick) rather than
    // panicking when the monotonic clock is younger than check_time, which
    // is reachable on a freshly-booted host with a large configured value.
    let mut last_log = Instant::now()
        .checked_sub(engine.config.check_time_duration())
        .unwrap_or_else(Instant::now);

    loop {
        if engine.is_shutting_down() {
            return None;
        }

        let admission = AdmissionController::new(&engine.config);
        if admission.can_acquire(n, &engine.candidates, engine.probe.as_ref(), &engine.ownership) {
            if let Some(candidates) = eligible_devices(engine, n, mem_gib) {
                if let Some(lease) = engine.ownership.try_acquire(&candidates, queue_id) {
                    return Some(lease);
                }
                // Lost the race to another worker between the check and the
                // acquire; try_acquire's own atomicity still guarantees
                // mutual exclusion, so just loop and retry.
            }
        }

        if last_log.elapsed() >= engine.config.check_time_duration() {
            info!(
                "queue {}: waiting for {} device(s) with >= {} GiB free each",
                queue_id, n, mem_gib
            );
            last_log = Instant::now();
        }

        if engine.interruptible_sleep(engine.config.check_time_duration()) {
            return None;
        }
        if Instant::now() >= deadline {
            return None;
        }
    }
}

/// Runs `task`'s command list sequentially in a single child shell per
/// command, injecting a `CUDA_VISIBLE_DEVICES`-style mask and substituting
/// `{work_dir}`. Each command gets a hard 2-hour wall timeout, waited on by
/// polling `try_wait` (the standard library has no native timed wait) so
/// the timeout and shutdown responsiveness are both honored without an
/// extra thread per command.
fn run_commands(engine: &Engine, task: &Task, devices: &[u32]) -> Result<(), FailureKind> {
    let mask = device_mask(devices);
    let work_dir = engine.config.work_dir.clone().unwrap_or_else(|| ".".to_string());

    for raw_command in &task.description.commands {
        let substituted = substitute_work_dir(raw_command, &work_dir);
        let full_command = match &engine.config.command_prefix {
            Some(prefix) => format!("{prefix} && {substituted}"),
            None => substituted,
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&full_command);
        // Explicit environment map built from the parent's env plus the
        // device mask — never an ambient mutated global env (spec §9).
        cmd.env_clear();
        cmd.envs(std::env::vars());
        cmd.env("CUDA_VISIBLE_DEVICES", &mask);
        cmd.stdin(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| FailureKind::SpawnError(e.to_string()))?;
        engine.probe.register_own_pid(child.id());

        let deadline = Instant::now() + fixed::COMMAND_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        break;
                    }
                    return Err(FailureKind::ExitCode(status.code().unwrap_or(-1)));
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(FailureKind::Timeout);
                    }
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => return Err(FailureKind::SpawnError(e.to_string())),
            }
        }
    }
    Ok(())
}

/// One worker's full lifetime: walks its queue's tasks in file order,
/// retrying each with backoff until it completes, the retry ceiling is hit,
/// or the device wait times out. Aborting on the first permanent failure
/// means later tasks in the same queue — which may depend on it — are
/// never attempted.
pub fn run_queue(mut queue: Queue, engine: Arc<Engine>) -> QueueOutcome {
    let retry_policy = RetryPolicy::from_config(&engine.config.retry_config);

    for idx in 0..queue.tasks.len() {
        loop {
            if engine.is_shutting_down() {
                let reason = "shutdown".to_string();
                engine
                    .status
                    .record(StatusEvent::QueueFail { queue: queue.id, error: reason.clone() });
                return QueueOutcome::Aborted { reason };
            }

            if queue.tasks[idx].state.is_terminal() {
                break;
            }

            let now = Instant::now();
            if !queue.tasks[idx].is_ready(now) {
                if let Some(backoff_until) = queue.tasks[idx].backoff_until {
                    let wait = backoff_until.saturating_duration_since(now).min(fixed::MAX_BACKOFF_SLEEP);
                    if engine.interruptible_sleep(wait) {
                        let reason = "shutdown".to_string();
                        engine.status.record(StatusEvent::QueueFail {
                            queue: queue.id,
                            error: reason.clone(),
                        });
                        return QueueOutcome::Aborted { reason };
                    }
                }
                continue;
            }

            let (n, mem_gib) = {
                let desc = &queue.tasks[idx].description;
                (desc.device_count, desc.mem_gib)
            };

            let lease = match wait_for_devices(&engine, queue.id, n, mem_gib) {
                Some(lease) => lease,
                None => {
                    let reason = "device wait timed out".to_string();
                    warn!("queue {}: {} (task {})", queue.id, reason, idx);
                    engine
                        .status
                        .record(StatusEvent::QueueFail { queue: queue.id, error: reason.clone() });
                    return QueueOutcome::Aborted { reason };
                }
            };

            let devices = lease.devices().to_vec();
            queue.tasks[idx].state = TaskState::Running { devices: devices.clone() };
            engine.status.record(StatusEvent::TaskStart {
                task: queue.tasks[idx].id.into(),
                gpus: devices.clone(),
            });
            info!("queue {}: task {} starting on devices {:?}", queue.id, idx, devices);

            let result = run_commands(&engine, &queue.tasks[idx], &devices);
            // Devices are released before the state transition (spec §4.5).
            drop(lease);

            match result {
                Ok(()) => {
                    queue.tasks[idx].state = TaskState::Completed;
                    engine
                        .status
                        .record(StatusEvent::TaskSuccess { task: queue.tasks[idx].id.into() });
                    info!("queue {}: task {} completed", queue.id, idx);
                    break;
                }
                Err(kind) => {
                    let transition =
                        retry_policy.record_failure(&mut queue.tasks[idx], kind.clone(), Instant::now());
                    let will_retry = transition != Transition::PermanentFailure;
                    engine.status.record(StatusEvent::TaskFail {
                        task: queue.tasks[idx].id.into(),
                        will_retry,
                        error: kind.to_string(),
                    });

                    match transition {
                        Transition::PermanentFailure => {
                            let reason = format!(
                                "task {} exceeded retry ceiling ({} retries)",
                                idx, queue.tasks[idx].retry_count
                            );
                            error!("queue {}: {}", queue.id, reason);
                            engine.status.record(StatusEvent::QueueFail {
                                queue: queue.id,
                                error: reason.clone(),
                            });
                            return QueueOutcome::Aborted { reason };
                        }
                        Transition::Backoff | Transition::RetryPending => {
                            if engine.interruptible_sleep(fixed::RETRY_SLEEP) {
                                let reason = "shutdown".to_string();
                                engine.status.record(StatusEvent::QueueFail {
                                    queue: queue.id,
                                    error: reason.clone(),
                                });
                                return QueueOutcome::Aborted { reason };
                            }
                            continue;
                        }
                    }
                }
            }
        }
    }

    engine.status.record(StatusEvent::QueueComplete { queue: queue.id });
    info!("queue {}: all tasks completed", queue.id);
    QueueOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::status::NullStatusSink;
    use crate::task::{TaskDescription, TaskId};

    /// Builds a test `Engine`. Returns the shutdown sender alongside it —
    /// the caller must keep it alive for as long as the engine is in use:
    /// dropping it closes `shutdown_rx`, and a closed receiver is always
    /// immediately selectable, which makes `interruptible_sleep` report
    /// "shutting down" on every call regardless of `shutdown_flag`.
    fn engine(config: Config, probe: MockProbe) -> (Arc<Engine>, crossbeam_channel::Sender<()>) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let candidates = probe.devices.clone();
        let eng = Arc::new(Engine {
            config: Arc::new(Config { check_time: 0, ..config }),
            probe: Arc::new(probe),
            ownership: OwnershipMap::new(),
            status: Arc::new(NullStatusSink),
            candidates,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_rx: rx,
            sampling: Sampling { count: 1, interval: Duration::ZERO },
        });
        (eng, tx)
    }

    fn single_task_queue(queue_id: u32, command: &str, n: u32, mem_gib: f64) -> Queue {
        Queue {
            id: queue_id,
            tasks: vec![Task {
                id: TaskId { queue: queue_id, index: 0 },
                description: TaskDescription {
                    commands: vec![command.to_string()],
                    device_count: n,
                    mem_gib,
                },
                state: TaskState::Pending,
                retry_count: 0,
                backoff_until: None,
                last_error: None,
            }],
        }
    }

    #[test]
    fn s1_happy_path_single_queue_single_gpu() {
        let config = Config { gpu_left: 0, min_gpu: 1, max_gpu: 1, ..Config::default() };
        let probe = MockProbe::new(vec![0]).with_free(0, 10.0);
        let (eng, _shutdown_tx) = engine(config, probe);
        let queue = single_task_queue(0, "true", 1, 2.0);

        let outcome = run_queue(queue, eng.clone());
        assert_eq!(outcome, QueueOutcome::Completed);
        assert_eq!(eng.ownership.owner_of(0), None);
    }

    #[test]
    fn s2_two_queues_serialize_on_one_device() {
        let config = Config { gpu_left: 0, min_gpu: 1, max_gpu: 2, ..Config::default() };
        let probe = MockProbe::new(vec![0]).with_free(0, 10.0);
        let (eng, _shutdown_tx) = engine(config, probe);

        let q0 = single_task_queue(0, "true", 1, 2.0);
        let q1 = single_task_queue(1, "true", 1, 2.0);

        let eng_a = eng.clone();
        let eng_b = eng.clone();
        let h1 = thread::spawn(move || run_queue(q0, eng_a));
        let h2 = thread::spawn(move || run_queue(q1, eng_b));

        assert_eq!(h1.join().unwrap(), QueueOutcome::Completed);
        assert_eq!(h2.join().unwrap(), QueueOutcome::Completed);
        assert_eq!(eng.ownership.owner_of(0), None);
    }

    #[test]
    fn failing_command_retries_then_eventually_succeeds_releasing_devices_between_attempts() {
        let config = Config {
            gpu_left: 0,
            min_gpu: 1,
            max_gpu: 1,
            retry_config: crate::config::RetryConfig {
                max_retry_before_backoff: 1000,
                backoff_duration: 1,
            },
            ..Config::default()
        };
        let probe = MockProbe::new(vec![0]).with_free(0, 10.0);
        let (eng, _shutdown_tx) = engine(config, probe);
        // `false` always exits non-zero; run a bounded number of iterations
        // by checking the queue aborts only after the retry ceiling, not
        // after a handful of attempts.
        let mut queue = single_task_queue(0, "false", 1, 2.0);
        queue.tasks[0].retry_count = fixed::MAX_RETRY_CEILING - 1;
        let outcome = run_queue(queue, eng.clone());
        assert!(matches!(outcome, QueueOutcome::Aborted { .. }));
        assert_eq!(eng.ownership.owner_of(0), None);
    }

    #[test]
    fn shutdown_mid_wait_leaves_no_device_owned() {
        let config = Config { gpu_left: 1, min_gpu: 0, max_gpu: 1, ..Config::default() };
        // Device 0 reports 0 GiB free, so admission never lets the queue in,
        // forcing it into the wait loop where shutdown must interrupt it.
        let probe = MockProbe::new(vec![0]).with_free(0, 0.0);
        let (eng, _shutdown_tx) = engine(config, probe);
        let queue = single_task_queue(0, "true", 1, 2.0);

        let flag = eng.shutdown_flag.clone();
        let eng2 = eng.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || run_queue(queue, eng2));
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);

        let outcome = handle.join().unwrap();
        // With the shutdown channel kept open (see `engine` above), a
        // disconnected-receiver short-circuit can't be what ended the wait,
        // so this elapsed-time floor is proof the flag is what did.
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(matches!(outcome, QueueOutcome::Aborted { .. }));
        assert_eq!(eng.ownership.owner_of(0), None);
    }
}
