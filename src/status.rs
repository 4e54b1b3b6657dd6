use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::warn;
use serde::Serialize;

use crate::task::TaskId;

/// Per-queue/per-task events the engine reports to the status sink, per
/// spec §6. The engine only ever writes; it never reads this back.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    TaskStart { task: TaskIdDto, gpus: Vec<u32> },
    TaskSuccess { task: TaskIdDto },
    TaskFail { task: TaskIdDto, will_retry: bool, error: String },
    QueueComplete { queue: u32 },
    QueueFail { queue: u32, error: String },
    SetState { state: String },
    SetError { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskIdDto {
    pub queue: u32,
    pub index: usize,
}

impl From<TaskId> for TaskIdDto {
    fn from(id: TaskId) -> Self {
        Self {
            queue: id.queue,
            index: id.index,
        }
    }
}

/// Write-only sink for scheduler lifecycle events (spec §6). The engine
/// calls it and never reads from it; implementations must not block the
/// calling worker for long — failures are swallowed, matching the
/// original's `StatusWriter._save`, whose write failures "should not
/// affect scheduler operation".
pub trait StatusSink: Send + Sync {
    fn record(&self, event: StatusEvent);
}

/// Discards every event. Used in tests and for headless runs.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn record(&self, _event: StatusEvent) {}
}

#[derive(Debug, Clone, Serialize, Default)]
struct QueueSnapshot {
    status: String,
    current_gpus: Vec<u32>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SchedulerSnapshot {
    pid: u32,
    state: String,
    queues: HashMap<u32, QueueSnapshot>,
}

/// Writes one JSON file per scheduler process under `status_dir`, named
/// `{pid}.json`. Writes are atomic-rename (write to a sibling `.tmp` file,
/// then rename over the target), matching `StatusWriter._save` in the
/// original Python tool.
pub struct FileStatusSink {
    path: PathBuf,
    tmp_path: PathBuf,
    state: Mutex<SchedulerSnapshot>,
}

impl FileStatusSink {
    pub fn new(status_dir: impl AsRef<Path>, pid: u32) -> std::io::Result<Self> {
        let dir = status_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{pid}.json"));
        let tmp_path = dir.join(format!("{pid}.json.tmp"));
        let sink = Self {
            path,
            tmp_path,
            state: Mutex::new(SchedulerSnapshot {
                pid,
                state: "starting".to_string(),
                queues: HashMap::new(),
            }),
        };
        sink.save();
        Ok(sink)
    }

    fn save(&self) {
        let snapshot = self.state.lock().expect("status sink mutex poisoned");
        let body = match serde_json::to_vec_pretty(&*snapshot) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to serialize status snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.tmp_path, body) {
            warn!("failed to write status tmp file {:?}: {}", self.tmp_path, e);
            return;
        }
        if let Err(e) = std::fs::rename(&self.tmp_path, &self.path) {
            warn!("failed to rename status file into place: {}", e);
        }
    }
}

impl Drop for FileStatusSink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl StatusSink for FileStatusSink {
    fn record(&self, event: StatusEvent) {
        {
            let mut snapshot = self.state.lock().expect("status sink mutex poisoned");
            match &event {
                StatusEvent::TaskStart { task, gpus } => {
                    let q = snapshot.queues.entry(task.queue).or_default();
                    q.status = "running".to_string();
                    q.current_gpus = gpus.clone();
                }
                StatusEvent::TaskSuccess { task } => {
                    let q = snapshot.queues.entry(task.queue).or_default();
                    q.current_gpus.clear();
                }
                StatusEvent::TaskFail { task, error, .. } => {
                    let q = snapshot.queues.entry(task.queue).or_default();
                    q.current_gpus.clear();
                    q.last_error = Some(error.clone());
                }
                StatusEvent::QueueComplete { queue } => {
                    snapshot.queues.entry(*queue).or_default().status = "completed".to_string();
                }
                StatusEvent::QueueFail { queue, error } => {
                    let q = snapshot.queues.entry(*queue).or_default();
                    q.status = "failed".to_string();
                    q.last_error = Some(error.clone());
                }
                StatusEvent::SetState { state } => {
                    snapshot.state = state.clone();
                }
                StatusEvent::SetError { error } => {
                    snapshot.state = "failed".to_string();
                    let _ = error;
                }
            }
        }
        self.save();
    }
}

/// Forwards every event to an inner sink while also driving one
/// `indicatif` progress line per queue — a purely terminal convenience
/// layered on top of the status-sink events, not a substitute for them
/// (spec SPEC_FULL §4.6).
pub struct ProgressStatusSink<S> {
    inner: S,
    multi: MultiProgress,
    bars: Mutex<HashMap<u32, ProgressBar>>,
}

impl<S: StatusSink> ProgressStatusSink<S> {
    pub fn new(inner: S, multi: MultiProgress) -> Self {
        Self { inner, multi, bars: Mutex::new(HashMap::new()) }
    }

    fn bar_for(&self, queue: u32) -> ProgressBar {
        let mut bars = self.bars.lock().expect("progress bar map mutex poisoned");
        bars.entry(queue)
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new_spinner());
                if let Ok(style) = ProgressStyle::with_template("{spinner} queue {prefix}: {msg}") {
                    pb.set_style(style);
                }
                pb.set_prefix(queue.to_string());
                pb.enable_steady_tick(std::time::Duration::from_millis(200));
                pb
            })
            .clone()
    }
}

impl<S: StatusSink> StatusSink for ProgressStatusSink<S> {
    fn record(&self, event: StatusEvent) {
        match &event {
            StatusEvent::TaskStart { task, gpus } => {
                self.bar_for(task.queue)
                    .set_message(format!("task {} running on {:?}", task.index, gpus));
            }
            StatusEvent::TaskSuccess { task } => {
                self.bar_for(task.queue).set_message(format!("task {} succeeded", task.index));
            }
            StatusEvent::TaskFail { task, will_retry, error } => {
                let suffix = if *will_retry { "retrying" } else { "failed" };
                self.bar_for(task.queue)
                    .set_message(format!("task {} {} ({})", task.index, suffix, error));
            }
            StatusEvent::QueueComplete { queue } => {
                self.bar_for(*queue).finish_with_message("completed");
            }
            StatusEvent::QueueFail { queue, error } => {
                self.bar_for(*queue).finish_with_message(format!("aborted: {error}"));
            }
            StatusEvent::SetState { .. } | StatusEvent::SetError { .. } => {}
        }
        self.inner.record(event);
    }
}
