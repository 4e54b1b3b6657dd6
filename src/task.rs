use std::path::Path;

use itertools::Itertools;
use log::warn;

use crate::error::{FailureKind, TaskFileError};

/// Position of a task within its queue. Doubles as the idempotence key
/// discussed in the restart Open Question (see DESIGN.md) — nothing
/// currently persists across restarts, but a future persistence layer
/// would key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub queue: u32,
    pub index: usize,
}

/// Runtime state of a task. Devices are only ever present while `Running`,
/// which makes "a task holds devices only while running" a type-level
/// invariant instead of a convention enforced by discipline.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Running { devices: Vec<u32> },
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Immutable description of a task, as parsed from the task file.
#[derive(Debug, Clone)]
pub struct TaskDescription {
    pub commands: Vec<String>,
    pub device_count: u32,
    pub mem_gib: f64,
}

/// A task's full runtime record: immutable description plus mutable
/// fields owned exclusively by its queue's worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub description: TaskDescription,
    pub state: TaskState,
    pub retry_count: u32,
    pub backoff_until: Option<std::time::Instant>,
    pub last_error: Option<FailureKind>,
}

impl Task {
    fn new(id: TaskId, description: TaskDescription) -> Self {
        Self {
            id,
            description,
            state: TaskState::Pending,
            retry_count: 0,
            backoff_until: None,
            last_error: None,
        }
    }

    /// A task is ready iff `state == pending && now >= backoff_until`.
    pub fn is_ready(&self, now: std::time::Instant) -> bool {
        matches!(self.state, TaskState::Pending)
            && self.backoff_until.map(|deadline| now >= deadline).unwrap_or(true)
    }
}

/// An ordered list of tasks sharing an integer queue id. Queues preserve
/// task-file order; at most one task per queue is `Running` at any instant
/// (enforced by the runner's single-threaded walk, not by this type).
#[derive(Debug, Clone)]
pub struct Queue {
    pub id: u32,
    pub tasks: Vec<Task>,
}

/// Parses the plain-text task file described in spec §6.
///
/// Task blocks are separated by blank lines; `#`-prefixed lines are
/// comments. Within a block: the first non-comment line is the queue id
/// (a leading integer token, trailing comment allowed); for multi-GPU
/// tasks the penultimate non-comment line is the device count; the final
/// non-comment line is the per-device memory requirement in GiB; every
/// line in between is a command.
///
/// A block with fewer than four non-comment lines (queue id, at least one
/// command, device count, memory) is skipped with a `warn!` — the parser
/// never aborts the daemon over a malformed block. Only an I/O failure
/// opening the file itself is propagated as an error.
pub fn parse_task_file(path: impl AsRef<Path>) -> Result<Vec<Queue>, TaskFileError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| TaskFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut by_queue: Vec<(u32, Vec<TaskDescription>)> = Vec::new();

    for (block_idx, block) in content.split("\n\n").enumerate() {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();

        if lines.len() < 4 {
            if !lines.is_empty() {
                warn!(
                    "skipping malformed task block #{} ({} non-comment lines, need >= 4)",
                    block_idx,
                    lines.len()
                );
            }
            continue;
        }

        let queue_line = lines[0];
        let device_count_line = lines[lines.len() - 2];
        let mem_line = lines[lines.len() - 1];
        let commands: Vec<String> = lines[1..lines.len() - 2].iter().map(|s| s.to_string()).collect();

        let parsed = (|| -> Option<(u32, u32, f64)> {
            let queue_id = parse_leading_int(queue_line)?;
            let device_count = parse_leading_int(device_count_line)?;
            let mem_gib = parse_leading_int(mem_line)? as f64;
            Some((queue_id, device_count, mem_gib))
        })();

        let Some((queue_id, device_count, mem_gib)) = parsed else {
            warn!(
                "skipping task block #{}: failed to parse queue id / device count / memory line",
                block_idx
            );
            continue;
        };

        if device_count == 0 {
            warn!("skipping task block #{}: device count must be >= 1", block_idx);
            continue;
        }

        by_queue
            .entry_or_insert(queue_id)
            .push(TaskDescription {
                commands,
                device_count,
                mem_gib,
            });
    }

    Ok(by_queue
        .into_iter()
        .map(|(id, descriptions)| Queue {
            id,
            tasks: descriptions
                .into_iter()
                .enumerate()
                .map(|(index, description)| Task::new(TaskId { queue: id, index }, description))
                .collect(),
        })
        .collect())
}

/// Parses a leading integer token from a line, tolerating a trailing
/// comment (e.g. `"0  # queue id"`), matching the original's
/// `_parse_number` helper.
fn parse_leading_int(line: &str) -> Option<u32> {
    let digits_start = line.find(|c: char| c.is_ascii_digit())?;
    let rest = &line[digits_start..];
    let token = rest.split_whitespace().next()?;
    token.parse().ok()
}

/// Small helper trait keeping queue-grouping insertion order stable
/// without pulling in a full ordered-map type.
trait EntryOrInsert<K, V> {
    fn entry_or_insert(&mut self, key: K) -> &mut V;
}

impl<V: Default> EntryOrInsert<u32, V> for Vec<(u32, V)> {
    fn entry_or_insert(&mut self, key: u32) -> &mut V {
        if let Some(pos) = self.iter().find_position(|(k, _)| *k == key).map(|(i, _)| i) {
            &mut self[pos].1
        } else {
            self.push((key, V::default()));
            let last = self.len() - 1;
            &mut self[last].1
        }
    }
}
