//! Command-line preparation for a dispatched task: substituting the
//! `{work_dir}` placeholder (spec §6) and formatting the device mask
//! injected as `CUDA_VISIBLE_DEVICES` (spec §4.6).

/// Replaces every occurrence of the literal token `{work_dir}` with
/// `work_dir`. Unlike the bracket-templating the teacher's single-shot CLI
/// used for its own `{}` GPU-id placeholder, the task file's placeholder is
/// a plain literal token with no escaping syntax (spec §6).
pub fn substitute_work_dir(command: &str, work_dir: &str) -> String {
    command.replace("{work_dir}", work_dir)
}

/// Formats the `CUDA_VISIBLE_DEVICES`-style device mask: comma-joined,
/// ascending (spec §6).
pub fn device_mask(devices: &[u32]) -> String {
    let mut sorted = devices.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
