//! Derived figures shown next to the settings: memory use, storage and run time.

use serde::Serialize;

use crate::hardware::InstrumentStatus;

/// Memory, storage and timing figures for the current settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsOutput {
    /// Volume rate at the current settings
    pub volumes_per_s: f64,
    /// Size of one data buffer
    pub data_buffer_gb: f64,
    /// Percentage of the collaborator's per-buffer maximum
    pub data_buffer_pct: f64,
    /// Data buffer over its maximum
    pub data_buffer_exceeded: bool,
    /// Size of one preview buffer
    pub preview_buffer_gb: f64,
    /// Percentage of the preview buffer maximum
    pub preview_buffer_pct: f64,
    /// Preview buffer over its maximum
    pub preview_buffer_exceeded: bool,
    /// Memory the collaborator will allocate
    pub total_memory_gb: f64,
    /// Percentage of the collaborator's allocation maximum
    pub total_memory_pct: f64,
    /// Allocation over its maximum
    pub total_memory_exceeded: bool,
    /// Disk space one acquisition run will write
    pub total_storage_gb: f64,
    /// Shortest time one acquire call can take
    pub min_time_s: f64,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

/// Compute the figures for a run of `acquires` iterations over `positions`.
///
/// `positions` is 1 when the run does not loop over the position list.
pub fn settings_output(
    status: &InstrumentStatus,
    positions: usize,
    acquires: u32,
    delay_s: f64,
) -> SettingsOutput {
    let positions = positions.max(1) as f64;
    let acquires = f64::from(acquires.max(1));
    let data_gb = 1e-9 * status.bytes_per_data_buffer as f64;
    let preview_gb = 1e-9 * status.bytes_per_preview_buffer as f64;

    let min_pass_s = status.buffer_time_s * positions;
    let min_time_s = if delay_s > min_pass_s {
        delay_s * (acquires - 1.0) + min_pass_s
    } else {
        min_pass_s * acquires
    };

    SettingsOutput {
        volumes_per_s: status.volumes_per_s,
        data_buffer_gb: data_gb,
        data_buffer_pct: percent(status.bytes_per_data_buffer, status.max_bytes_per_buffer),
        data_buffer_exceeded: status.data_buffer_exceeded,
        preview_buffer_gb: preview_gb,
        preview_buffer_pct: percent(status.bytes_per_preview_buffer, status.max_bytes_per_buffer),
        preview_buffer_exceeded: status.preview_buffer_exceeded,
        total_memory_gb: 1e-9 * status.total_bytes as f64,
        total_memory_pct: percent(status.total_bytes, status.max_allocated_bytes),
        total_memory_exceeded: status.total_bytes_exceeded,
        total_storage_gb: (data_gb + preview_gb) * positions * acquires,
        min_time_s,
    }
}
