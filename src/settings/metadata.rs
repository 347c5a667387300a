//! Restoring settings from a previous acquisition's metadata file.
//!
//! The file is a list of `key: value` lines. Channel and power lists are
//! parenthesised literals such as `('LED', '488')` and `(25, 5)`; a
//! single-entry list may carry a trailing comma. `voxel_aspect_ratio` and
//! `scan_range_um` are written as floats and rounded on the way back in.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{Channel, EmissionFilter};
use crate::error::{AppResult, DaqError};

/// Settings read back from a metadata file.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredSettings {
    /// Enabled channels with their powers
    pub channels: Vec<(Channel, f64)>,
    /// Filter wheel
    pub emission_filter: EmissionFilter,
    /// Exposure per slice
    pub illumination_time_us: u32,
    /// Region height
    pub height_px: u32,
    /// Region width
    pub width_px: u32,
    /// Slice spacing
    pub voxel_aspect_ratio: u32,
    /// Volume depth
    pub scan_range_um: u32,
    /// Volumes per acquire call
    pub volumes_per_buffer: u32,
}

struct MetadataFile {
    path: PathBuf,
    entries: HashMap<String, (usize, String)>,
}

impl MetadataFile {
    fn parse(path: &Path, text: &str) -> Self {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(i, line)| {
                line.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), (i + 1, v.trim().to_string())))
            })
            .collect();
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    fn error(&self, line: usize, reason: impl Into<String>) -> DaqError {
        DaqError::Parse {
            path: self.path.clone(),
            line,
            reason: reason.into(),
        }
    }

    fn get(&self, key: &str) -> AppResult<(usize, &str)> {
        self.entries
            .get(key)
            .map(|(line, value)| (*line, value.as_str()))
            .ok_or_else(|| self.error(0, format!("missing key '{}'", key)))
    }

    fn integer(&self, key: &str) -> AppResult<u32> {
        let (line, value) = self.get(key)?;
        value
            .parse()
            .map_err(|_| self.error(line, format!("'{}' is not an integer: {}", key, value)))
    }

    fn rounded(&self, key: &str) -> AppResult<u32> {
        let (line, value) = self.get(key)?;
        let parsed: f64 = value
            .parse()
            .map_err(|_| self.error(line, format!("'{}' is not a number: {}", key, value)))?;
        if !parsed.is_finite() || parsed < 0.0 {
            return Err(self.error(line, format!("'{}' is out of range: {}", key, value)));
        }
        Ok(parsed.round() as u32)
    }

    fn list(&self, key: &str) -> AppResult<(usize, Vec<String>)> {
        let (line, value) = self.get(key)?;
        let inner = value
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| self.error(line, format!("'{}' is not a tuple: {}", key, value)))?;
        let items = inner
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
            .filter(|item| !item.is_empty())
            .collect();
        Ok((line, items))
    }
}

/// Parse metadata text. `path` is only used in error messages.
pub fn parse_metadata(path: &Path, text: &str) -> AppResult<RestoredSettings> {
    let file = MetadataFile::parse(path, text);

    let (channel_line, channel_names) = file.list("channels_per_slice")?;
    let (power_line, power_values) = file.list("power_per_channel")?;
    if channel_names.len() != power_values.len() {
        return Err(file.error(
            power_line,
            format!(
                "{} channels but {} powers",
                channel_names.len(),
                power_values.len()
            ),
        ));
    }
    let mut channels = Vec::with_capacity(channel_names.len());
    for (name, power) in channel_names.iter().zip(&power_values) {
        let channel: Channel = name.parse().map_err(|e: String| file.error(channel_line, e))?;
        let power: f64 = power
            .parse()
            .map_err(|_| file.error(power_line, format!("invalid power '{}'", power)))?;
        channels.push((channel, power));
    }

    let (filter_line, filter) = file.get("emission_filter")?;
    let emission_filter = filter
        .parse()
        .map_err(|e: String| file.error(filter_line, e))?;

    Ok(RestoredSettings {
        channels,
        emission_filter,
        illumination_time_us: file.integer("illumination_time_us")?,
        height_px: file.integer("height_px")?,
        width_px: file.integer("width_px")?,
        voxel_aspect_ratio: file.rounded("voxel_aspect_ratio")?,
        scan_range_um: file.rounded("scan_range_um")?,
        volumes_per_buffer: file.integer("volumes_per_buffer")?,
    })
}

/// Read and parse a metadata file.
pub fn load_metadata(path: &Path) -> AppResult<RestoredSettings> {
    let text = fs::read_to_string(path)?;
    parse_metadata(path, &text)
}
