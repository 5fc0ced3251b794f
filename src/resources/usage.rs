//! Resource usage samples and parsing of the runtime's raw metrics line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// One point-in-time measurement of a container. Only the latest one is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub process_count: u64,
    pub network_in: u64,
    pub network_out: u64,
    pub execution_time: Duration,
}

impl ResourceUsage {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_used: 0,
            memory_limit: 0,
            memory_percent: 0.0,
            process_count: 0,
            network_in: 0,
            network_out: 0,
            execution_time: Duration::ZERO,
        }
    }
}

const KIB: f64 = 1024.0;

/// Converts sizes such as `"1.5GiB"` or `"512kB"` to bytes.
///
/// Empty or unrecognised input yields 0 so that one malformed field cannot spoil a
/// whole sample.
pub fn parse_memory_size(raw: &str) -> u64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0;
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);

    let value: f64 = match number.parse() {
        Ok(value) => value,
        Err(_) => return 0,
    };

    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => KIB,
        "MiB" => KIB.powi(2),
        "GiB" => KIB.powi(3),
        "TiB" => KIB.powi(4),
        // docker prints network and block I/O in decimal units
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return 0,
    };

    (value * multiplier).round() as u64
}

/// Inverse of [`parse_memory_size`], using binary units.
pub fn format_memory_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= KIB && unit < UNITS.len() - 1 {
        value /= KIB;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

fn parse_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().parse().ok()
}

fn parse_pair(raw: &str) -> (u64, u64) {
    let mut parts = raw.split('/');
    let first = parts.next().map(parse_memory_size).unwrap_or(0);
    let second = parts.next().map(parse_memory_size).unwrap_or(0);
    (first, second)
}

/// Parses `CPU%|USED / LIMIT|MEM%|IN / OUT|PIDS` into a sample.
///
/// Sizes degrade to 0 when malformed; a line without five fields or with an
/// unreadable CPU percentage is rejected because nothing useful can be classified.
pub fn parse_usage_line(
    container_id: &str,
    line: &str,
    execution_time: Duration,
) -> Result<ResourceUsage> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() != 5 {
        return Err(SandboxError::runtime(
            "stats",
            container_id,
            format!("expected 5 fields in usage line, got {}: {line:?}", fields.len()),
        ));
    }

    let cpu_percent = parse_percent(fields[0]).ok_or_else(|| {
        SandboxError::runtime(
            "stats",
            container_id,
            format!("unreadable CPU value {:?}", fields[0]),
        )
    })?;
    let (memory_used, memory_limit) = parse_pair(fields[1]);
    let memory_percent = parse_percent(fields[2]).unwrap_or_else(|| {
        if memory_limit > 0 {
            memory_used as f64 / memory_limit as f64 * 100.0
        } else {
            0.0
        }
    });
    let (network_in, network_out) = parse_pair(fields[3]);
    let process_count = fields[4].trim().parse().unwrap_or(0);

    Ok(ResourceUsage {
        container_id: container_id.to_string(),
        timestamp: Utc::now(),
        cpu_percent,
        memory_used,
        memory_limit,
        memory_percent,
        process_count,
        network_in,
        network_out,
        execution_time,
    })
}
