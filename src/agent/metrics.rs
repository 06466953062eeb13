//! Host metrics for `HEARTBEAT` frames.
//!
//! | Field       | Source                                  |
//! |-------------|-----------------------------------------|
//! | `cpu`       | `/proc/stat` delta between two samples  |
//! | `ram`       | `/proc/meminfo` (`MemTotal`, `MemAvailable`) |
//! | `disk`      | `statvfs("/")`                          |
//! | `uptime`    | `/proc/uptime`                          |
//! | `timestamp` | wall clock, Unix ms                     |
//!
//! Missing sources report 0 rather than failing the heartbeat.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::tunnel::frame::Metrics;

/// Keeps the previous `/proc/stat` totals so each sample reports the CPU
/// busy share since the last heartbeat rather than since boot.
#[derive(Debug, Default)]
pub struct CpuSampler {
    prev: Option<CpuTimes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a full metrics snapshot.
    pub fn sample(&mut self) -> Metrics {
        let cpu = parse_cpu_times(&read_proc_file("/proc/stat"))
            .map_or(0.0, |now| self.cpu_percent(now));
        let (total, available) = parse_meminfo(&read_proc_file("/proc/meminfo"));

        Metrics {
            cpu,
            ram: percent(total.saturating_sub(available), total),
            disk: disk_percent("/"),
            uptime: parse_uptime(&read_proc_file("/proc/uptime")),
            timestamp: now_ms(),
        }
    }

    fn cpu_percent(&mut self, now: CpuTimes) -> f64 {
        let pct = match self.prev {
            Some(prev) if now.total > prev.total => {
                let total = now.total - prev.total;
                let idle = now.idle.saturating_sub(prev.idle);
                percent(total.saturating_sub(idle), total)
            }
            // First sample: busy share since boot.
            _ => percent(now.total.saturating_sub(now.idle), now.total),
        };
        self.prev = Some(now);
        pct
    }
}

fn read_proc_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}

/// Aggregate `cpu` line: idle = idle + iowait, total = sum of all fields.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// Parse `MemTotal` and `MemAvailable` from `/proc/meminfo` content.
fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest);
        }
    }
    (total, available)
}

fn parse_kb_value(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_uptime(uptime: &str) -> u64 {
    uptime
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map_or(0, |secs| secs as u64)
}

#[allow(clippy::unnecessary_cast)]
fn disk_percent(path: &str) -> f64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let block = stat.fragment_size() as u64;
            let total = stat.blocks() as u64 * block;
            let free = stat.blocks_free() as u64 * block;
            percent(total.saturating_sub(free), total)
        }
        Err(_) => 0.0,
    }
}
