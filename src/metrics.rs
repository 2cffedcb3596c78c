//! Host metrics for the edge `metrics` message.
//!
//! ## Data sources
//!
//! | Field            | Source                                              |
//! |------------------|-----------------------------------------------------|
//! | `cpuUsage`       | `/proc/stat` delta between two samples              |
//! | `cpuCores`       | `std::thread::available_parallelism`                |
//! | `memory*`        | `/proc/meminfo` (`MemTotal`, `MemAvailable`)        |
//! | `disk*`          | `statvfs` on `/var/lib/docker`, else `/`            |
//! | `network*Bytes`  | `/proc/net/dev`, summed over all interfaces but `lo` |

use std::path::{Path, PathBuf};

use crate::protocol::HostMetrics;

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Samples host counters. CPU usage is computed against the previous sample,
/// so the first call reports the average since boot.
#[derive(Debug)]
pub struct MetricsCollector {
    last_cpu: Option<CpuTimes>,
    disk_path: PathBuf,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        let docker_root = Path::new("/var/lib/docker");
        let disk_path = if docker_root.exists() {
            docker_root.to_path_buf()
        } else {
            PathBuf::from("/")
        };
        Self {
            last_cpu: None,
            disk_path,
        }
    }

    pub fn sample(&mut self) -> HostMetrics {
        let mut metrics = HostMetrics::default();

        if let Some(current) = parse_cpu_times(&read_proc_file("/proc/stat")) {
            let previous = self.last_cpu.unwrap_or_default();
            metrics.cpu_usage = cpu_usage(previous, current);
            self.last_cpu = Some(current);
        }
        metrics.cpu_cores = std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(1);

        let (total, available) = parse_meminfo(&read_proc_file("/proc/meminfo"));
        metrics.memory_total = total;
        metrics.memory_free = available;
        metrics.memory_used = total.saturating_sub(available);

        if let Some((total, used, free)) = disk_usage(&self.disk_path) {
            metrics.disk_total = total;
            metrics.disk_used = used;
            metrics.disk_free = free;
        }

        let (rx, tx) = parse_net_dev(&read_proc_file("/proc/net/dev"));
        metrics.network_rx_bytes = rx;
        metrics.network_tx_bytes = tx;

        metrics
    }
}

fn read_proc_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Parse the aggregate `cpu` line. Idle includes iowait; guest time is
/// already counted in user time and is left out of the total.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
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

#[allow(clippy::cast_precision_loss)]
fn cpu_usage(previous: CpuTimes, current: CpuTimes) -> f64 {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let idle = current.idle.saturating_sub(previous.idle).min(total);
    let busy = (total - idle) as f64 / total as f64 * 100.0;
    busy.clamp(0.0, 100.0)
}

/// `MemTotal` and `MemAvailable` from `/proc/meminfo`, in bytes.
fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest) * 1024;
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest) * 1024;
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

/// Received and transmitted byte totals from `/proc/net/dev`, excluding loopback.
fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in net_dev.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() >= 9 {
            rx += fields[0];
            tx += fields[8];
        }
    }
    (rx, tx)
}

/// `(total, used, free)` bytes for the filesystem holding `path`.
fn disk_usage(path: &Path) -> Option<(u64, u64, u64)> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is a valid NUL-terminated string and stat points to
    // writable memory of the right size.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }

    // SAFETY: statvfs returned 0, so stat is initialized.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let block_size = stat.f_frsize as u64;
    #[allow(clippy::unnecessary_cast)]
    let total = stat.f_blocks as u64 * block_size;
    #[allow(clippy::unnecessary_cast)]
    let free = stat.f_bavail as u64 * block_size;
    #[allow(clippy::unnecessary_cast)]
    let used = total.saturating_sub(stat.f_bfree as u64 * block_size);
    Some((total, used, free))
}
