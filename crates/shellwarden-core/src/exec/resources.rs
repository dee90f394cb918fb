//! Host resource sampling and throttle math

use std::time::Duration;

/// Weight of the previous reading in the CPU moving average
pub const EMA_PREVIOUS_WEIGHT: f64 = 0.7;

/// Longest cooldown window the throttle will start
pub const MAX_COOLDOWN: Duration = Duration::from_secs(60);

/// Aggregate CPU jiffies from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// OS-wide CPU utilization sampler
///
/// On Linux each sample is the busy share of jiffies since the previous
/// sample. Elsewhere, or when `/proc/stat` is unreadable, it falls back to
/// the one-minute load average divided by the CPU count.
#[derive(Debug, Default)]
pub struct CpuSampler {
    prev: Option<CpuTimes>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current utilization in percent, 0..=100
    pub fn sample(&mut self) -> f64 {
        let percent = match read_cpu_times() {
            Some(now) => {
                let percent = match self.prev {
                    Some(prev) => busy_percent(prev, now),
                    None => ratio(now.busy, now.total),
                };
                self.prev = Some(now);
                percent
            }
            None => load_average_percent(),
        };
        percent.clamp(0.0, 100.0)
    }
}

fn busy_percent(prev: CpuTimes, now: CpuTimes) -> f64 {
    let busy = now.busy.saturating_sub(prev.busy);
    let total = now.total.saturating_sub(prev.total);
    ratio(busy, total)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn read_cpu_times() -> Option<CpuTimes> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|contents| parse_cpu_times(&contents))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal ...
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already counted in user
    let total: u64 = fields.iter().take(8).sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn load_average_percent() -> f64 {
    #[cfg(unix)]
    {
        let mut load = [0f64; 1];
        // SAFETY: the buffer holds exactly the one sample requested
        let n = unsafe { libc::getloadavg(load.as_mut_ptr(), 1) };
        if n == 1 {
            return load[0] / num_cpus::get().max(1) as f64 * 100.0;
        }
    }
    0.0
}

/// Resident memory of this process in bytes, 0 if unknown
pub fn memory_usage_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/proc/self/status") {
            if let Some(bytes) = parse_vm_rss(&contents) {
                return bytes;
            }
        }
    }
    0
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Exponential moving average, never negative
pub fn smooth(previous: f64, sample: f64) -> f64 {
    let value = previous * EMA_PREVIOUS_WEIGHT + sample * (1.0 - EMA_PREVIOUS_WEIGHT);
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

/// Cooldown window for a smoothed CPU reading above `threshold`
///
/// One second at the threshold, doubling every 10 points over it, capped at
/// [`MAX_COOLDOWN`].
pub fn cooldown_for(cpu: f64, threshold: f64) -> Option<Duration> {
    if cpu <= threshold {
        return None;
    }
    let exponent = ((cpu - threshold) / 10.0).min(16.0);
    let secs = 2f64.powf(exponent);
    Some(Duration::from_secs_f64(secs).min(MAX_COOLDOWN))
}
