//! Host resource usage reported in heartbeat acknowledgements.
//!
//! Values are fractions in `0.0..=1.0`. On hosts without `/proc` both read as
//! zero.

/// CPU load: one-minute load average divided by available cores, capped at 1.
pub fn cpu_usage() -> f32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|raw| parse_loadavg(&raw, cores))
        .unwrap_or(0.0)
}

/// Memory usage: `(MemTotal - MemAvailable) / MemTotal`.
pub fn mem_usage() -> f32 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|raw| parse_meminfo(&raw))
        .unwrap_or(0.0)
}

fn parse_loadavg(raw: &str, cores: usize) -> Option<f32> {
    let load: f32 = raw.split_whitespace().next()?.parse().ok()?;
    Some((load / cores.max(1) as f32).clamp(0.0, 1.0))
}

fn parse_meminfo(raw: &str) -> Option<f32> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available) as f32 / total as f32).clamp(0.0, 1.0))
}
