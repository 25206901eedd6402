//! Cover-traffic scheduler.
//!
//! When enabled, `poll_chat` emits one zero-payload padded heartbeat at most
//! once per interval so observed send rates decouple from user activity.
//! The interval is fixed; no jitter. "Auto" turns cover traffic off on
//! low-end hardware (≤ 4 hardware threads or ≤ 4 GiB RAM).

use std::time::{Duration, Instant};

use crate::config::CoverTrafficMode;

const LOW_END_THREADS: usize = 4;
const LOW_END_RAM_BYTES: u64 = 4 * 1024 * 1024 * 1024;

pub struct CoverTraffic {
    enabled: bool,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl CoverTraffic {
    pub fn new(mode: CoverTrafficMode, interval_secs: u64) -> Self {
        let enabled = match mode {
            CoverTrafficMode::Off => false,
            CoverTrafficMode::On => true,
            CoverTrafficMode::Auto => !is_low_end(available_threads(), detected_ram_bytes()),
        };
        Self {
            enabled,
            interval: Duration::from_secs(interval_secs.max(1)),
            last_emit: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True when a heartbeat should go out now; marks the emission.
    pub fn due(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

fn is_low_end(threads: usize, ram_bytes: Option<u64>) -> bool {
    if threads <= LOW_END_THREADS {
        return true;
    }
    matches!(ram_bytes, Some(ram) if ram <= LOW_END_RAM_BYTES)
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn detected_ram_bytes() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kib * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn detected_ram_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_never_fires() {
        let mut cover = CoverTraffic::new(CoverTrafficMode::Off, 1);
        assert!(!cover.due(Instant::now()));
    }

    #[test]
    fn interval_gates_emission() {
        let mut cover = CoverTraffic::new(CoverTrafficMode::On, 30);
        let t0 = Instant::now();
        assert!(cover.due(t0));
        assert!(!cover.due(t0 + Duration::from_secs(1)));
        assert!(cover.due(t0 + Duration::from_secs(31)));
    }

    #[test]
    fn low_end_detection() {
        assert!(is_low_end(4, None));
        assert!(is_low_end(8, Some(2 * 1024 * 1024 * 1024)));
        assert!(!is_low_end(8, Some(16 * 1024 * 1024 * 1024)));
        assert!(!is_low_end(8, None));
    }
}
