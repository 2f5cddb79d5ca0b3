//! Host metrics
//!
//! Sampling sysinfo is not free, so one sample is cached and served for a
//! short TTL. The dashboard polls this endpoint aggressively; without the
//! cache every poll would pay the refresh cost.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Disks, System};

/// How long one sample stays fresh
const CACHE_TTL: Duration = Duration::from_secs(2);

/// One host metrics sample
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub hostname: Option<String>,
    pub cpu_percent: f32,
    pub load_average: [f64; 3],
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub uptime_seconds: u64,
    pub disks: Vec<DiskUsage>,
}

/// Usage of one mounted filesystem
#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

struct Inner {
    system: System,
    cached: Option<(Instant, Metrics)>,
}

/// Samples host CPU, memory, and disks through a TTL cache
pub struct MetricsService {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl MetricsService {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                system: System::new(),
                cached: None,
            }),
            ttl,
        }
    }

    /// Current metrics, at most `ttl` stale
    pub fn sample(&self) -> Metrics {
        let mut inner = self.inner.lock().unwrap();
        if let Some((taken_at, metrics)) = &inner.cached {
            if taken_at.elapsed() < self.ttl {
                return metrics.clone();
            }
        }

        inner.system.refresh_cpu_usage();
        inner.system.refresh_memory();
        let load = System::load_average();
        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| DiskUsage {
                mount_point: disk.mount_point().to_string_lossy().into_owned(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect();

        let metrics = Metrics {
            hostname: System::host_name(),
            cpu_percent: inner.system.global_cpu_usage(),
            load_average: [load.one, load.five, load.fifteen],
            memory_used_bytes: inner.system.used_memory(),
            memory_total_bytes: inner.system.total_memory(),
            uptime_seconds: System::uptime(),
            disks,
        };
        inner.cached = Some((Instant::now(), metrics.clone()));
        metrics
    }
}

impl Default for MetricsService {
    fn default() -> Self {
        Self::new()
    }
}
