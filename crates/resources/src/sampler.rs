//! Host resource sampling.

use chrono::Utc;
use parking_lot::Mutex;
use probekit_core::ResourceSnapshot;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

const MIB: f64 = 1024.0 * 1024.0;

/// Errors that can occur while sampling the host.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The platform reported no memory information
    #[error("host reported zero total memory")]
    NoMemoryInfo,

    /// Sampling is unavailable
    #[error("{0}")]
    Unavailable(String),
}

/// Source of resource snapshots.
pub trait ResourceSampler: Send + Sync {
    /// Take one sample.
    fn sample(&self) -> Result<ResourceSnapshot, SampleError>;
}

/// Samples the local host through `sysinfo`.
///
/// CPU usage is measured between consecutive calls, so the first sample
/// after construction reports the usage since `new`.
pub struct SystemSampler {
    system: Mutex<System>,
    disk_mount: PathBuf,
}

impl SystemSampler {
    /// Create a sampler watching the root filesystem.
    pub fn new() -> Self {
        Self::with_disk_mount("/")
    }

    /// Create a sampler watching the filesystem that holds `mount`.
    pub fn with_disk_mount(mount: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            disk_mount: mount.into(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceSnapshot, SampleError> {
        let (used, total, cpu_percent) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.refresh_cpu();
            (
                system.used_memory(),
                system.total_memory(),
                system.global_cpu_info().cpu_usage() as f64,
            )
        };

        if total == 0 {
            return Err(SampleError::NoMemoryInfo);
        }

        Ok(ResourceSnapshot {
            memory_used_mb: used as f64 / MIB,
            memory_percent: used as f64 / total as f64 * 100.0,
            cpu_percent,
            disk_percent: disk_usage_percent(&self.disk_mount),
            timestamp: Some(Utc::now()),
        })
    }
}

/// Usage of the most specific mounted filesystem containing `path`.
fn disk_usage_percent(path: &Path) -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            let total = disk.total_space();
            if total == 0 {
                0.0
            } else {
                total.saturating_sub(disk.available_space()) as f64 / total as f64 * 100.0
            }
        })
        .unwrap_or(0.0)
}

/// Sampler returning a settable snapshot.
///
/// Used for deterministic operation (simulation runs, tests).
#[derive(Default)]
pub struct FixedSampler {
    snapshot: Mutex<Option<ResourceSnapshot>>,
}

impl FixedSampler {
    /// Sampler reporting the given usage.
    pub fn new(memory_used_mb: f64, memory_percent: f64, cpu_percent: f64) -> Self {
        let sampler = Self::default();
        sampler.set(memory_used_mb, memory_percent, cpu_percent);
        sampler
    }

    /// Sampler with an idle host.
    pub fn idle() -> Self {
        Self::new(100.0, 20.0, 5.0)
    }

    /// Replace the reported usage.
    pub fn set(&self, memory_used_mb: f64, memory_percent: f64, cpu_percent: f64) {
        *self.snapshot.lock() = Some(ResourceSnapshot {
            memory_used_mb,
            memory_percent,
            cpu_percent,
            disk_percent: 50.0,
            timestamp: Some(Utc::now()),
        });
    }

    /// Make subsequent samples fail.
    pub fn fail(&self) {
        *self.snapshot.lock() = None;
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> Result<ResourceSnapshot, SampleError> {
        self.snapshot
            .lock()
            .clone()
            .map(|mut snap| {
                snap.timestamp = Some(Utc::now());
                snap
            })
            .ok_or_else(|| SampleError::Unavailable("no sample configured".to_string()))
    }
}
