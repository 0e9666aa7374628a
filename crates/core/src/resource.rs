//! Resource model - host samples, optimization tiers and strategies.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Time;

/// Point-in-time host resource sample.
///
/// The `Default` value is the all-zero snapshot used when sampling fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Used memory in MiB
    pub memory_used_mb: f64,
    /// Used memory as a percentage of total
    pub memory_percent: f64,
    /// Global CPU utilisation percentage
    pub cpu_percent: f64,
    /// Root filesystem usage percentage
    pub disk_percent: f64,
    /// When the sample was taken (None for the zero snapshot)
    pub timestamp: Option<Time>,
}

impl ResourceSnapshot {
    /// Whether this is the zero snapshot produced by a failed sample.
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none()
    }
}

/// Memory pressure tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureTier {
    /// memory_percent < 60
    Low,
    /// 60 <= memory_percent <= 80
    Medium,
    /// memory_percent > 80
    High,
}

impl PressureTier {
    /// Tier for a memory percentage.
    pub fn for_memory_percent(memory_percent: f64) -> Self {
        if memory_percent > 80.0 {
            PressureTier::High
        } else if memory_percent > 60.0 {
            PressureTier::Medium
        } else {
            PressureTier::Low
        }
    }
}

/// Browser viewport size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Parameter bundle applied to the automation server for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Which tier produced this bundle
    pub tier: PressureTier,
    /// Chromium launch flags
    pub browser_args: Vec<String>,
    /// Browser window size
    pub viewport: Viewport,
    /// Screenshot JPEG quality (0-100)
    pub screenshot_quality: u8,
    /// Delay between steps, in seconds
    pub step_delay: f64,
    /// Per-request timeout, in seconds
    pub timeout: u64,
}

const BASE_ARGS: &[&str] = &["--no-sandbox", "--disable-dev-shm-usage", "--disable-gpu"];

const MEDIUM_ARGS: &[&str] = &[
    "--disable-web-security",
    "--single-process",
    "--memory-pressure-off",
];

const HIGH_ARGS: &[&str] = &[
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-features=VizDisplayCompositor,TranslateUI",
    "--disable-extensions",
    "--disable-plugins",
    "--disable-images",
];

impl OptimizationConfig {
    /// The discrete bundle for a memory percentage.
    pub fn for_memory_percent(memory_percent: f64) -> Self {
        Self::for_tier(PressureTier::for_memory_percent(memory_percent))
    }

    /// The bundle for a tier.
    pub fn for_tier(tier: PressureTier) -> Self {
        let mut browser_args: Vec<String> = BASE_ARGS.iter().map(|s| s.to_string()).collect();
        match tier {
            PressureTier::Low => Self {
                tier,
                browser_args,
                viewport: Viewport { width: 1280, height: 720 },
                screenshot_quality: 90,
                step_delay: 1.0,
                timeout: 30,
            },
            PressureTier::Medium => {
                browser_args.extend(MEDIUM_ARGS.iter().map(|s| s.to_string()));
                Self {
                    tier,
                    browser_args,
                    viewport: Viewport { width: 1024, height: 768 },
                    screenshot_quality: 80,
                    step_delay: 0.5,
                    timeout: 30,
                }
            }
            PressureTier::High => {
                browser_args.extend(MEDIUM_ARGS.iter().map(|s| s.to_string()));
                browser_args.extend(HIGH_ARGS.iter().map(|s| s.to_string()));
                Self {
                    tier,
                    browser_args,
                    viewport: Viewport { width: 800, height: 600 },
                    screenshot_quality: 60,
                    step_delay: 0.2,
                    timeout: 15,
                }
            }
        }
    }

    /// Screenshots are skipped under high memory pressure.
    pub fn capture_screenshots(&self) -> bool {
        self.tier != PressureTier::High
    }

    /// Inter-step delay as a Duration.
    pub fn step_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.step_delay.max(0.0))
    }
}

/// Execution strategy chosen under current resource pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Normal run with screenshots
    Full,
    /// Reduced run without screenshots
    Lightweight,
    /// No browser, synthetic result
    Simulated,
    /// Wait in the execution queue
    Queued,
    /// Refused outright
    Rejected,
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FallbackStrategy::Full => "full",
            FallbackStrategy::Lightweight => "lightweight",
            FallbackStrategy::Simulated => "simulated",
            FallbackStrategy::Queued => "queued",
            FallbackStrategy::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Liveness signal for a long-running execution.
///
/// Implemented by resource leases; the executor calls it after every
/// step so the lease is not reclaimed as stale.
pub trait Heartbeat: Send + Sync {
    /// Renew the liveness timestamp.
    fn beat(&self);
}
