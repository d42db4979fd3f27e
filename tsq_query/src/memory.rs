//! Guard against queries that would exhaust memory.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use tracing::warn;

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum MemoryError {
    #[error("memory use at {used_percent:.1}% exceeds the limit of {max_percent}%")]
    MemoryUsage { used_percent: f64, max_percent: u8 },

    #[error("query read {count} samples, more than the limit of {limit}")]
    SampleLimit { count: usize, limit: usize },
}

/// Source of the current memory usage.
pub trait MemoryProbe: Send + Sync + Debug {
    /// Used memory as a percentage of total memory.
    fn used_percent(&self) -> f64;
}

/// Reads memory usage of the host.
#[derive(Debug)]
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 * 100.0 / total as f64
    }
}

/// Limits shared by every query of an engine.
#[derive(Debug, Clone)]
pub struct MemoryLimits {
    /// Samples read between two memory probes.
    pub check_interval: NonZeroUsize,
    pub max_used_percent: u8,
    pub max_samples: Option<NonZeroUsize>,
    pub probe: Arc<dyn MemoryProbe>,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            check_interval: NonZeroUsize::new(100_000).unwrap_or(NonZeroUsize::MIN),
            max_used_percent: 95,
            max_samples: None,
            probe: Arc::new(SystemMemoryProbe::new()),
        }
    }
}

impl MemoryLimits {
    /// A fresh monitor for one query.
    pub fn monitor(&self) -> MemoryMonitor {
        MemoryMonitor {
            limits: self.clone(),
            count: 0,
            since_check: 0,
        }
    }
}

/// Counts the samples a query reads and periodically checks memory usage.
#[derive(Debug)]
pub struct MemoryMonitor {
    limits: MemoryLimits,
    count: usize,
    since_check: usize,
}

impl MemoryMonitor {
    /// Record `samples` more samples.
    pub fn check(&mut self, samples: usize) -> Result<(), MemoryError> {
        self.count += samples;
        if let Some(limit) = self.limits.max_samples {
            if self.count > limit.get() {
                return Err(MemoryError::SampleLimit {
                    count: self.count,
                    limit: limit.get(),
                });
            }
        }

        self.since_check += samples;
        if self.since_check < self.limits.check_interval.get() {
            return Ok(());
        }
        self.since_check = 0;

        let used_percent = self.limits.probe.used_percent();
        if used_percent > f64::from(self.limits.max_used_percent) {
            warn!(
                used_percent,
                max_percent = self.limits.max_used_percent,
                samples = self.count,
                "aborting query, memory limit reached"
            );
            return Err(MemoryError::MemoryUsage {
                used_percent,
                max_percent: self.limits.max_used_percent,
            });
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FixedProbe {
        percent: f64,
        probes: AtomicUsize,
    }

    impl MemoryProbe for FixedProbe {
        fn used_percent(&self) -> f64 {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.percent
        }
    }

    fn limits(percent: f64, max_samples: Option<usize>) -> (MemoryLimits, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe {
            percent,
            probes: AtomicUsize::new(0),
        });
        let limits = MemoryLimits {
            check_interval: NonZeroUsize::new(10).unwrap(),
            max_used_percent: 90,
            max_samples: max_samples.and_then(NonZeroUsize::new),
            probe: Arc::clone(&probe) as Arc<dyn MemoryProbe>,
        };
        (limits, probe)
    }

    #[test]
    fn probes_once_per_interval() {
        let (limits, probe) = limits(50.0, None);
        let mut monitor = limits.monitor();
        for _ in 0..25 {
            monitor.check(1).unwrap();
        }
        assert_eq!(probe.probes.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.count(), 25);
    }

    #[test]
    fn high_memory_use_is_exhaustion() {
        let (limits, _) = limits(97.5, None);
        let mut monitor = limits.monitor();
        monitor.check(9).unwrap();
        assert!(matches!(
            monitor.check(1),
            Err(MemoryError::MemoryUsage { max_percent: 90, .. })
        ));
    }

    #[test]
    fn sample_limit() {
        let (limits, probe) = limits(0.0, Some(5));
        let mut monitor = limits.monitor();
        monitor.check(5).unwrap();
        assert!(matches!(
            monitor.check(1),
            Err(MemoryError::SampleLimit { count: 6, limit: 5 })
        ));
        assert_eq!(probe.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn system_probe_reports_a_percentage() {
        let percent = SystemMemoryProbe::new().used_percent();
        assert!((0.0..=100.0).contains(&percent));
    }
}
