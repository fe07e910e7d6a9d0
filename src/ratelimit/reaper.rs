//! Background removal of idle buckets and boxes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::clock::Clock;
use super::limiter::RateLimiter;
use super::registry::{BucketRegistry, SweepStats};
use crate::error::{Result, UrsaError};

/// Timing of the idle reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// A bucket untouched for this long is removed.
    pub bucket_ttl: Duration,
    /// An empty box untouched for this long is removed.
    pub box_ttl: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            bucket_ttl: Duration::from_secs(600),
            box_ttl: Duration::from_secs(600),
        }
    }
}

impl ReaperSettings {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(UrsaError::config("reaper sweep interval must be greater than zero"));
        }
        if self.bucket_ttl.is_zero() || self.box_ttl.is_zero() {
            return Err(UrsaError::config("reaper TTLs must be greater than zero"));
        }
        Ok(())
    }
}

/// Sweeps a registry on a fixed schedule, outside the request path.
#[derive(Debug)]
pub struct Reaper {
    registry: Arc<BucketRegistry>,
    clock: Arc<dyn Clock>,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(
        registry: Arc<BucketRegistry>,
        clock: Arc<dyn Clock>,
        settings: ReaperSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            registry,
            clock,
            settings,
        })
    }

    /// Reaper for the registry and clock of `limiter`.
    pub fn for_limiter(limiter: &RateLimiter, settings: ReaperSettings) -> Result<Self> {
        Self::new(
            Arc::clone(limiter.registry()),
            Arc::clone(limiter.clock()),
            settings,
        )
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// Run one pass.
    pub fn sweep(&self) -> SweepStats {
        let stats = self.registry.sweep(
            self.clock.now(),
            self.settings.bucket_ttl,
            self.settings.box_ttl,
        );
        if stats.buckets_removed > 0 || stats.boxes_removed > 0 {
            info!(
                buckets_removed = stats.buckets_removed,
                boxes_removed = stats.boxes_removed,
                boxes_remaining = self.registry.box_count(),
                "Reaped idle rate limit state"
            );
        } else {
            debug!("Reaper sweep found nothing idle");
        }
        stats
    }

    /// Sweep every `sweep_interval` until `shutdown` turns true or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            info!(
                sweep_interval = ?self.settings.sweep_interval,
                bucket_ttl = ?self.settings.bucket_ttl,
                box_ttl = ?self.settings.box_ttl,
                "Idle reaper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Idle reaper stopped");
        })
    }
}
