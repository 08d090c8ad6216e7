//! Periodic health sweep over the connection pool

use crate::connector::Connector;
use crate::pool::ConnectionPool;
use discovery_core::PoolConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Health sweep configuration
#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    /// Interval between sweeps
    pub check_interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
        }
    }
}

impl From<&PoolConfig> for HealthCheckConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            check_interval: config.sweep_interval(),
        }
    }
}

/// Background task rebuilding unhealthy pool entries
pub struct HealthSweep {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthSweep {
    /// Start sweeping `pool`. The first sweep runs one interval from now.
    pub fn start<C: Connector>(
        pool: Arc<ConnectionPool<C>>,
        config: HealthCheckConfig,
        cancel: CancellationToken,
    ) -> Self {
        info!(interval = ?config.check_interval, "Health sweep started");
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let period = config.check_interval;
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let rebuilt = pool.sweep().await;
                        debug!(rebuilt, "Health sweep finished");
                    }
                }
            }
            debug!("Health sweep stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop sweeping and wait for an in-flight sweep to finish
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HealthSweep {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
