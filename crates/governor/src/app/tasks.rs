use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::Governor;
use crate::config::GovernorConfig;
use crate::infrastructure::metrics;
use crate::infrastructure::system_sampler::SystemSampler;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Token shared with everything that must stop on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, governor: &Arc<Governor>, cfg: &GovernorConfig) {
        if cfg.monitor.enabled {
            let sampler_task = self.spawn_sampler_task(governor, cfg.monitor.interval());
            self.tasks.push(sampler_task);
        }

        if cfg.metrics.enabled {
            let metrics_task =
                self.spawn_metrics_task(governor, &cfg.metrics.format, cfg.metrics.interval());
            self.tasks.push(metrics_task);
        }
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        if self.tasks.is_empty() {
            let _ = signal_handler.await;
            tracing::info!("Shutdown signal received");
            self.cancellation_token.cancel();
            return Ok(());
        }

        tokio::select! {
            // Wait for shutdown signal
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.shutdown(Duration::from_secs(30)).await;
            }
            // Wait for any task to complete unexpectedly
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    /// Cancel every task and wait for them up to `timeout`.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(timeout).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_sampler_task(&self, governor: &Arc<Governor>, interval: Duration) -> JoinHandle<()> {
        let sampler = SystemSampler::new(governor.clone());
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting system sampler task");
            sampler.run(interval, token).await;
            tracing::info!("System sampler task completed");
        })
    }

    fn spawn_metrics_task(
        &self,
        governor: &Arc<Governor>,
        metrics_format: &str,
        interval: Duration,
    ) -> JoinHandle<()> {
        let governor = governor.clone();
        let metrics_format = metrics_format.to_string();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting metrics collection task");
            metrics::run_metrics(governor, &metrics_format, interval, token).await;
            tracing::info!("Metrics collection task completed");
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn spawns_enabled_tasks_and_shuts_down() {
        let mut cfg = GovernorConfig::default();
        cfg.monitor.interval_secs = 1;
        cfg.metrics.interval_secs = 1;
        let governor = Arc::new(Governor::new(&cfg).expect("governor"));

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(&governor, &cfg);
        assert_eq!(tasks.tasks.len(), 2);

        tasks.shutdown(Duration::from_secs(5)).await;
        assert!(tasks.cancellation_token().is_cancelled());
        assert!(tasks.tasks.iter().all(|t| t.is_finished()));
    }

    #[tokio::test]
    async fn disabled_tasks_are_not_spawned() {
        let mut cfg = GovernorConfig::default();
        cfg.monitor.enabled = false;
        cfg.metrics.enabled = false;
        let governor = Arc::new(Governor::new(&cfg).expect("governor"));

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(&governor, &cfg);
        assert!(tasks.tasks.is_empty());
    }
}
