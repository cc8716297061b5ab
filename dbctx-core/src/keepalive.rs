//! Periodic alive probes with reconnection of dead contexts.

use crate::config::{CoordinatorConfig, InvalidationMode, KeepAliveConfig};
use crate::coordinator::{InvalidationCoordinator, InvalidationReport};
use crate::datasource::DataSource;
use crate::models::ContextState;
use crate::monitor::ProgressMonitor;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Probes every context of a data source and asks the coordinator to
/// reconnect the ones found dead.
///
/// Probing and reconnecting are kept apart: a failed probe only marks the
/// context suspect, the reconnect is an explicit coordinated invalidation.
#[derive(Debug)]
pub struct KeepAliveMonitor {
    source: Arc<DataSource>,
    coordinator: InvalidationCoordinator,
    config: KeepAliveConfig,
}

impl KeepAliveMonitor {
    /// Creates a keep-alive monitor for `source`.
    pub fn new(source: Arc<DataSource>, config: KeepAliveConfig) -> Self {
        Self {
            source,
            coordinator: InvalidationCoordinator::new(
                CoordinatorConfig::default().with_mode(InvalidationMode::Force),
            ),
            config,
        }
    }

    /// Replaces the coordinator used for reconnects.
    pub fn with_coordinator(mut self, coordinator: InvalidationCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Runs one probe round.
    ///
    /// Returns the reconnect report when at least one context needed it and
    /// auto-reconnect is enabled.
    pub async fn tick(&self, monitor: &ProgressMonitor) -> Option<InvalidationReport> {
        let mut dead = Vec::new();
        for context in self.source.contexts() {
            match context.state() {
                ContextState::Connected => {
                    if let Err(e) = context.check_context_alive(monitor).await {
                        if monitor.is_cancelled() {
                            return None;
                        }
                        tracing::warn!(
                            "Keep-alive: context '{}' of '{}' is dead: {}",
                            context.name(),
                            self.source.name(),
                            e
                        );
                        dead.push(context);
                    }
                }
                ContextState::Disconnected | ContextState::Invalidating
                    if self.config.retry_disconnected =>
                {
                    dead.push(context);
                }
                _ => {}
            }
        }

        if dead.is_empty() {
            tracing::trace!("Keep-alive: all contexts of '{}' alive", self.source.name());
            return None;
        }

        if !self.config.auto_reconnect {
            tracing::info!(
                "Keep-alive: {} context(s) of '{}' need reconnecting; auto_reconnect is off",
                dead.len(),
                self.source.name()
            );
            return None;
        }

        Some(
            self.coordinator
                .invalidate(self.source.name(), &dead, self.source.network(), monitor)
                .await,
        )
    }

    /// Runs probe rounds every `interval` until `shutdown` is cancelled.
    ///
    /// The first round runs one interval after spawning.
    pub fn spawn(self, shutdown: ProgressMonitor) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval.max(std::time::Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Some(report) = self.tick(&shutdown).await
                            && !report.is_success()
                        {
                            tracing::warn!(
                                "Keep-alive: {} context(s) of '{}' could not be reconnected",
                                report.counters.failed,
                                self.source.name()
                            );
                        }
                    }
                }
            }
            tracing::debug!("Keep-alive for '{}' stopped", self.source.name());
        })
    }
}
