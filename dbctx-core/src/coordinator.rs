//! Invalidation across all contexts sharing one network handler set.
//!
//! # Phase Order
//! 1. Triage: fresh contexts that pass an alive probe (and, in `IfDead`
//!    mode, any context that passes one) are left alone
//! 2. Contexts BEFORE_INVALIDATE, concurrently
//! 3. Network handlers BEFORE_INVALIDATE, then INVALIDATE
//! 4. Each context INVALIDATE followed by AFTER_INVALIDATE, concurrently
//! 5. Network handlers AFTER_INVALIDATE
//!
//! Contexts progress independently with bounded parallelism; one context's
//! failure never stops another. A network handler failure fails every
//! context still depending on it and is reported as a disable suggestion.

use crate::config::{CoordinatorConfig, InvalidationMode};
use crate::context::ExecutionContext;
use crate::error::{ContextError, ErrorKind};
use crate::models::{ContextId, ContextState, InvalidatePhase};
use crate::monitor::ProgressMonitor;
use crate::network::NetworkHandlerSet;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Final status of one context after a coordinated invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// A new link was published and defaults restored
    Reconnected { generation: u64 },
    /// The link was already fresh and answered the probe; nothing was
    /// terminated
    AlreadyValid,
    /// The alive probe passed (`IfDead` mode only)
    Alive,
    /// Invalidation failed; the context is `DISCONNECTED`
    Failed {
        phase: Option<InvalidatePhase>,
        kind: ErrorKind,
        message: String,
    },
}

impl OutcomeStatus {
    fn failed(error: &ContextError) -> Self {
        Self::Failed {
            phase: error.phase(),
            kind: error.root_kind(),
            message: error.to_string(),
        }
    }

    /// Whether the context ended up usable.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Outcome for a single context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOutcome {
    pub context_id: ContextId,
    pub context_name: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    pub duration_ms: u64,
}

/// Per-status tallies of a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub total: usize,
    pub reconnected: usize,
    pub already_valid: usize,
    pub alive: usize,
    pub failed: usize,
}

/// Structured result of a coordinated invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationReport {
    /// Unique identifier of this run
    pub run_id: Uuid,
    /// Data source the contexts belong to
    pub data_source: String,
    /// Mode the run used
    pub mode: InvalidationMode,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the whole run
    pub total_duration_ms: u64,
    /// One entry per input context, in input order
    pub outcomes: Vec<ContextOutcome>,
    /// Tallies over `outcomes`
    pub counters: OutcomeCounters,
    /// Network handler whose failure broke the run; disabling it is the
    /// suggested remediation
    pub disable_handler_suggestion: Option<String>,
    /// Non-fatal problems (handler fix-up failures after reconnect)
    pub warnings: Vec<String>,
}

impl InvalidationReport {
    /// Whether every context ended up usable.
    pub fn is_success(&self) -> bool {
        self.counters.failed == 0
    }

    /// Outcomes of failed contexts.
    pub fn failures(&self) -> impl Iterator<Item = &ContextOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_success())
    }

    /// Looks up the outcome of a context.
    pub fn outcome(&self, id: ContextId) -> Option<&ContextOutcome> {
        self.outcomes.iter().find(|o| o.context_id == id)
    }
}

struct Slot {
    context: Arc<ExecutionContext>,
    started: Instant,
    status: Option<OutcomeStatus>,
}

impl Slot {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Drives the three-phase invalidation over a set of contexts.
#[derive(Debug, Clone, Default)]
pub struct InvalidationCoordinator {
    config: CoordinatorConfig,
}

impl InvalidationCoordinator {
    /// Creates a coordinator.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    /// Coordinator settings.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Invalidates `contexts`, which share `network`.
    ///
    /// Never fails as a whole; every context gets its own outcome.
    pub async fn invalidate(
        &self,
        data_source: &str,
        contexts: &[Arc<ExecutionContext>],
        network: &NetworkHandlerSet,
        monitor: &ProgressMonitor,
    ) -> InvalidationReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let concurrency = self.config.max_concurrency.max(1);

        tracing::info!(
            "Invalidation {} of '{}': {} context(s), mode {:?}",
            run_id,
            data_source,
            contexts.len(),
            self.config.mode
        );

        let mut slots: Vec<Slot> = contexts
            .iter()
            .map(|context| Slot {
                context: Arc::clone(context),
                started: Instant::now(),
                status: None,
            })
            .collect();

        // Triage
        let mode = self.config.mode;
        let candidates: Vec<(usize, Arc<ExecutionContext>)> = slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, Arc::clone(&slot.context)))
            .collect();
        let triage: Vec<(usize, Option<OutcomeStatus>)> = stream::iter(candidates)
            .map(|(index, context)| {
                let monitor = monitor.clone();
                async move { (index, triage(&context, mode, &monitor).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for (index, status) in triage {
            slots[index].status = status;
        }

        let mut disable_handler_suggestion = None;
        let mut warnings = Vec::new();

        if pending(&slots).next().is_some() {
            // Contexts BEFORE_INVALIDATE
            let results = self
                .run_phase(&slots, InvalidatePhase::BeforeInvalidate, monitor)
                .await;
            for (index, result) in results {
                if let Err(e) = result {
                    slots[index].status = Some(OutcomeStatus::failed(&e));
                }
            }

            // Network handlers BEFORE_INVALIDATE, INVALIDATE
            for phase in [InvalidatePhase::BeforeInvalidate, InvalidatePhase::Invalidate] {
                if pending(&slots).next().is_none() {
                    break;
                }
                if let Err((handler, error)) = network.invalidate_all(phase, monitor).await {
                    let error = ContextError::invalidate(phase, error);
                    for index in pending(&slots).collect::<Vec<_>>() {
                        slots[index].context.abort_invalidation().await;
                        slots[index].status = Some(OutcomeStatus::failed(&error));
                    }
                    disable_handler_suggestion = Some(handler);
                    break;
                }
            }

            // Contexts INVALIDATE + AFTER_INVALIDATE
            let indices: Vec<usize> = pending(&slots).collect();
            if !indices.is_empty() {
                let results: Vec<(usize, OutcomeStatus)> = stream::iter(indices)
                    .map(|index| {
                        let context = Arc::clone(&slots[index].context);
                        let monitor = monitor.clone();
                        async move { (index, reconnect(&context, &monitor).await) }
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;
                for (index, status) in results {
                    slots[index].status = Some(status);
                }

                // Network handlers AFTER_INVALIDATE
                if let Err((handler, error)) = network
                    .invalidate_all(InvalidatePhase::AfterInvalidate, monitor)
                    .await
                {
                    warnings.push(format!(
                        "Network handler '{}' failed {}: {}",
                        handler,
                        InvalidatePhase::AfterInvalidate,
                        error
                    ));
                }
            }
        }

        let outcomes: Vec<ContextOutcome> = slots
            .iter()
            .map(|slot| ContextOutcome {
                context_id: slot.context.id(),
                context_name: slot.context.name().to_string(),
                status: slot.status.clone().unwrap_or(OutcomeStatus::AlreadyValid),
                duration_ms: slot.elapsed_ms(),
            })
            .collect();
        let counters = count(&outcomes);

        let total_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if counters.failed > 0 {
            tracing::warn!(
                "Invalidation {} of '{}': {} of {} context(s) failed",
                run_id,
                data_source,
                counters.failed,
                counters.total
            );
        } else {
            tracing::info!(
                "Invalidation {} of '{}' completed in {}ms ({} reconnected)",
                run_id,
                data_source,
                total_duration_ms,
                counters.reconnected
            );
        }

        InvalidationReport {
            run_id,
            data_source: data_source.to_string(),
            mode,
            started_at,
            total_duration_ms,
            outcomes,
            counters,
            disable_handler_suggestion,
            warnings,
        }
    }

    async fn run_phase(
        &self,
        slots: &[Slot],
        phase: InvalidatePhase,
        monitor: &ProgressMonitor,
    ) -> Vec<(usize, crate::Result<crate::models::PhaseOutcome>)> {
        stream::iter(pending(slots).collect::<Vec<_>>())
            .map(|index| {
                let context = Arc::clone(&slots[index].context);
                let monitor = monitor.clone();
                async move { (index, context.invalidate_context(phase, &monitor).await) }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await
    }
}

/// Indices of contexts that still need work.
fn pending(slots: &[Slot]) -> impl Iterator<Item = usize> + '_ {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.status.is_none())
        .map(|(index, _)| index)
}

/// Decides whether a context needs invalidating; `Some` settles its outcome.
async fn triage(
    context: &ExecutionContext,
    mode: InvalidationMode,
    monitor: &ProgressMonitor,
) -> Option<OutcomeStatus> {
    match context.state() {
        ContextState::Closed => {
            return Some(OutcomeStatus::failed(&ContextError::closed(context.name())));
        }
        ContextState::Connected if context.is_fresh() || mode == InvalidationMode::IfDead => {
            let fresh = context.is_fresh();
            match context.check_context_alive(monitor).await {
                Ok(()) if fresh => return Some(OutcomeStatus::AlreadyValid),
                Ok(()) => return Some(OutcomeStatus::Alive),
                Err(e @ ContextError::Cancelled { .. }) => {
                    return Some(OutcomeStatus::failed(&e));
                }
                Err(e) => {
                    tracing::debug!("Context '{}' is dead: {}", context.name(), e);
                }
            }
        }
        _ => {}
    }
    None
}

async fn reconnect(context: &ExecutionContext, monitor: &ProgressMonitor) -> OutcomeStatus {
    for phase in [InvalidatePhase::Invalidate, InvalidatePhase::AfterInvalidate] {
        if let Err(e) = context.invalidate_context(phase, monitor).await {
            return OutcomeStatus::failed(&e);
        }
    }
    OutcomeStatus::Reconnected {
        generation: context.generation(),
    }
}

fn count(outcomes: &[ContextOutcome]) -> OutcomeCounters {
    let mut counters = OutcomeCounters {
        total: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.status {
            OutcomeStatus::Reconnected { .. } => counters.reconnected += 1,
            OutcomeStatus::AlreadyValid => counters.already_valid += 1,
            OutcomeStatus::Alive => counters.alive += 1,
            OutcomeStatus::Failed { .. } => counters.failed += 1,
        }
    }
    counters
}
