//! Periodic drain of the per-class queues.
//!
//! Each class runs its own timer loop. A tick reads at most one batch and
//! hands it to the output manager on a tracked task, so a slow or failing
//! downstream never delays the next tick or the other class. The batch is
//! acknowledged to its queue once delivery has finished, whatever the
//! outcome.

use super::config::BufferConfig;
use crate::buffer::{Batch, DrainedBatch, DurableQueue, QueueError, QueueSet, ReadTicket};
use crate::domain::TelemetryClass;
use crate::reliability::PipelineMetrics;
use crate::sender::{OutputManager, ProcessOutcome};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub drain_interval: Duration,
    pub max_in_flight: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            drain_interval: Duration::from_millis(1000),
            max_in_flight: 4,
        }
    }
}

impl From<&BufferConfig> for SchedulerConfig {
    fn from(buffer: &BufferConfig) -> Self {
        Self {
            batch_size: buffer.batch_size,
            drain_interval: buffer.drain_interval,
            max_in_flight: buffer.max_in_flight_batches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Result of a single drain tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing past the tailer.
    Idle,
    /// Every delivery slot of the class is taken.
    Saturated,
    /// No output would take the batch, so nothing was read.
    NoOutput,
    Dispatched { batch_id: String, records: usize },
}

struct Lane {
    queue: Arc<DurableQueue>,
    permits: Arc<Semaphore>,
}

struct Shared {
    trace_lane: Lane,
    metric_lane: Lane,
    outputs: Arc<OutputManager>,
    metrics: PipelineMetrics,
    config: SchedulerConfig,
    deliveries: TaskTracker,
}

impl Shared {
    fn lane(&self, class: TelemetryClass) -> &Lane {
        match class {
            TelemetryClass::Trace => &self.trace_lane,
            TelemetryClass::Metric => &self.metric_lane,
        }
    }

    async fn drain_once(&self, class: TelemetryClass) -> Result<TickOutcome, QueueError> {
        let lane = self.lane(class);
        if !lane.queue.has_available() {
            return Ok(TickOutcome::Idle);
        }
        if !self.outputs.has_active() {
            return Ok(TickOutcome::NoOutput);
        }
        let Ok(permit) = lane.permits.clone().try_acquire_owned() else {
            return Ok(TickOutcome::Saturated);
        };

        let Some(DrainedBatch { batch, ticket }) =
            lane.queue.read_batch(self.config.batch_size).await?
        else {
            return Ok(TickOutcome::Idle);
        };
        self.metrics.record_drained(class);

        let batch_id = batch.id().to_string();
        let records = batch.size();
        self.deliveries.spawn(deliver(
            self.outputs.clone(),
            lane.queue.clone(),
            batch,
            ticket,
            permit,
        ));

        Ok(TickOutcome::Dispatched { batch_id, records })
    }
}

/// Forward one batch and acknowledge it. The permit is held until the
/// acknowledgement is written.
async fn deliver(
    outputs: Arc<OutputManager>,
    queue: Arc<DurableQueue>,
    batch: Batch,
    ticket: ReadTicket,
    _permit: OwnedSemaphorePermit,
) {
    let class = batch.class();
    let batch_id = batch.id().to_string();
    let records = batch.size();

    // Run the outputs on their own task so a panic inside a processor still
    // lets the batch be acknowledged.
    let forward = tokio::spawn(async move { outputs.process(&batch).await });
    match forward.await {
        Ok(outcomes) => {
            if outcomes.is_empty()
                || outcomes
                    .iter()
                    .all(|(_, outcome)| matches!(outcome, ProcessOutcome::NotReady))
            {
                warn!(
                    class = %class,
                    batch_id = %batch_id,
                    records,
                    "Batch consumed without a ready output"
                );
            }
            for (output, outcome) in &outcomes {
                debug!(class = %class, batch_id = %batch_id, output = %output, outcome = ?outcome, "Output finished");
            }
        }
        Err(e) => {
            error!(class = %class, batch_id = %batch_id, records, error = %e, "Delivery task failed");
        }
    }

    match queue.acknowledge(ticket).await {
        Ok(Some(cursor)) => debug!(class = %class, batch_id = %batch_id, cursor = %cursor, "Batch acknowledged"),
        Ok(None) => debug!(class = %class, batch_id = %batch_id, "Batch acknowledged, waiting on earlier batches"),
        Err(e) if e.is_closed() => warn!(
            class = %class,
            batch_id = %batch_id,
            "Queue closed before acknowledgement, batch will be replayed"
        ),
        Err(e) => error!(class = %class, batch_id = %batch_id, error = %e, "Failed to persist cursor"),
    }
}

async fn run_lane(shared: Arc<Shared>, class: TelemetryClass, token: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        class = %class,
        batch_size = shared.config.batch_size,
        interval_ms = shared.config.drain_interval.as_millis() as u64,
        "Drain loop started"
    );

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                match shared.drain_once(class).await {
                    Ok(TickOutcome::Dispatched { batch_id, records }) => {
                        debug!(class = %class, batch_id = %batch_id, records, "Dispatched batch");
                    }
                    Ok(TickOutcome::Saturated) => {
                        debug!(class = %class, "All delivery slots busy, records stay on disk");
                    }
                    Ok(TickOutcome::NoOutput) => {
                        debug!(class = %class, "No active output, records stay on disk");
                    }
                    Ok(TickOutcome::Idle) => {}
                    Err(e) if e.is_closed() => {
                        debug!(class = %class, "Queue closed, ending drain loop");
                        break;
                    }
                    Err(e) => {
                        error!(class = %class, error = %e, "Drain tick failed");
                    }
                }
            }
        }
    }

    info!(class = %class, "Drain loop stopped");
}

enum RunState {
    Stopped,
    Running {
        token: CancellationToken,
        loops: Vec<JoinHandle<()>>,
    },
}

/// Drives both classes from independent timers.
pub struct CollectorScheduler {
    shared: Arc<Shared>,
    state: parking_lot::Mutex<RunState>,
}

impl CollectorScheduler {
    pub fn new(
        queues: &QueueSet,
        outputs: Arc<OutputManager>,
        metrics: PipelineMetrics,
        config: SchedulerConfig,
    ) -> Self {
        let slots = config.max_in_flight.max(1);
        let lane = |class: TelemetryClass| Lane {
            queue: queues.get(class).clone(),
            permits: Arc::new(Semaphore::new(slots)),
        };
        Self {
            shared: Arc::new(Shared {
                trace_lane: lane(TelemetryClass::Trace),
                metric_lane: lane(TelemetryClass::Metric),
                outputs,
                metrics,
                config,
                deliveries: TaskTracker::new(),
            }),
            state: parking_lot::Mutex::new(RunState::Stopped),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match &*self.state.lock() {
            RunState::Stopped => SchedulerState::Stopped,
            RunState::Running { .. } => SchedulerState::Running,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Deliveries of `class` that have not been acknowledged yet.
    pub fn in_flight(&self, class: TelemetryClass) -> usize {
        let slots = self.shared.config.max_in_flight.max(1);
        slots - self.shared.lane(class).permits.available_permits()
    }

    /// Run one drain tick for `class` outside the timer.
    pub async fn drain_once(&self, class: TelemetryClass) -> Result<TickOutcome, QueueError> {
        self.shared.drain_once(class).await
    }

    /// Start one drain loop per class.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if matches!(*state, RunState::Running { .. }) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let loops = TelemetryClass::ALL
            .iter()
            .map(|class| tokio::spawn(run_lane(self.shared.clone(), *class, token.clone())))
            .collect();
        *state = RunState::Running { token, loops };
        info!("Collector scheduler started");
        Ok(())
    }

    /// Stop both loops, then wait up to `timeout` for in-flight deliveries.
    /// Returns whether every delivery finished in time.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), RunState::Stopped);
        let RunState::Running { token, loops } = previous else {
            return true;
        };

        token.cancel();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Drain loop ended abnormally");
            }
        }

        let deliveries = &self.shared.deliveries;
        deliveries.close();
        let finished = tokio::time::timeout(timeout, deliveries.wait()).await.is_ok();
        if finished {
            info!("Collector scheduler stopped");
        } else {
            warn!(
                in_flight = deliveries.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timeout reached with deliveries still in flight"
            );
        }
        deliveries.reopen();
        finished
    }
}
