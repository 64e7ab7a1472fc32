//! Tick Scheduler
//!
//! Runs many operation instances at once. Each dispatched tick runs on its
//! own worker thread and reports back over a channel; no thread is held
//! while an instance waits to be polled again.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::context::ExecutionContext;
use crate::errors::EngineError;
use crate::monitoring::{ExecutionTimeline, TickKind};

use super::engine::{OperationEngine, TickOutcome};

type Completion = (ExecutionContext, Result<TickOutcome, EngineError>);

struct Queued {
    due: Instant,
    ctx: ExecutionContext,
}

/// Terminal result of one instance.
#[derive(Debug)]
pub struct InstanceResult {
    pub process_id: String,
    /// Terminal outcome, or the engine error that stopped the instance
    pub outcome: Result<TickOutcome, EngineError>,
}

/// Summary of a scheduler run.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<InstanceResult>,
    pub timeline: ExecutionTimeline,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn result_for(&self, process_id: &str) -> Option<&InstanceResult> {
        self.results
            .iter()
            .find(|result| result.process_id == process_id)
    }

    pub fn all_finished(&self) -> bool {
        self.results
            .iter()
            .all(|result| matches!(result.outcome, Ok(TickOutcome::Finished)))
    }
}

/// Dispatches ticks of many instances on a bounded set of worker threads.
pub struct Scheduler {
    engine: Arc<OperationEngine>,
    max_parallel: usize,
    poll_interval: Duration,
}

impl Scheduler {
    /// Takes parallelism and poll interval from the engine configuration.
    pub fn new(engine: Arc<OperationEngine>) -> Self {
        let max_parallel = engine.config().max_parallel.max(1);
        let poll_interval = engine.config().poll_interval();
        Self {
            engine,
            max_parallel,
            poll_interval,
        }
    }

    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Drives every instance to a terminal outcome.
    ///
    /// `Advanced` instances are ticked again right away; `Poll` and `Retry`
    /// instances wait one poll interval. At most one tick per instance is in
    /// flight, so steps of an instance never overlap.
    pub fn run(&self, instances: Vec<ExecutionContext>) -> RunReport {
        let start_time = Instant::now();
        let mut timeline = ExecutionTimeline::new();
        let mut results = Vec::new();

        let mut queue: VecDeque<Queued> = instances
            .into_iter()
            .map(|ctx| {
                timeline.add_event(ctx.process_id(), None, TickKind::Queued);
                Queued {
                    due: start_time,
                    ctx,
                }
            })
            .collect();

        info!(
            "Scheduling {} operations (max parallel: {}, poll interval: {:?})",
            queue.len(),
            self.max_parallel,
            self.poll_interval
        );

        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let mut running_count = 0;

        loop {
            // Dispatch due instances
            let now = Instant::now();
            while running_count < self.max_parallel {
                let Some(position) = queue.iter().position(|queued| queued.due <= now) else {
                    break;
                };
                let Some(queued) = queue.remove(position) else {
                    break;
                };
                self.dispatch(queued.ctx, tx.clone());
                running_count += 1;
            }

            if running_count == 0 && queue.is_empty() {
                break;
            }

            let wait = queue
                .iter()
                .map(|queued| queued.due.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(self.poll_interval);

            if running_count == 0 {
                thread::sleep(wait);
                continue;
            }

            let (ctx, result) = match rx.recv_timeout(wait) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Tick completion channel closed unexpectedly");
                    break;
                }
            };
            running_count -= 1;

            let process_id = ctx.process_id().to_string();
            match result {
                Ok(outcome) => {
                    timeline.record_outcome(&process_id, &outcome);
                    if outcome.is_terminal() {
                        results.push(InstanceResult {
                            process_id,
                            outcome: Ok(outcome),
                        });
                        continue;
                    }

                    let delay = match outcome {
                        TickOutcome::Advanced { .. } => Duration::ZERO,
                        _ => self.poll_interval,
                    };
                    debug!("Operation {} re-queued in {:?}", process_id, delay);
                    queue.push_back(Queued {
                        due: Instant::now() + delay,
                        ctx,
                    });
                }
                Err(e) => {
                    error!("Operation {} stopped: {}", process_id, e);
                    timeline.add_event(&process_id, None, TickKind::Crashed);
                    results.push(InstanceResult {
                        process_id,
                        outcome: Err(e),
                    });
                }
            }
        }

        RunReport {
            results,
            timeline,
            elapsed: start_time.elapsed(),
        }
    }

    /// A panicking step ends its instance as failed, so the worker always
    /// reports back and the lock is released.
    fn dispatch(&self, mut ctx: ExecutionContext, tx: Sender<Completion>) {
        let engine = Arc::clone(&self.engine);
        thread::spawn(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| engine.tick(&mut ctx))) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Tick of operation {} panicked: {}", ctx.process_id(), message);
                    engine.fail_panicked(&mut ctx, &message)
                }
            };
            if let Err(e) = tx.send((ctx, result)) {
                error!("Failed to send tick completion: {}", e);
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
