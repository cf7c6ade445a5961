use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runnel_core::config::EngineConfig;
use runnel_core::error::{Result, RunnelError};
use runnel_core::event::EventBus;
use runnel_core::types::{
    DroppedBranch, ExecutionRecord, OrchestrationEvent, RunId, RunStatus, StrandedJoin,
    Transition,
};

use crate::orchestration::Orchestration;
use crate::process::{InvocationContext, Process, UsageMeter};
use crate::properties::RunProperties;
use crate::record::ExecutionTrace;
use crate::runnable::{Advancement, Work};
use crate::value::{payload, Payload};

/// Summary returned by [`Orchestrator::invoke`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub ticks: u64,
    /// Work-function invocations (a batched runnable counts once per tick).
    pub invocations: u64,
    pub usage: u64,
    pub elapsed_ms: u64,
    /// Branches abandoned after exhausting their reruns.
    pub dropped: Vec<DroppedBranch>,
    /// Joins left below their required count when the run completed.
    pub stranded: Vec<StrandedJoin>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Mutable state of one run. Replaced wholesale on every (re)initialization.
#[derive(Default)]
struct RunState {
    run_id: RunId,
    /// Processes queued per runnable for the next tick. Keyed by runnable
    /// index, which also deduplicates activations of a runnable.
    queues: BTreeMap<usize, Vec<Process>>,
    /// Inputs held by accumulating runnables until their advancer fires.
    join_buffers: HashMap<usize, Vec<Payload>>,
    /// Successful outputs per runnable.
    history: HashMap<usize, Vec<Payload>>,
    completed: bool,
    tick: u64,
    step: u64,
    invocations: u64,
    usage: u64,
    dropped: Vec<DroppedBranch>,
    stranded: Vec<StrandedJoin>,
}

/// One invocation scheduled within a tick.
struct Job {
    runnable: usize,
    processes: Vec<Process>,
    inputs: Vec<Payload>,
}

struct JobOutcome {
    result: Result<Payload>,
    elapsed: Duration,
    usage: u64,
}

/// Drives an [`Orchestration`] in supersteps.
///
/// Each tick invokes every active runnable concurrently, waits for all of
/// them, then evaluates advancers and activates the next set. A runnable is
/// activated at most once per tick and sees every process queued for it.
/// Cancellation is observed between ticks only.
pub struct Orchestrator<I, O> {
    graph: Arc<Orchestration<I, O>>,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
    properties: RunProperties,
    cancel: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
    state: RunState,
    trace: ExecutionTrace,
}

impl<I, O> Orchestrator<I, O>
where
    I: fmt::Debug + Send + Sync + 'static,
    O: fmt::Debug + Send + Sync + 'static,
{
    pub fn new(graph: Orchestration<I, O>) -> Self {
        Self::with_config(graph, EngineConfig::default())
    }

    pub fn with_config(graph: Orchestration<I, O>, config: EngineConfig) -> Self {
        let semaphore = (config.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrency)));
        Self {
            graph: Arc::new(graph),
            event_bus: Arc::new(EventBus::new(config.event_capacity)),
            config,
            properties: RunProperties::new(),
            cancel: CancellationToken::new(),
            semaphore,
            state: RunState::default(),
            trace: ExecutionTrace::new(),
        }
    }

    /// Publish lifecycle events to a shared bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Seed the run property bag.
    pub fn with_properties(mut self, properties: RunProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Reset all run state so the orchestrator can run again.
    ///
    /// A cancelled token is replaced; the property bag is kept.
    pub fn initialize(&mut self) {
        self.reset_run();
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    /// Run the orchestration to completion (or cancellation) for `input`.
    ///
    /// State left by a previous run is discarded first. A pending
    /// cancellation is honoured before the first tick; call
    /// [`initialize`](Self::initialize) to clear it.
    pub async fn invoke(&mut self, input: I) -> Result<RunReport> {
        let started = Instant::now();
        self.reset_run();

        let run_id = self.state.run_id.clone();
        let entry = self.graph.entry_index();
        let entry_name = self.graph.entry().name().to_string();
        let process = Process::new(payload(input), self.max_reruns_for(entry));
        self.state.queues.insert(entry, vec![process]);

        info!(
            run_id = %run_id,
            orchestration = %self.graph.name(),
            entry = %entry_name,
            "Orchestration run started"
        );
        self.event_bus.publish(OrchestrationEvent::RunStarted {
            run_id: run_id.clone(),
            entry: entry_name,
        });

        match self.run_loop().await {
            Ok(status) => Ok(RunReport {
                run_id,
                status,
                ticks: self.state.tick,
                invocations: self.state.invocations,
                usage: self.state.usage,
                elapsed_ms: started.elapsed().as_millis() as u64,
                dropped: self.state.dropped.clone(),
                stranded: self.state.stranded.clone(),
            }),
            Err(e) => {
                self.state.queues.clear();
                self.state.join_buffers.clear();
                error!(run_id = %run_id, tick = self.state.tick, error = %e, "Orchestration run failed");
                self.event_bus.publish(OrchestrationEvent::RunError {
                    run_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Request cancellation. Takes effect at the next tick boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this orchestrator when triggered from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn properties(&self) -> RunProperties {
        self.properties.clone()
    }

    pub fn orchestration(&self) -> &Orchestration<I, O> {
        &self.graph
    }

    /// Execution records of the last run (empty unless `record_steps`).
    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    /// Whether the last run reached an empty active set.
    pub fn is_completed(&self) -> bool {
        self.state.completed
    }

    /// Outputs of the result runnable from the last run.
    pub fn results(&self) -> Vec<Arc<O>> {
        self.raw_results()
            .iter()
            .filter_map(|value| value.clone().downcast::<O>().ok())
            .collect()
    }

    pub fn raw_results(&self) -> &[Payload] {
        self.history(self.graph.result_index())
    }

    /// Result outputs as `T`; `None` if any of them is not a `T`.
    pub fn try_results<T>(&self) -> Option<Vec<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        self.raw_results()
            .iter()
            .map(|value| value.clone().downcast::<T>().ok())
            .collect()
    }

    /// Successful outputs of any runnable from the last run.
    pub fn outputs_of(&self, name: &str) -> &[Payload] {
        match self.graph.runnables().position(|r| r.name() == name) {
            Some(index) => self.history(index),
            None => &[],
        }
    }

    fn history(&self, index: usize) -> &[Payload] {
        self.state
            .history
            .get(&index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn reset_run(&mut self) {
        self.state = RunState::default();
        self.trace.clear();
    }

    fn max_reruns_for(&self, index: usize) -> u32 {
        self.graph
            .runnable_at(index)
            .max_reruns()
            .unwrap_or(self.config.max_reruns)
            .max(1)
    }

    fn active_names(&self) -> Vec<String> {
        self.state
            .queues
            .keys()
            .map(|&index| self.graph.runnable_at(index).name().to_string())
            .collect()
    }

    async fn run_loop(&mut self) -> Result<RunStatus> {
        loop {
            let run_id = self.state.run_id.clone();

            if self.state.queues.is_empty() {
                self.state.completed = true;
                self.report_stranded(&run_id);
                info!(
                    run_id = %run_id,
                    ticks = self.state.tick,
                    invocations = self.state.invocations,
                    dropped = self.state.dropped.len(),
                    "Orchestration run complete"
                );
                self.event_bus.publish(OrchestrationEvent::RunComplete {
                    run_id,
                    ticks: self.state.tick,
                    invocations: self.state.invocations,
                    usage: self.state.usage,
                });
                return Ok(RunStatus::Completed);
            }

            if self.cancel.is_cancelled() {
                let exited = self.active_names();
                self.state.queues.clear();
                self.state.join_buffers.clear();
                info!(run_id = %run_id, tick = self.state.tick, exited = ?exited, "Orchestration run cancelled");
                self.event_bus.publish(OrchestrationEvent::RunCancelled {
                    run_id,
                    ticks: self.state.tick,
                    exited,
                });
                return Ok(RunStatus::Cancelled);
            }

            if self.config.max_ticks > 0 && self.state.tick >= self.config.max_ticks {
                return Err(RunnelError::TickLimitExceeded(self.config.max_ticks));
            }

            self.tick().await?;
        }
    }

    /// Joins still holding inputs once nothing is left to feed them.
    fn report_stranded(&mut self, run_id: &RunId) {
        let mut buffers: Vec<_> = self.state.join_buffers.drain().collect();
        buffers.sort_by_key(|(index, _)| *index);
        for (index, inputs) in buffers {
            let join = StrandedJoin {
                runnable: self.graph.runnable_at(index).name().to_string(),
                buffered: inputs.len(),
            };
            warn!(
                run_id = %run_id,
                runnable = %join.runnable,
                buffered = join.buffered,
                "Join stranded below its required count"
            );
            self.event_bus.publish(OrchestrationEvent::JoinStranded {
                run_id: run_id.clone(),
                join: join.clone(),
            });
            self.state.stranded.push(join);
        }
    }

    /// One superstep: invoke, advance, exit, reactivate.
    async fn tick(&mut self) -> Result<()> {
        self.state.tick += 1;
        let tick = self.state.tick;
        let run_id = self.state.run_id.clone();
        let graph = Arc::clone(&self.graph);

        let active = self.active_names();
        debug!(run_id = %run_id, tick, active = ?active, "Tick started");
        self.event_bus.publish(OrchestrationEvent::TickStarted {
            run_id: run_id.clone(),
            tick,
            active,
        });

        let now = Utc::now();
        let mut jobs = Vec::new();
        for (index, mut processes) in std::mem::take(&mut self.state.queues) {
            let runnable = graph.runnable_at(index);
            for process in &mut processes {
                process.begin(now);
            }

            if runnable.single_invoke_for_processes() {
                let mut inputs = if runnable.accumulates() {
                    self.state.join_buffers.remove(&index).unwrap_or_default()
                } else {
                    Vec::new()
                };
                inputs.extend(processes.iter().map(|p| p.input().clone()));
                jobs.push(Job {
                    runnable: index,
                    processes,
                    inputs,
                });
            } else {
                for process in processes {
                    jobs.push(Job {
                        runnable: index,
                        inputs: vec![process.input().clone()],
                        processes: vec![process],
                    });
                }
            }
        }

        let handles: Vec<_> = jobs.iter().map(|job| self.spawn(job)).collect();
        let outcomes = join_all(handles).await;

        let invocations = jobs.len();
        let mut next: BTreeMap<usize, Vec<Process>> = BTreeMap::new();
        for (job, joined) in jobs.into_iter().zip(outcomes) {
            let outcome = joined.unwrap_or_else(|e| JobOutcome {
                result: Err(RunnelError::Panicked {
                    runnable: graph.runnable_at(job.runnable).name().to_string(),
                    message: panic_message(e),
                }),
                elapsed: Duration::ZERO,
                usage: 0,
            });
            self.settle(&graph, job, outcome, tick, &mut next)?;
        }

        self.state.invocations += invocations as u64;
        self.state.queues = next;

        let next_active = self.active_names();
        debug!(run_id = %run_id, tick, invocations, next_active = ?next_active, "Tick completed");
        self.event_bus.publish(OrchestrationEvent::TickCompleted {
            run_id,
            tick,
            invocations,
            next_active,
        });
        Ok(())
    }

    fn spawn(&self, job: &Job) -> tokio::task::JoinHandle<JobOutcome> {
        let runnable = self.graph.runnable_at(job.runnable);
        let name = runnable.name().to_string();
        let work = runnable.work().clone();
        let inputs = job.inputs.clone();
        let usage = UsageMeter::new();
        let context = InvocationContext {
            process_ids: job.processes.iter().map(|p| p.id().clone()).collect(),
            attempt: job.processes.iter().map(Process::attempts).max().unwrap_or(1),
            usage: usage.clone(),
            properties: self.properties.clone(),
            cancel: self.cancel.child_token(),
        };
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };

            let started = Instant::now();
            let result = match work {
                Work::Single(work) => match inputs.into_iter().next() {
                    Some(input) => work(input, context).await,
                    None => Err(RunnelError::work(name, "no input queued")),
                },
                Work::Batched(work) => work(inputs, context).await,
            };

            JobOutcome {
                result,
                elapsed: started.elapsed(),
                usage: usage.total(),
            }
        })
    }

    /// Node exit for one invocation: record, keep history, route processes.
    fn settle(
        &mut self,
        graph: &Orchestration<I, O>,
        mut job: Job,
        outcome: JobOutcome,
        tick: u64,
        next: &mut BTreeMap<usize, Vec<Process>>,
    ) -> Result<()> {
        let runnable = graph.runnable_at(job.runnable);
        let run_id = self.state.run_id.clone();
        let JobOutcome {
            result,
            elapsed,
            usage,
        } = outcome;
        self.state.usage += usage;

        // batch usage is attributed to the first process
        for (i, process) in job.processes.iter_mut().enumerate() {
            let share = if i == 0 { usage } else { 0 };
            let result = match &result {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(e.to_string()),
            };
            process.finish(result, elapsed, share);
        }

        if let Err(e) = &result {
            warn!(
                run_id = %run_id,
                runnable = %runnable.name(),
                tick,
                error = %e,
                "Invocation failed"
            );
            for process in &job.processes {
                self.event_bus.publish(OrchestrationEvent::InvocationFailed {
                    run_id: run_id.clone(),
                    process_id: process.id().clone(),
                    runnable: runnable.name().to_string(),
                    error: e.to_string(),
                });
            }
        }

        let output = result.ok();
        // exhausted processes are split off the batch when routing
        let can_rerun = job.processes.iter().any(Process::can_rerun);
        let advancement = runnable.advance(output.as_ref(), can_rerun)?;

        if self.config.record_steps {
            let transitions: Vec<Transition> = match &advancement {
                Advancement::Next(candidates) => candidates
                    .iter()
                    .map(|c| Transition {
                        from: runnable.name().to_string(),
                        to: c.target.name().to_string(),
                        output: c.target.input_type().describe(&c.value),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            for (i, process) in job.processes.iter().enumerate() {
                self.state.step += 1;
                let record = ExecutionRecord {
                    step: self.state.step,
                    tick,
                    process_id: process.id().clone(),
                    runnable: runnable.name().to_string(),
                    usage: if i == 0 { usage } else { 0 },
                    created_at: process.started_at().unwrap_or_else(Utc::now),
                    duration_ms: process.elapsed().as_millis() as u64,
                    input: runnable.input_type().describe(process.input()),
                    output: process.result().map(|o| runnable.output_type().describe(o)),
                    error: process.error().map(String::from),
                    transitions: transitions.clone(),
                };
                self.trace.append(record.clone());
                self.event_bus.publish(OrchestrationEvent::StepRecorded {
                    run_id: run_id.clone(),
                    record,
                });
            }
        }

        if let Some(output) = output {
            self.state
                .history
                .entry(job.runnable)
                .or_default()
                .push(output);
        }

        match advancement {
            Advancement::Next(candidates) => {
                if runnable.accumulates() {
                    debug!(
                        run_id = %run_id,
                        runnable = %runnable.name(),
                        count = job.inputs.len(),
                        "Join complete"
                    );
                }
                for candidate in candidates {
                    let target = candidate.target.index();
                    debug!(
                        run_id = %run_id,
                        from = %runnable.name(),
                        to = %candidate.target.name(),
                        "Advancing"
                    );
                    let process = Process::new(candidate.value, self.max_reruns_for(target));
                    next.entry(target).or_default().push(process);
                }
            }
            Advancement::DeadEnd if runnable.accumulates() => {
                debug!(
                    run_id = %run_id,
                    runnable = %runnable.name(),
                    count = job.inputs.len(),
                    "Join waiting for more inputs"
                );
                self.state.join_buffers.insert(job.runnable, job.inputs);
            }
            Advancement::DeadEnd => {
                for process in &job.processes {
                    debug!(run_id = %run_id, runnable = %runnable.name(), process_id = %process.id(), "Branch ended");
                    self.event_bus.publish(OrchestrationEvent::BranchEnded {
                        run_id: run_id.clone(),
                        process_id: process.id().clone(),
                        runnable: runnable.name().to_string(),
                    });
                }
            }
            Advancement::Rerun => {
                let (retry, exhausted): (Vec<_>, Vec<_>) =
                    job.processes.into_iter().partition(Process::can_rerun);
                debug!(
                    run_id = %run_id,
                    runnable = %runnable.name(),
                    processes = retry.len(),
                    "Rerun scheduled"
                );
                next.entry(job.runnable).or_default().extend(retry);
                for process in &exhausted {
                    self.drop_branch(&run_id, runnable.name(), process);
                }
            }
            Advancement::Exhausted => {
                for process in &job.processes {
                    self.drop_branch(&run_id, runnable.name(), process);
                }
            }
        }

        Ok(())
    }

    fn drop_branch(&mut self, run_id: &RunId, runnable: &str, process: &Process) {
        let branch = DroppedBranch {
            process_id: process.id().clone(),
            runnable: runnable.to_string(),
            attempts: process.attempts(),
            errored: process.errored(),
            usage: process.usage(),
        };
        warn!(
            run_id = %run_id,
            runnable = %branch.runnable,
            process_id = %branch.process_id,
            attempts = branch.attempts,
            errored = branch.errored,
            "Branch dropped after exhausting reruns"
        );
        self.event_bus.publish(OrchestrationEvent::BranchDropped {
            run_id: run_id.clone(),
            branch: branch.clone(),
        });
        self.state.dropped.push(branch);
    }
}

impl<I, O> fmt::Debug for Orchestrator<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("orchestration", &self.graph.name())
            .field("config", &self.config)
            .field("run_id", &self.state.run_id)
            .field("tick", &self.state.tick)
            .field("completed", &self.state.completed)
            .finish()
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let panic = err.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
