use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use runnel_core::types::ProcessId;

use crate::properties::RunProperties;
use crate::value::Payload;

/// One in-flight unit of work bound to a runnable.
///
/// A process never moves between runnables. Advancing replaces it with a
/// fresh process carrying the (possibly converted) result, while a rerun
/// re-queues the same process at the same runnable.
#[derive(Debug, Clone)]
pub struct Process {
    id: ProcessId,
    input: Payload,
    result: Option<Payload>,
    error: Option<String>,
    attempts: u32,
    max_reruns: u32,
    started_at: Option<DateTime<Utc>>,
    elapsed: Duration,
    usage: u64,
}

impl Process {
    pub fn new(input: Payload, max_reruns: u32) -> Self {
        Self {
            id: ProcessId::new(),
            input,
            result: None,
            error: None,
            attempts: 0,
            max_reruns,
            started_at: None,
            elapsed: Duration::ZERO,
            usage: 0,
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn input(&self) -> &Payload {
        &self.input
    }

    /// Result of the last invocation; `None` until invoked or after a failure.
    pub fn result(&self) -> Option<&Payload> {
        self.result.as_ref()
    }

    pub fn errored(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of invocations at the current runnable.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_reruns(&self) -> u32 {
        self.max_reruns
    }

    /// A rerun may be scheduled only while `attempts < max_reruns`.
    pub fn can_rerun(&self) -> bool {
        self.attempts < self.max_reruns
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Execution time of the last invocation.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Usage units accumulated over every invocation of this process.
    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub(crate) fn begin(&mut self, started_at: DateTime<Utc>) {
        self.attempts += 1;
        self.started_at = Some(started_at);
        self.result = None;
        self.error = None;
    }

    pub(crate) fn finish(&mut self, result: Result<Payload, String>, elapsed: Duration, usage: u64) {
        match result {
            Ok(value) => self.result = Some(value),
            Err(message) => self.error = Some(message),
        }
        self.elapsed = elapsed;
        self.usage += usage;
    }
}

/// Usage counter a work function reports into (e.g. tokens consumed).
#[derive(Debug, Clone, Default)]
pub struct UsageMeter(Arc<AtomicU64>);

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, units: u64) {
        self.0.fetch_add(units, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-side context shared by single and batched invocations.
#[derive(Debug, Clone)]
pub(crate) struct InvocationContext {
    pub(crate) process_ids: Vec<ProcessId>,
    pub(crate) attempt: u32,
    pub(crate) usage: UsageMeter,
    pub(crate) properties: RunProperties,
    pub(crate) cancel: CancellationToken,
}

/// What a work function receives for one process.
#[derive(Debug)]
pub struct Invocation<I> {
    input: Arc<I>,
    context: InvocationContext,
}

impl<I> Invocation<I> {
    pub(crate) fn new(input: Arc<I>, context: InvocationContext) -> Self {
        Self { input, context }
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    /// Shared handle to the input, for work that outlives the borrow.
    pub fn input_arc(&self) -> Arc<I> {
        self.input.clone()
    }

    pub fn process_id(&self) -> Option<&ProcessId> {
        self.context.process_ids.first()
    }

    /// 1-based attempt number at this runnable.
    pub fn attempt(&self) -> u32 {
        self.context.attempt
    }

    pub fn report_usage(&self, units: u64) {
        self.context.usage.report(units);
    }

    /// Meter handle for callbacks that report usage incrementally.
    pub fn usage_meter(&self) -> UsageMeter {
        self.context.usage.clone()
    }

    pub fn properties(&self) -> &RunProperties {
        &self.context.properties
    }

    /// Cancelled when the run is cancelled; long work may stop early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.context.cancel
    }
}

/// What a batched work function receives: every queued input at once.
#[derive(Debug)]
pub struct BatchInvocation<I> {
    inputs: Vec<Arc<I>>,
    context: InvocationContext,
}

impl<I> BatchInvocation<I> {
    pub(crate) fn new(inputs: Vec<Arc<I>>, context: InvocationContext) -> Self {
        Self { inputs, context }
    }

    pub fn inputs(&self) -> &[Arc<I>] {
        &self.inputs
    }

    pub fn into_inputs(self) -> Vec<Arc<I>> {
        self.inputs
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn process_ids(&self) -> &[ProcessId] {
        &self.context.process_ids
    }

    pub fn attempt(&self) -> u32 {
        self.context.attempt
    }

    pub fn report_usage(&self, units: u64) {
        self.context.usage.report(units);
    }

    pub fn usage_meter(&self) -> UsageMeter {
        self.context.usage.clone()
    }

    pub fn properties(&self) -> &RunProperties {
        &self.context.properties
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.context.cancel
    }
}
