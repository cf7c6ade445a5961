use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use runnel_core::error::{Result, RunnelError};

use crate::advancer::Advancer;
use crate::process::{BatchInvocation, Invocation, InvocationContext};
use crate::value::{Payload, TypeTag};

type SingleWork = dyn Fn(Payload, InvocationContext) -> BoxFuture<'static, Result<Payload>> + Send + Sync;
type BatchWork =
    dyn Fn(Vec<Payload>, InvocationContext) -> BoxFuture<'static, Result<Payload>> + Send + Sync;

/// Erased work function of a runnable.
#[derive(Clone)]
pub(crate) enum Work {
    /// One invocation per queued process.
    Single(Arc<SingleWork>),
    /// One invocation over every queued process.
    Batched(Arc<BatchWork>),
}

/// Handle to a runnable registered in an orchestration builder.
#[derive(Debug, Clone)]
pub struct RunnableRef {
    index: usize,
    name: String,
    input: TypeTag,
    output: TypeTag,
}

impl RunnableRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_type(&self) -> TypeTag {
        self.input
    }

    pub fn output_type(&self) -> TypeTag {
        self.output
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

/// A typed processing stage in the orchestration graph.
///
/// Created once at graph-build time and never mutated during a run. The
/// orchestrator owns the processes queued at each runnable; the runnable
/// itself only knows how to invoke its work and where results may go next.
pub struct Runnable {
    name: String,
    input: TypeTag,
    output: TypeTag,
    work: Work,
    advancers: Vec<Advancer>,
    allow_dead_end: bool,
    parallel_advances: bool,
    max_reruns: Option<u32>,
    accumulates: bool,
}

/// A value on its way to a downstream runnable.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) target: RunnableRef,
    pub(crate) value: Payload,
}

/// Outcome of evaluating the advancers for one finished invocation.
#[derive(Debug)]
pub(crate) enum Advancement {
    Next(Vec<Candidate>),
    DeadEnd,
    Rerun,
    Exhausted,
}

impl Runnable {
    /// Runnable invoked once per queued process.
    pub fn new<I, O, F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        I: fmt::Debug + Send + Sync + 'static,
        O: fmt::Debug + Send + Sync + 'static,
        F: Fn(Invocation<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let name = name.into();
        let owner = name.clone();
        let erased = move |input: Payload, ctx: InvocationContext| -> BoxFuture<'static, Result<Payload>> {
            let input = match input.downcast::<I>() {
                Ok(input) => input,
                Err(_) => return input_mismatch::<I>(&owner),
            };
            let fut = work(Invocation::new(input, ctx));
            Box::pin(async move { fut.await.map(|out| Arc::new(out) as Payload) })
        };

        Self::with_work::<I, O>(name, Work::Single(Arc::new(erased)))
    }

    /// Runnable invoked once per tick with every queued input.
    pub fn batched<I, O, F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        I: fmt::Debug + Send + Sync + 'static,
        O: fmt::Debug + Send + Sync + 'static,
        F: Fn(BatchInvocation<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let name = name.into();
        let owner = name.clone();
        let erased = move |inputs: Vec<Payload>, ctx: InvocationContext| -> BoxFuture<'static, Result<Payload>> {
            let mut typed = Vec::with_capacity(inputs.len());
            for input in inputs {
                match input.downcast::<I>() {
                    Ok(input) => typed.push(input),
                    Err(_) => return input_mismatch::<I>(&owner),
                }
            }
            let fut = work(BatchInvocation::new(typed, ctx));
            Box::pin(async move { fut.await.map(|out| Arc::new(out) as Payload) })
        };

        Self::with_work::<I, O>(name, Work::Batched(Arc::new(erased)))
    }

    fn with_work<I, O>(name: String, work: Work) -> Self
    where
        I: fmt::Debug + Send + Sync + 'static,
        O: fmt::Debug + Send + Sync + 'static,
    {
        Self {
            name,
            input: TypeTag::of::<I>(),
            output: TypeTag::of::<O>(),
            work,
            advancers: Vec::new(),
            allow_dead_end: false,
            parallel_advances: false,
            max_reruns: None,
            accumulates: false,
        }
    }

    /// Let branches end here when no advancer fires.
    pub fn allow_dead_end(mut self) -> Self {
        self.allow_dead_end = true;
        self
    }

    /// Fire every matching advancer instead of only the first.
    pub fn parallel_advances(mut self) -> Self {
        self.parallel_advances = true;
        self
    }

    /// Override the engine-wide rerun bound for processes queued here.
    pub fn with_max_reruns(mut self, max_reruns: u32) -> Self {
        self.max_reruns = Some(max_reruns.max(1));
        self
    }

    /// Keep batched inputs across ticks until an advancer fires.
    pub(crate) fn accumulating(mut self) -> Self {
        self.accumulates = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_type(&self) -> TypeTag {
        self.input
    }

    pub fn output_type(&self) -> TypeTag {
        self.output
    }

    /// Outgoing advancers in priority order.
    pub fn advancers(&self) -> &[Advancer] {
        &self.advancers
    }

    pub fn allows_dead_end(&self) -> bool {
        self.allow_dead_end
    }

    pub fn allows_parallel_advances(&self) -> bool {
        self.parallel_advances
    }

    pub fn single_invoke_for_processes(&self) -> bool {
        matches!(self.work, Work::Batched(_))
    }

    pub fn max_reruns(&self) -> Option<u32> {
        self.max_reruns
    }

    pub fn accumulates(&self) -> bool {
        self.accumulates
    }

    pub(crate) fn work(&self) -> &Work {
        &self.work
    }

    pub(crate) fn reference(&self, index: usize) -> RunnableRef {
        RunnableRef {
            index,
            name: self.name.clone(),
            input: self.input,
            output: self.output,
        }
    }

    pub(crate) fn push_advancer(&mut self, advancer: Advancer) {
        self.advancers.push(advancer);
    }

    /// Decide where a finished invocation goes.
    ///
    /// `output` is `None` when the work function failed, which takes the same
    /// path as a result no advancer accepts. Registration order is priority
    /// order: without parallel advances the first match wins.
    ///
    /// `can_rerun` holds when at least one invoked process is still below its
    /// rerun bound; the caller drops the others.
    pub(crate) fn advance(&self, output: Option<&Payload>, can_rerun: bool) -> Result<Advancement> {
        let mut next = Vec::new();
        if let Some(output) = output {
            for advancer in &self.advancers {
                if let Some(value) = advancer.apply(output) {
                    next.push(Candidate {
                        target: advancer.target().clone(),
                        value,
                    });
                    if !self.parallel_advances {
                        break;
                    }
                }
            }
        }

        if !next.is_empty() {
            return Ok(Advancement::Next(next));
        }
        if self.allow_dead_end {
            return Ok(Advancement::DeadEnd);
        }
        if self.advancers.is_empty() {
            return Err(RunnelError::NoAdvancers(self.name.clone()));
        }
        if can_rerun {
            Ok(Advancement::Rerun)
        } else {
            Ok(Advancement::Exhausted)
        }
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnable")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("advancers", &self.advancers.len())
            .field("allow_dead_end", &self.allow_dead_end)
            .field("parallel_advances", &self.parallel_advances)
            .field("batched", &self.single_invoke_for_processes())
            .finish()
    }
}

fn input_mismatch<I: 'static>(runnable: &str) -> BoxFuture<'static, Result<Payload>> {
    let err = RunnelError::TypeMismatch {
        context: format!("input of {}", runnable),
        expected: std::any::type_name::<I>().to_string(),
        found: "a payload of another type".to_string(),
    };
    Box::pin(futures::future::ready(Err(err)))
}
