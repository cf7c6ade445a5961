use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, warn};

use runnel_core::error::{Result, RunnelError};

use crate::advancer::Advancer;
use crate::runnable::{Runnable, RunnableRef};
use crate::value::TypeTag;

/// Assembles runnables and advancers into a typed orchestration.
///
/// Every edge is type-checked as it is added, so a built [`Orchestration`]
/// never hands a value to a runnable that cannot accept it.
pub struct OrchestrationBuilder<I, O> {
    name: String,
    runnables: Vec<Runnable>,
    by_name: HashMap<String, usize>,
    entry: Option<usize>,
    result: Option<usize>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> OrchestrationBuilder<I, O>
where
    I: fmt::Debug + Send + Sync + 'static,
    O: fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runnables: Vec::new(),
            by_name: HashMap::new(),
            entry: None,
            result: None,
            _marker: PhantomData,
        }
    }

    /// Register a runnable. Names are unique within an orchestration.
    pub fn add(&mut self, runnable: Runnable) -> Result<RunnableRef> {
        if self.by_name.contains_key(runnable.name()) {
            return Err(RunnelError::DuplicateRunnable(runnable.name().to_string()));
        }
        let index = self.runnables.len();
        let reference = runnable.reference(index);
        self.by_name.insert(runnable.name().to_string(), index);
        self.runnables.push(runnable);
        Ok(reference)
    }

    /// Append an advancer to `from`. Registration order is evaluation order.
    pub fn advance(&mut self, from: &RunnableRef, advancer: Advancer) -> Result<()> {
        let source = self.resolve(from)?;
        self.resolve(advancer.target())?;

        let runnable = &self.runnables[source];
        advancer.source_type().require(&runnable.output_type(), || {
            format!(
                "advancer {} -> {}",
                runnable.name(),
                advancer.target().name()
            )
        })?;

        debug!(
            from = %runnable.name(),
            to = %advancer.target().name(),
            kind = ?advancer.kind(),
            "Advancer registered"
        );
        self.runnables[source].push_advancer(advancer);
        Ok(())
    }

    /// Runnable that receives the orchestration input.
    pub fn set_entry(&mut self, runnable: &RunnableRef) -> Result<()> {
        let index = self.resolve(runnable)?;
        TypeTag::of::<I>().require(&self.runnables[index].input_type(), || {
            format!("entry runnable {}", runnable.name())
        })?;
        self.entry = Some(index);
        Ok(())
    }

    /// Runnable whose results are the orchestration output.
    pub fn set_result(&mut self, runnable: &RunnableRef) -> Result<()> {
        let index = self.resolve(runnable)?;
        TypeTag::of::<O>().require(&self.runnables[index].output_type(), || {
            format!("result runnable {}", runnable.name())
        })?;
        self.result = Some(index);
        Ok(())
    }

    /// Look up a registered runnable by name.
    pub fn runnable(&self, name: &str) -> Option<RunnableRef> {
        self.by_name
            .get(name)
            .map(|&index| self.runnables[index].reference(index))
    }

    pub fn build(self) -> Result<Orchestration<I, O>> {
        let entry = self.entry.ok_or(RunnelError::MissingEntry)?;
        let result = self.result.ok_or(RunnelError::MissingResult)?;

        let reachable = reachable_from(&self.runnables, entry);
        for (index, runnable) in self.runnables.iter().enumerate() {
            if !reachable.contains(&index) {
                warn!(
                    orchestration = %self.name,
                    runnable = %runnable.name(),
                    "Runnable is unreachable from the entry"
                );
            }
            if runnable.advancers().is_empty() && !runnable.allows_dead_end() {
                warn!(
                    orchestration = %self.name,
                    runnable = %runnable.name(),
                    "Runnable has no advancers and no dead end; it will fail when reached"
                );
            }
        }
        if !reachable.contains(&result) {
            warn!(
                orchestration = %self.name,
                runnable = %self.runnables[result].name(),
                "Result runnable is unreachable from the entry"
            );
        }

        Ok(Orchestration {
            name: self.name,
            runnables: self.runnables,
            entry,
            result,
            _marker: PhantomData,
        })
    }

    fn resolve(&self, reference: &RunnableRef) -> Result<usize> {
        match self.runnables.get(reference.index()) {
            Some(r) if r.name() == reference.name() => Ok(reference.index()),
            _ => Err(RunnelError::UnknownRunnable(reference.name().to_string())),
        }
    }
}

fn reachable_from(runnables: &[Runnable], entry: usize) -> HashSet<usize> {
    let mut seen = HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(index) = queue.pop_front() {
        for advancer in runnables[index].advancers() {
            let target = advancer.target().index();
            if seen.insert(target) {
                queue.push_back(target);
            }
        }
    }
    seen
}

/// Immutable orchestration graph taking `I` and producing `O`.
pub struct Orchestration<I, O> {
    name: String,
    runnables: Vec<Runnable>,
    entry: usize,
    result: usize,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Orchestration<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &Runnable {
        &self.runnables[self.entry]
    }

    pub fn result(&self) -> &Runnable {
        &self.runnables[self.result]
    }

    pub fn runnables(&self) -> impl Iterator<Item = &Runnable> {
        self.runnables.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Runnable> {
        self.runnables.iter().find(|r| r.name() == name)
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }

    pub(crate) fn entry_index(&self) -> usize {
        self.entry
    }

    pub(crate) fn result_index(&self) -> usize {
        self.result
    }

    pub(crate) fn runnable_at(&self, index: usize) -> &Runnable {
        &self.runnables[index]
    }
}

impl<I, O> fmt::Debug for Orchestration<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestration")
            .field("name", &self.name)
            .field("runnables", &self.runnables)
            .field("entry", &self.runnables[self.entry].name())
            .field("result", &self.runnables[self.result].name())
            .finish()
    }
}
