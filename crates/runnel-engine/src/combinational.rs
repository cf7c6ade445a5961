use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use runnel_core::error::Result;

use crate::advancer::Advancer;
use crate::process::BatchInvocation;
use crate::runnable::{Runnable, RunnableRef};

/// Output of a [`CombinationalWaiter`]: every input buffered so far plus
/// the arrival count the join is waiting for.
#[derive(Debug, Clone)]
pub struct Combined<T> {
    items: Vec<Arc<T>>,
    required: usize,
}

impl<T> Combined<T> {
    pub fn items(&self) -> &[Arc<T>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Arc<T>> {
        self.items
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_complete(&self) -> bool {
        self.count() >= self.required
    }
}

/// Join node that holds back until `required` upstream contributions have
/// arrived, across any number of ticks.
///
/// Internally a batched runnable whose queue is carried over between ticks
/// until its advancer fires. While incomplete it behaves as a dead end, so
/// partial joins are not retried.
pub struct CombinationalWaiter<T> {
    name: String,
    required: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CombinationalWaiter<T>
where
    T: fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, required: usize) -> Self {
        Self {
            name: name.into(),
            required: required.max(1),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required(&self) -> usize {
        self.required
    }

    /// Runnable to register in the builder.
    pub fn into_runnable(self) -> Runnable {
        let required = self.required;
        Runnable::batched(self.name, move |batch: BatchInvocation<T>| async move {
            Ok(Combined {
                items: batch.into_inputs(),
                required,
            })
        })
        .accumulating()
        .allow_dead_end()
    }

    /// Hand the completed join to `target` unchanged.
    pub fn advance_to(target: &RunnableRef) -> Result<Advancer> {
        Advancer::when::<Combined<T>, _>(target, Combined::is_complete)
    }

    /// Convert the completed join into `target`'s input type.
    pub fn advance_with<I, C>(target: &RunnableRef, converter: C) -> Result<Advancer>
    where
        I: fmt::Debug + Send + Sync + 'static,
        C: Fn(&Combined<T>) -> I + Send + Sync + 'static,
    {
        Advancer::convert::<Combined<T>, I, _, _>(target, Combined::is_complete, converter)
    }
}
