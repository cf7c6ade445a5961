use std::fmt;
use std::sync::Arc;

use runnel_core::error::Result;

use crate::runnable::RunnableRef;
use crate::value::{Payload, TypeTag};

type Step = dyn Fn(&Payload) -> Option<Payload> + Send + Sync;

/// Whether an advancer hands the source output over unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancerKind {
    PassThrough,
    Converting,
}

/// A directed, conditioned edge towards one target runnable.
///
/// The typed constructors check that the value reaching the target matches
/// its declared input type, and erase predicate and converter into a single
/// `payload -> Option<payload>` step. Whether the predicate accepts the
/// source runnable's output type is checked when the advancer is attached
/// (see `OrchestrationBuilder::advance`).
#[derive(Clone)]
pub struct Advancer {
    target: RunnableRef,
    source: TypeTag,
    kind: AdvancerKind,
    step: Arc<Step>,
}

impl Advancer {
    /// Pass the output through unchanged when `predicate` accepts it.
    pub fn when<O, P>(target: &RunnableRef, predicate: P) -> Result<Self>
    where
        O: fmt::Debug + Send + Sync + 'static,
        P: Fn(&O) -> bool + Send + Sync + 'static,
    {
        let source = TypeTag::of::<O>();
        target
            .input_type()
            .require(&source, || format!("advancer into {}", target.name()))?;

        let step = move |value: &Payload| -> Option<Payload> {
            let output = (**value).downcast_ref::<O>()?;
            predicate(output).then(|| value.clone())
        };

        Ok(Self {
            target: target.clone(),
            source,
            kind: AdvancerKind::PassThrough,
            step: Arc::new(step),
        })
    }

    /// Unconditional pass-through.
    pub fn always<O>(target: &RunnableRef) -> Result<Self>
    where
        O: fmt::Debug + Send + Sync + 'static,
    {
        Self::when::<O, _>(target, |_| true)
    }

    /// Convert the output into the target's input type when `predicate` accepts it.
    pub fn convert<O, I, P, C>(target: &RunnableRef, predicate: P, converter: C) -> Result<Self>
    where
        O: fmt::Debug + Send + Sync + 'static,
        I: fmt::Debug + Send + Sync + 'static,
        P: Fn(&O) -> bool + Send + Sync + 'static,
        C: Fn(&O) -> I + Send + Sync + 'static,
    {
        target
            .input_type()
            .require(&TypeTag::of::<I>(), || {
                format!("converter output into {}", target.name())
            })?;

        let step = move |value: &Payload| -> Option<Payload> {
            let output = (**value).downcast_ref::<O>()?;
            if !predicate(output) {
                return None;
            }
            Some(Arc::new(converter(output)) as Payload)
        };

        Ok(Self {
            target: target.clone(),
            source: TypeTag::of::<O>(),
            kind: AdvancerKind::Converting,
            step: Arc::new(step),
        })
    }

    /// Unconditional conversion.
    pub fn map<O, I, C>(target: &RunnableRef, converter: C) -> Result<Self>
    where
        O: fmt::Debug + Send + Sync + 'static,
        I: fmt::Debug + Send + Sync + 'static,
        C: Fn(&O) -> I + Send + Sync + 'static,
    {
        Self::convert::<O, I, _, _>(target, |_| true, converter)
    }

    pub fn target(&self) -> &RunnableRef {
        &self.target
    }

    /// Type the predicate accepts.
    pub fn source_type(&self) -> TypeTag {
        self.source
    }

    pub fn kind(&self) -> AdvancerKind {
        self.kind
    }

    /// Apply predicate and converter; `None` when the edge does not fire.
    pub(crate) fn apply(&self, output: &Payload) -> Option<Payload> {
        (self.step)(output)
    }
}

impl fmt::Debug for Advancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advancer")
            .field("target", &self.target.name())
            .field("source", &self.source)
            .field("kind", &self.kind)
            .finish()
    }
}
