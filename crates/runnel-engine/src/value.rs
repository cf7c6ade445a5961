use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use runnel_core::error::{Result, RunnelError};

/// Type-erased value flowing between runnables.
///
/// Values are shared rather than moved so that one result can feed several
/// parallel advancers and the result history at the same time.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value into a [`Payload`].
pub fn payload<T: Send + Sync + 'static>(value: T) -> Payload {
    Arc::new(value)
}

/// Runtime descriptor of a declared input or output type.
///
/// Captured once by the generic constructors, so nothing on the execution
/// path needs reflection: comparisons are `TypeId` equality and the snapshot
/// function renders a payload through the type's `Debug` impl.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
    describe: fn(&(dyn Any + Send + Sync)) -> String,
}

impl TypeTag {
    pub fn of<T: fmt::Debug + Send + Sync + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            describe: describe::<T>,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Render a payload of this type for execution records.
    pub fn describe(&self, value: &Payload) -> String {
        (self.describe)(value.as_ref())
    }

    /// Fail with a `TypeMismatch` unless `found` is this type.
    pub(crate) fn require(&self, found: &TypeTag, context: impl FnOnce() -> String) -> Result<()> {
        if self.id == found.id {
            Ok(())
        } else {
            Err(RunnelError::TypeMismatch {
                context: context(),
                expected: self.name.to_string(),
                found: found.name.to_string(),
            })
        }
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn describe<T: fmt::Debug + 'static>(value: &(dyn Any + Send + Sync)) -> String {
    match value.downcast_ref::<T>() {
        Some(v) => format!("{:?}", v),
        None => "<opaque>".to_string(),
    }
}
