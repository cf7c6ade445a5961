pub mod advancer;
pub mod combinational;
pub mod orchestration;
pub mod orchestrator;
pub mod process;
pub mod properties;
pub mod record;
pub mod run_log;
pub mod runnable;
pub mod value;

pub use advancer::{Advancer, AdvancerKind};
pub use combinational::{CombinationalWaiter, Combined};
pub use orchestration::{Orchestration, OrchestrationBuilder};
pub use orchestrator::{Orchestrator, RunReport};
pub use process::{BatchInvocation, Invocation, Process, UsageMeter};
pub use properties::RunProperties;
pub use record::ExecutionTrace;
pub use run_log::RunLogger;
pub use runnable::{Runnable, RunnableRef};
pub use value::{payload, Payload, TypeTag};
