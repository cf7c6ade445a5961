use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one orchestration run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one in-flight process.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The active process set became empty.
    Completed,
    /// Cancellation was requested and observed at a tick boundary.
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One edge taken out of an invocation: `from -> to` carrying `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    /// Debug snapshot of the value handed to `to`.
    pub output: String,
}

/// Immutable trace entry describing one process invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Monotonic step counter within the run (1-based).
    pub step: u64,
    /// Tick in which the invocation happened.
    pub tick: u64,
    pub process_id: ProcessId,
    pub runnable: String,
    /// Usage units reported by the work function during this invocation.
    pub usage: u64,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Debug snapshot of the input.
    pub input: String,
    /// Debug snapshot of the result, `None` when the invocation failed.
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transitions: Vec<Transition>,
}

/// A branch that disappeared after exhausting its reruns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedBranch {
    pub process_id: ProcessId,
    pub runnable: String,
    pub attempts: u32,
    /// Whether the last attempt failed rather than matching no advancer.
    pub errored: bool,
    /// Usage units reported over every attempt.
    pub usage: u64,
}

/// Contributions still held by a join when its run completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrandedJoin {
    pub runnable: String,
    /// Number of buffered inputs that never reached the required count.
    pub buffered: usize,
}

/// Lifecycle events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// Run started at the entry runnable.
    RunStarted { run_id: RunId, entry: String },
    /// A tick is about to invoke the listed runnables.
    TickStarted {
        run_id: RunId,
        tick: u64,
        active: Vec<String>,
    },
    /// A tick finished; `next_active` will run in the following tick.
    TickCompleted {
        run_id: RunId,
        tick: u64,
        invocations: usize,
        next_active: Vec<String>,
    },
    /// A work function failed for one process.
    InvocationFailed {
        run_id: RunId,
        process_id: ProcessId,
        runnable: String,
        error: String,
    },
    /// A branch terminated at a dead-end runnable.
    BranchEnded {
        run_id: RunId,
        process_id: ProcessId,
        runnable: String,
    },
    /// A branch was abandoned after exhausting its reruns.
    BranchDropped { run_id: RunId, branch: DroppedBranch },
    /// A join was left below its required count when the run completed.
    JoinStranded { run_id: RunId, join: StrandedJoin },
    /// One execution record was appended (recording enabled only).
    StepRecorded { run_id: RunId, record: ExecutionRecord },
    /// Run completed.
    RunComplete {
        run_id: RunId,
        ticks: u64,
        invocations: u64,
        usage: u64,
    },
    /// Run cancelled; `exited` lists runnables cleaned up while still active.
    RunCancelled {
        run_id: RunId,
        ticks: u64,
        exited: Vec<String>,
    },
    /// Run failed.
    RunError { run_id: RunId, error: String },
}

impl OrchestrationEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::TickStarted { run_id, .. }
            | Self::TickCompleted { run_id, .. }
            | Self::InvocationFailed { run_id, .. }
            | Self::BranchEnded { run_id, .. }
            | Self::BranchDropped { run_id, .. }
            | Self::JoinStranded { run_id, .. }
            | Self::StepRecorded { run_id, .. }
            | Self::RunComplete { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::RunError { run_id, .. } => run_id,
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunComplete { .. } | Self::RunCancelled { .. } | Self::RunError { .. }
        )
    }
}
