//! Per-message pipeline engine.
//!
//! One job per accepted Signal message, driven through a fixed DAG of
//! stages with typed hand-offs. Terminal-state observers deliver the user
//! notification exactly once per run, success or failure.

pub mod context;
pub mod engine;
pub mod notify;
pub mod stage;
pub mod stages;

pub use context::PipelineContext;
pub use engine::{Engine, JobFailure, JobOutcome, JobRunner, JobStatus, ReceiptSummary};
pub use notify::{SignalNotifier, TerminalObserver};
pub use stage::{StageId, StageState, EXECUTION_ORDER, STAGE_GRAPH};
pub use stages::PipelineRunner;
