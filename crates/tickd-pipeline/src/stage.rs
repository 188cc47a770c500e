//! The stage graph as data.
//!
//! The engine consumes this value instead of wiring stages together through
//! hooks; dependencies here are what "no stage runs before its
//! predecessors" means.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    ReconstructMessage,
    PersistMessage,
    Extract,
    Transform,
    PersistReceipt,
    NotifySuccess,
}

impl StageId {
    pub fn name(&self) -> &'static str {
        match self {
            StageId::ReconstructMessage => "reconstruct_message",
            StageId::PersistMessage => "persist_message",
            StageId::Extract => "extract",
            StageId::Transform => "transform",
            StageId::PersistReceipt => "persist_receipt",
            StageId::NotifySuccess => "notify_success",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of the job DAG.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub id: StageId,
    pub deps: &'static [StageId],
}

/// The fixed six-stage graph. `persist_message` and `extract` are
/// data-independent; this implementation serialises them, which the
/// dependency structure permits.
pub const STAGE_GRAPH: [StageSpec; 6] = [
    StageSpec {
        id: StageId::ReconstructMessage,
        deps: &[],
    },
    StageSpec {
        id: StageId::PersistMessage,
        deps: &[StageId::ReconstructMessage],
    },
    StageSpec {
        id: StageId::Extract,
        deps: &[StageId::ReconstructMessage],
    },
    StageSpec {
        id: StageId::Transform,
        deps: &[StageId::Extract, StageId::PersistMessage],
    },
    StageSpec {
        id: StageId::PersistReceipt,
        deps: &[StageId::Transform, StageId::PersistMessage],
    },
    StageSpec {
        id: StageId::NotifySuccess,
        deps: &[StageId::PersistReceipt],
    },
];

/// Topological execution order over [`STAGE_GRAPH`].
pub const EXECUTION_ORDER: [StageId; 6] = [
    StageId::ReconstructMessage,
    StageId::PersistMessage,
    StageId::Extract,
    StageId::Transform,
    StageId::PersistReceipt,
    StageId::NotifySuccess,
];

/// Per-run stage bookkeeping, mostly for logs and the cancellation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}
