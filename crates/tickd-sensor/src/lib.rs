//! New-message detection.
//!
//! The sensor turns sidecar polling into pipeline job requests, exactly once
//! per `(sender uuid, timestamp)` pair, inside the configured schedule
//! window. Idempotence rests on the DB lookup plus the stable run key; the
//! check is deliberately fail-open (duplicates over lost receipts).

pub mod request;
pub mod schedule;
pub mod sensor;

pub use request::{AttachmentTag, JobRequest, RunTags};
pub use sensor::{SignalSensor, TickOutcome};
