//! Download engine: per-track segment fetching, muxer invocation, and
//! multi-track orchestration that ties both together under one Task.

pub mod muxer;
pub mod path_builder;
pub mod progress_math;
pub mod progress_parser;
pub mod segment;
pub mod track_orchestrator;

pub use path_builder::PathBuilder;
pub use track_orchestrator::run_task;

use crate::statemachine::Status;

/// The numeric facts behind one emitted `ProgressUpdate`, passed alongside
/// it so a caller holding the owning `Task`/`SubTask` record can update its
/// typed fields (`downloadSpeed` as bytes/s, not the wire envelope's
/// human-readable string) without re-deriving them.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    pub status: Status,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub progress: Option<f64>,
    pub speed_bps: Option<f64>,
    pub eta_seconds: Option<f64>,
}
