//! Domain error taxonomy.
//!
//! Components return `DownloadResult` at their boundaries (see
//! `model::progress`) and never propagate `EngineError` upward through the
//! download pipeline; this type is reserved for the public API, startup
//! configuration loading, and illegal state-machine transitions.

use crate::statemachine::IllegalTransition;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("playlist extraction failed for {catalogue_id:?} ({embed_url}): {message}")]
    PlaylistExtraction {
        embed_url: String,
        catalogue_id: Option<String>,
        message: String,
    },

    #[error("track download failed: {kind} {language:?} ({playlist_url}): {message}")]
    TrackDownload {
        kind: String,
        language: Option<String>,
        playlist_url: String,
        message: String,
    },

    #[error("merge failed: exit code {exit_code:?} merging {inputs:?} into {output}")]
    Merge {
        inputs: Vec<String>,
        output: String,
        exit_code: Option<i32>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal state transition: {0}")]
    IllegalTransition(#[from] IllegalTransition),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            EngineError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            EngineError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
            EngineError::PlaylistExtraction { .. } => {
                (StatusCode::BAD_GATEWAY, "PLAYLIST_EXTRACTION_ERROR")
            }
            EngineError::TrackDownload { .. } => {
                (StatusCode::BAD_GATEWAY, "TRACK_DOWNLOAD_ERROR")
            }
            EngineError::Merge { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "MERGE_ERROR"),
            EngineError::Cancelled => (StatusCode::CONFLICT, "CANCELLED"),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            EngineError::IllegalTransition(_) => (StatusCode::CONFLICT, "ILLEGAL_TRANSITION"),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
