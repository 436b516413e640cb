use crate::model::SubTask;
use crate::statemachine::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Best,
    Height(u32),
}

impl Quality {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("best") {
            Quality::Best
        } else {
            raw.parse::<u32>().map(Quality::Height).unwrap_or(Quality::Best)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum TaskKind {
    Movie,
    Tv { season: u32, episode: u32 },
}

/// A single user-level download request. Mutated only by the scheduler
/// worker that owns it (single-writer discipline); `sub_tasks` is
/// append-only during resolution and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub catalogue_id: String,
    /// Ordered preference list, e.g. `["en", "ja"]`.
    pub languages: Vec<String>,
    pub quality: Quality,

    pub title: Option<String>,
    pub year: Option<i32>,
    pub episode_name: Option<String>,

    pub output_path: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,

    pub status: Status,
    /// Byte-weighted average of sub_tasks' progress; see progress_math.
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub download_speed: f64,
    pub eta_seconds: Option<f64>,
    pub error_message: Option<String>,

    /// Requested audio languages the Resolver reported unavailable (§8
    /// scenario 2: `result.metadata.missingLanguages`).
    #[serde(default)]
    pub missing_languages: Vec<String>,
    /// Subtitle languages unavailable either at resolution time or because
    /// the sub-task's download ultimately failed (§8 scenario 3:
    /// `result.metadata.missingSubtitles`).
    #[serde(default)]
    pub missing_subtitles: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Insertion order = display order.
    pub sub_tasks: Vec<SubTask>,
}

impl Task {
    pub fn new(kind: TaskKind, catalogue_id: impl Into<String>, languages: Vec<String>, quality: Quality) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            catalogue_id: catalogue_id.into(),
            languages,
            quality,
            title: None,
            year: None,
            episode_name: None,
            output_path: None,
            temp_dir: None,
            status: Status::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            download_speed: 0.0,
            eta_seconds: None,
            error_message: None,
            missing_languages: Vec::new(),
            missing_subtitles: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            sub_tasks: Vec::new(),
        }
    }

    /// Task is terminal iff every sub-task is terminal or the task was
    /// cancelled outright (e.g. before any sub-task was spawned).
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
            && (self.status == Status::Cancelled || self.sub_tasks.iter().all(|s| s.is_terminal()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_with_no_missing_languages_or_subtitles() {
        let task = Task::new(TaskKind::Movie, "550", vec!["en".to_string()], Quality::Best);
        assert!(task.missing_languages.is_empty());
        assert!(task.missing_subtitles.is_empty());
    }
}
