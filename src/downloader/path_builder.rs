//! On-disk path construction for a completed task's final container file.
//!
//! Directly grounded on the teacher's `PathBuilder`, remapped to the exact
//! templates and sanitisation character set the external interfaces section
//! specifies rather than flasharr's own collection/season-folder layout.

use crate::model::{Task, TaskKind};
use std::path::{Path, PathBuf};

pub struct PathBuilder;

impl PathBuilder {
    /// Movies: `<moviesPath>/<SanitizedTitle>.<Year>.mp4`
    /// TV: `<tvShowsPath>/<SanitizedTitle>/Season %02d/<SanitizedTitle> - S%02dE%02d[ - <SanitizedEpisode>].mp4`
    pub fn build_output_path(task: &Task, movies_path: &Path, tv_shows_path: &Path) -> PathBuf {
        let title = Self::sanitize(task.title.as_deref().unwrap_or("Unknown"));

        match task.kind {
            TaskKind::Movie => {
                let year_suffix = task.year.map(|y| format!(".{y}")).unwrap_or_default();
                movies_path.join(format!("{title}{year_suffix}.mp4"))
            }
            TaskKind::Tv { season, episode } => {
                let season_folder = format!("Season {season:02}");
                let episode_suffix = task
                    .episode_name
                    .as_deref()
                    .map(|e| format!(" - {}", Self::sanitize(e)))
                    .unwrap_or_default();
                let filename = format!("{title} - S{season:02}E{episode:02}{episode_suffix}.mp4");
                tv_shows_path.join(&title).join(season_folder).join(filename)
            }
        }
    }

    /// Per-task scratch directory: `<tempPath>/<taskId>/`.
    pub fn build_temp_dir(task_id: &str, temp_path: &Path) -> PathBuf {
        temp_path.join(task_id)
    }

    /// Strips `<>:"/\|?*`, collapses whitespace, joins words with `.`.
    pub fn sanitize(name: &str) -> String {
        let stripped: String = name
            .chars()
            .filter(|c| !"<>:\"/\\|?*".contains(*c))
            .collect();
        stripped.split_whitespace().collect::<Vec<_>>().join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;
    use std::path::Path;

    fn base_task(kind: TaskKind) -> Task {
        let mut t = Task::new(kind, "550", vec!["en".to_string()], Quality::Best);
        t.title = Some("Fight Club".to_string());
        t.year = Some(1999);
        t
    }

    #[test]
    fn movie_path_matches_contract() {
        let task = base_task(TaskKind::Movie);
        let path = PathBuilder::build_output_path(&task, Path::new("/downloads/movies"), Path::new("/downloads/tvshows"));
        assert_eq!(path, Path::new("/downloads/movies/Fight.Club.1999.mp4"));
    }

    #[test]
    fn tv_path_matches_contract() {
        let mut task = base_task(TaskKind::Tv { season: 1, episode: 1 });
        task.title = Some("Breaking Bad".to_string());
        task.episode_name = Some("Pilot".to_string());
        let path = PathBuilder::build_output_path(&task, Path::new("/downloads/movies"), Path::new("/downloads/tvshows"));
        assert_eq!(
            path,
            Path::new("/downloads/tvshows/Breaking.Bad/Season 01/Breaking.Bad - S01E01 - Pilot.mp4")
        );
    }

    #[test]
    fn sanitize_strips_reserved_characters_and_joins_with_dots() {
        assert_eq!(PathBuilder::sanitize("Foo: Bar/Baz?"), "Foo.BarBaz");
        assert_eq!(PathBuilder::sanitize("  multiple   spaces "), "multiple.spaces");
    }
}
