//! Track Orchestrator: runs a single Task end to end after resolution —
//! spawns one Segment Downloader per SubTask, applies the aggregation
//! policy across track kinds, invokes the Muxer Supervisor, and performs
//! the atomic rename into the final output path.
//!
//! Grounded on the teacher's `orchestrator.rs` task-lifecycle shape
//! (per-task scoped temp dir, spawn-then-join-all, cleanup-on-every-exit),
//! generalised to this spec's VIDEO/AUDIO/SUBTITLE aggregation rules.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::ProgressBus;
use crate::config::Config;
use crate::downloader::muxer::{run_muxer, MuxInput};
use crate::downloader::path_builder::PathBuilder;
use crate::downloader::progress_math::{aggregate_progress, eta_seconds, format_speed, speed_bytes_per_sec, WeightedProgress};
use crate::downloader::segment::{self, SegmentRef};
use crate::downloader::ProgressSample;
use crate::fetch::RetryableFetcher;
use crate::model::{DownloadResult, ProgressUpdate, ResultStatus, SubTask, SubTaskKind, Task};
use crate::statemachine::{transition, Status};

const MUXER_BINARY: &str = "ffmpeg";

/// Runs `task` to completion, mutating its status/progress fields in place
/// and publishing every intermediate `ProgressUpdate` onto `bus`. `task` is
/// shared with the Scheduler's task index so `get`/`list` observe live
/// progress while this runs, not only the terminal snapshot.
pub async fn run_task(
    task_arc: Arc<Mutex<Task>>,
    fetcher: Arc<RetryableFetcher>,
    config: &Config,
    bus: ProgressBus,
    cancel: CancellationToken,
) -> DownloadResult {
    let (task_id, temp_dir, sub_tasks) = {
        let mut task = task_arc.lock().await;
        let temp_dir = PathBuilder::build_temp_dir(&task.id, &config.download.temp_path);
        task.temp_dir = Some(temp_dir.clone());
        (task.id.clone(), temp_dir, task.sub_tasks.clone())
    };

    if let Err(e) = tokio::fs::create_dir_all(&temp_dir).await {
        let mut task = task_arc.lock().await;
        task.status = transition(task.status, Status::Failed);
        task.error_message = Some(format!("failed to create temp directory: {e}"));
        return DownloadResult::failed(format!("failed to create temp directory: {e}"));
    }

    let downloading_status = {
        let mut task = task_arc.lock().await;
        task.status = transition(task.status, Status::Downloading);
        task.status
    };
    bus.publish(ProgressUpdate::new(task_id.clone(), downloading_status)).await;

    let mut handles = Vec::with_capacity(sub_tasks.len());
    for sub_task in &sub_tasks {
        let fetcher = fetcher.clone();
        let bus = bus.clone();
        let cancel = cancel.clone();
        let concurrency = config.download.segment_concurrency;
        let sub_task = sub_task.clone();
        let task_arc = task_arc.clone();
        handles.push(tokio::spawn(async move {
            let result = download_one_track(fetcher, &sub_task, concurrency, cancel, bus, task_arc).await;
            (sub_task, result)
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        match h.await {
            Ok((sub_task, result)) => results.push((sub_task, result)),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "sub-task join failed");
            }
        }
    }

    {
        let mut task = task_arc.lock().await;
        for (sub_task, result) in &results {
            if let Some(existing) = task.sub_tasks.iter_mut().find(|s| s.id == sub_task.id) {
                existing.status = status_for_result(result);
                if let Some(msg) = &result.message {
                    existing.error_message = Some(msg.clone());
                }
            }
        }
    }

    let outcome = aggregate(&results);
    let final_result = match outcome {
        AggregateOutcome::Fail(msg) => {
            let mut task = task_arc.lock().await;
            task.status = transition(task.status, Status::Failed);
            task.error_message = Some(msg.clone());
            drop(task);
            cleanup_temp_dir(&temp_dir).await;
            DownloadResult::failed(msg)
        }
        AggregateOutcome::Cancelled => {
            let mut task = task_arc.lock().await;
            task.status = transition(task.status, Status::Cancelled);
            drop(task);
            cleanup_temp_dir(&temp_dir).await;
            DownloadResult::cancelled()
        }
        AggregateOutcome::Proceed { failed_subtitle_languages } => {
            let merging_status = {
                let mut task = task_arc.lock().await;
                task.status = transition(task.status, Status::Merging);
                task.status
            };
            bus.publish(ProgressUpdate::new(task_id.clone(), merging_status)).await;

            let inputs: Vec<MuxInput> = results
                .iter()
                .filter(|(_, r)| r.is_success())
                .map(|(s, _)| MuxInput::from_sub_task(s))
                .collect();

            let output_path = {
                let task = task_arc.lock().await;
                PathBuilder::build_output_path(&task, &config.download.movies_path, &config.download.tv_shows_path)
            };
            if let Some(parent) = output_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    cleanup_temp_dir(&temp_dir).await;
                    let mut task = task_arc.lock().await;
                    task.status = transition(task.status, Status::Failed);
                    task.error_message = Some(format!("failed to create output directory: {e}"));
                    return DownloadResult::failed(format!("failed to create output directory: {e}"));
                }
            }

            let mux_output_tmp = temp_dir.join("muxed.mp4");
            let bus_for_progress = bus.clone();
            let mux_result = run_muxer(MUXER_BINARY, &inputs, &mux_output_tmp, &task_id, cancel.clone(), move |update| {
                let bus = bus_for_progress.clone();
                tokio::spawn(async move {
                    bus.publish(update).await;
                });
            })
            .await;

            match mux_result.status {
                ResultStatus::Success => match tokio::fs::rename(&mux_output_tmp, &output_path).await {
                    Ok(()) => {
                        let mut task = task_arc.lock().await;
                        task.output_path = Some(output_path);
                        task.status = transition(task.status, Status::Completed);
                        task.progress = 100.0;
                        for lang in &failed_subtitle_languages {
                            if !task.missing_subtitles.iter().any(|l| l == lang) {
                                task.missing_subtitles.push(lang.clone());
                            }
                        }
                        let missing_subtitles = task.missing_subtitles.clone();
                        drop(task);
                        cleanup_temp_dir(&temp_dir).await;
                        let mut result = DownloadResult::success();
                        if !missing_subtitles.is_empty() {
                            result = result.with_metadata("missingSubtitles", missing_subtitles.join(","));
                        }
                        result
                    }
                    Err(e) => {
                        let mut task = task_arc.lock().await;
                        task.status = transition(task.status, Status::Failed);
                        task.error_message = Some(format!("failed to move muxed output into place: {e}"));
                        drop(task);
                        cleanup_temp_dir(&temp_dir).await;
                        DownloadResult::failed(format!("failed to move muxed output into place: {e}"))
                    }
                },
                ResultStatus::Cancelled => {
                    let mut task = task_arc.lock().await;
                    task.status = transition(task.status, Status::Cancelled);
                    drop(task);
                    cleanup_temp_dir(&temp_dir).await;
                    DownloadResult::cancelled()
                }
                _ => {
                    let msg = mux_result.message.clone().unwrap_or_else(|| "muxer failed".to_string());
                    let mut task = task_arc.lock().await;
                    task.status = transition(task.status, Status::Failed);
                    task.error_message = Some(msg.clone());
                    drop(task);
                    cleanup_temp_dir(&temp_dir).await;
                    DownloadResult::failed(msg)
                }
            }
        }
    };

    let final_update = {
        let mut task = task_arc.lock().await;
        task.completed_at = Some(chrono::Utc::now());
        let mut update = ProgressUpdate::new(task.id.clone(), task.status).with_progress(task.progress);
        if let Some(msg) = &task.error_message {
            update = update.with_error(msg.clone());
        }
        update
    };
    bus.publish(final_update).await;

    final_result
}

enum AggregateOutcome {
    /// `failed_subtitle_languages` carries the language codes of subtitle
    /// sub-tasks whose download ultimately failed (resolution-time
    /// `NOT_FOUND` subtitles never become sub-tasks at all, so they are not
    /// represented here — they are recorded directly on the Task by the
    /// resolver instead).
    Proceed { failed_subtitle_languages: Vec<String> },
    Fail(String),
    Cancelled,
}

fn aggregate(results: &[(SubTask, DownloadResult)]) -> AggregateOutcome {
    if results.iter().any(|(_, r)| r.status == ResultStatus::Cancelled) {
        return AggregateOutcome::Cancelled;
    }

    let video_failed = results
        .iter()
        .any(|(s, r)| s.kind() == SubTaskKind::Video && !r.is_success());
    if video_failed {
        return AggregateOutcome::Fail("video track failed to download".to_string());
    }

    let audio_results: Vec<&(SubTask, DownloadResult)> =
        results.iter().filter(|(s, _)| s.kind() == SubTaskKind::Audio).collect();
    let any_audio_requested = !audio_results.is_empty();
    let any_audio_succeeded = audio_results.iter().any(|(_, r)| r.is_success());
    if any_audio_requested && !any_audio_succeeded {
        return AggregateOutcome::Fail("no audio track available".to_string());
    }

    let subtitle_results: Vec<&(SubTask, DownloadResult)> =
        results.iter().filter(|(s, _)| s.kind() == SubTaskKind::Subtitle).collect();
    let failed_subtitle_languages: Vec<String> = subtitle_results
        .iter()
        .filter(|(_, r)| !r.is_success())
        .filter_map(|(s, _)| s.language().map(|l| l.to_string()))
        .collect();

    AggregateOutcome::Proceed { failed_subtitle_languages }
}

fn status_for_result(result: &DownloadResult) -> Status {
    match result.status {
        ResultStatus::Success | ResultStatus::Partial => Status::Completed,
        ResultStatus::Failed => Status::Failed,
        ResultStatus::NotFound => Status::NotFound,
        ResultStatus::Cancelled => Status::Cancelled,
    }
}

async fn download_one_track(
    fetcher: Arc<RetryableFetcher>,
    sub_task: &SubTask,
    concurrency: usize,
    cancel: CancellationToken,
    bus: ProgressBus,
    task_arc: Arc<Mutex<Task>>,
) -> DownloadResult {
    let segments: Vec<SegmentRef> = match segment::parse_segment_list(&fetcher, &sub_task.playlist_url, &cancel).await {
        Ok(segments) => segments,
        Err(result) => return result,
    };
    let segments = segment::probe_segment_sizes(&fetcher, segments, concurrency, &cancel).await;

    let task_id = sub_task.task_id.clone();
    let sub_task_id = sub_task.id.clone();
    let temp_path = sub_task.temp_file_path.clone();

    segment::download_track(
        fetcher,
        task_id,
        sub_task_id.clone(),
        segments,
        &temp_path,
        concurrency,
        cancel,
        move |update, sample| {
            let bus = bus.clone();
            let task_arc = task_arc.clone();
            let sub_task_id = sub_task_id.clone();
            tokio::spawn(async move {
                bus.publish(update).await;
                if let Some(aggregate_update) = apply_subtask_sample(&task_arc, &sub_task_id, sample).await {
                    bus.publish(aggregate_update).await;
                }
            });
        },
    )
    .await
}

/// Folds one sub-task's `ProgressSample` into the shared `Task`: updates the
/// matching `SubTask`'s typed fields (unless it has already gone terminal —
/// terminal sub-task fields are frozen per the data model invariant) and
/// recomputes the task-level byte-weighted aggregate. Returns the resulting
/// task-level `ProgressUpdate` (`subTaskId: None`) to publish, or `None` if
/// the task itself is already terminal.
async fn apply_subtask_sample(
    task_arc: &Arc<Mutex<Task>>,
    sub_task_id: &str,
    sample: ProgressSample,
) -> Option<ProgressUpdate> {
    let mut task = task_arc.lock().await;
    if task.status.is_terminal() {
        return None;
    }

    if let Some(sub) = task.sub_tasks.iter_mut().find(|s| s.id == sub_task_id) {
        if !sub.is_terminal() {
            sub.status = sample.status;
            if let Some(p) = sample.progress {
                sub.progress = p;
            }
            if let Some(b) = sample.downloaded_bytes {
                sub.downloaded_bytes = b;
            }
            if sample.total_bytes.is_some() {
                sub.total_bytes = sample.total_bytes;
            }
            if let Some(speed) = sample.speed_bps {
                sub.download_speed = speed;
            }
            sub.eta_seconds = sample.eta_seconds;
        }
    }

    let parts: Vec<WeightedProgress> = task
        .sub_tasks
        .iter()
        .map(|s| WeightedProgress {
            progress: s.progress,
            weight: s.total_bytes,
        })
        .collect();
    task.progress = aggregate_progress(&parts);

    task.downloaded_bytes = task.sub_tasks.iter().map(|s| s.downloaded_bytes).sum();
    task.total_bytes = if task.sub_tasks.iter().all(|s| s.total_bytes.is_some()) {
        Some(task.sub_tasks.iter().filter_map(|s| s.total_bytes).sum())
    } else {
        None
    };
    task.download_speed = speed_bytes_per_sec(
        task.downloaded_bytes,
        task.started_at.map(|t| (chrono::Utc::now() - t).num_milliseconds() as f64 / 1000.0).unwrap_or(1.0),
    );
    task.eta_seconds = eta_seconds(task.downloaded_bytes, task.total_bytes, task.download_speed);

    let mut update = ProgressUpdate::new(task.id.clone(), task.status)
        .with_progress(task.progress)
        .with_bytes(task.downloaded_bytes, task.total_bytes)
        .with_speed(format_speed(task.download_speed));
    if let Some(eta) = task.eta_seconds {
        update = update.with_eta(eta);
    }
    Some(update)
}

async fn cleanup_temp_dir(temp_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(temp_dir).await {
        warn!(dir = %temp_dir.display(), error = %e, "failed to remove scratch directory");
    } else {
        info!(dir = %temp_dir.display(), "scratch directory removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubTaskVariant, TaskKind};
    use std::path::PathBuf;

    fn sub_task(kind: SubTaskKind) -> SubTask {
        let variant = match kind {
            SubTaskKind::Video => SubTaskVariant::Video { resolution: None, bitrate: None },
            SubTaskKind::Audio => SubTaskVariant::Audio { language: "en".to_string() },
            SubTaskKind::Subtitle => SubTaskVariant::Subtitle { language: "en".to_string() },
        };
        SubTask::new("task-1", variant, None, "http://example.com/x.m3u8", &PathBuf::from("/tmp"))
    }

    #[test]
    fn video_failure_fails_the_task() {
        let results = vec![
            (sub_task(SubTaskKind::Video), DownloadResult::failed("boom")),
            (sub_task(SubTaskKind::Audio), DownloadResult::success()),
        ];
        assert!(matches!(aggregate(&results), AggregateOutcome::Fail(_)));
    }

    #[test]
    fn all_subtitles_failing_is_a_success_with_the_missing_language_list() {
        let results = vec![
            (sub_task(SubTaskKind::Video), DownloadResult::success()),
            (sub_task(SubTaskKind::Audio), DownloadResult::success()),
            (sub_task(SubTaskKind::Subtitle), DownloadResult::failed("404")),
        ];
        match aggregate(&results) {
            AggregateOutcome::Proceed { failed_subtitle_languages } => {
                assert_eq!(failed_subtitle_languages, vec!["en".to_string()]);
            }
            _ => panic!("expected Proceed"),
        }
    }

    #[test]
    fn no_audio_succeeding_fails_the_task() {
        let results = vec![
            (sub_task(SubTaskKind::Video), DownloadResult::success()),
            (sub_task(SubTaskKind::Audio), DownloadResult::not_found("missing")),
        ];
        match aggregate(&results) {
            AggregateOutcome::Fail(msg) => assert_eq!(msg, "no audio track available"),
            _ => panic!("expected Fail"),
        }
    }

    #[test]
    fn partial_audio_success_proceeds() {
        let results = vec![
            (sub_task(SubTaskKind::Video), DownloadResult::success()),
            (sub_task(SubTaskKind::Audio), DownloadResult::success()),
            (sub_task(SubTaskKind::Audio), DownloadResult::not_found("ja missing")),
        ];
        match aggregate(&results) {
            AggregateOutcome::Proceed { failed_subtitle_languages } => assert!(failed_subtitle_languages.is_empty()),
            _ => panic!("expected Proceed"),
        }
    }

    #[test]
    fn any_cancelled_sub_task_cancels_the_task() {
        let results = vec![
            (sub_task(SubTaskKind::Video), DownloadResult::cancelled()),
            (sub_task(SubTaskKind::Audio), DownloadResult::success()),
        ];
        assert!(matches!(aggregate(&results), AggregateOutcome::Cancelled));
    }

    #[test]
    fn task_kind_exists_for_context() {
        let _ = TaskKind::Movie;
    }

    #[tokio::test]
    async fn applying_a_sample_recomputes_the_byte_weighted_task_aggregate() {
        let mut task = Task::new(TaskKind::Movie, "550", vec!["en".to_string()], crate::model::Quality::Best);
        let video = sub_task(SubTaskKind::Video);
        let audio = sub_task(SubTaskKind::Audio);
        let video_id = video.id.clone();
        let audio_id = audio.id.clone();
        task.sub_tasks.push(video);
        task.sub_tasks.push(audio);
        task.started_at = Some(chrono::Utc::now());
        let task_arc = Arc::new(Mutex::new(task));

        // video: 900 bytes total, fully downloaded
        apply_subtask_sample(
            &task_arc,
            &video_id,
            ProgressSample {
                status: Status::Downloading,
                downloaded_bytes: Some(900),
                total_bytes: Some(900),
                progress: Some(100.0),
                speed_bps: Some(900.0),
                eta_seconds: None,
            },
        )
        .await;
        // audio: 100 bytes total, untouched so far
        let update = apply_subtask_sample(
            &task_arc,
            &audio_id,
            ProgressSample {
                status: Status::Downloading,
                downloaded_bytes: Some(0),
                total_bytes: Some(100),
                progress: Some(0.0),
                speed_bps: Some(0.0),
                eta_seconds: None,
            },
        )
        .await
        .expect("task is not terminal");

        // video (900B) at 100%, audio (100B) at 0% -> 90% weighted
        assert!((update.progress.unwrap() - 90.0).abs() < 0.01);
        assert_eq!(update.downloaded_bytes, Some(900));
        assert_eq!(update.total_bytes, Some(1000));
        assert!(update.sub_task_id.is_none());
    }

    #[tokio::test]
    async fn a_terminal_task_ignores_further_samples() {
        let mut task = Task::new(TaskKind::Movie, "550", vec!["en".to_string()], crate::model::Quality::Best);
        let video = sub_task(SubTaskKind::Video);
        let video_id = video.id.clone();
        task.sub_tasks.push(video);
        task.status = Status::Completed;
        let task_arc = Arc::new(Mutex::new(task));

        let update = apply_subtask_sample(
            &task_arc,
            &video_id,
            ProgressSample {
                status: Status::Downloading,
                downloaded_bytes: Some(1),
                total_bytes: Some(100),
                progress: Some(1.0),
                speed_bps: Some(1.0),
                eta_seconds: None,
            },
        )
        .await;
        assert!(update.is_none());
    }
}
