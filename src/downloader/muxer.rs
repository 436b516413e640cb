//! Muxer Supervisor: builds the external muxer's argv deterministically,
//! spawns it as a child process, and consumes its stderr through the
//! Progress Parser until it exits or the wall-clock timeout fires.
//!
//! Grounded on the teacher's external-process conventions (the way
//! `hosts/` shells out to host-specific tools) generalised to the fixed
//! ffmpeg-style invocation the external interfaces section specifies.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::downloader::progress_parser::ProgressParser;
use crate::model::{DownloadResult, ProgressUpdate, SubTask, SubTaskKind};
use crate::statemachine::Status;

const MUXER_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const MUXER_KILL_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_BYTES: usize = 128 * 1024;

/// One muxer input track, already downloaded to a temp file.
pub struct MuxInput {
    pub kind: SubTaskKind,
    pub language: Option<String>,
    pub path: PathBuf,
}

impl MuxInput {
    pub fn from_sub_task(sub_task: &SubTask) -> Self {
        Self {
            kind: sub_task.kind(),
            language: sub_task.language().map(|s| s.to_string()),
            path: sub_task.temp_file_path.clone(),
        }
    }
}

/// Builds the deterministic argv: video input first, then every audio
/// input, then every subtitle input, each mapped explicitly by its input
/// index with a codec-copy stream and per-stream language/title metadata.
/// The first audio and first subtitle stream get the default disposition.
pub fn build_muxer_args(inputs: &[MuxInput], output_path: &Path) -> Vec<String> {
    let videos: Vec<&MuxInput> = inputs.iter().filter(|i| i.kind == SubTaskKind::Video).collect();
    let audios: Vec<&MuxInput> = inputs.iter().filter(|i| i.kind == SubTaskKind::Audio).collect();
    let subs: Vec<&MuxInput> = inputs.iter().filter(|i| i.kind == SubTaskKind::Subtitle).collect();

    let ordered: Vec<&MuxInput> = videos.iter().chain(audios.iter()).chain(subs.iter()).copied().collect();

    let mut args: Vec<String> = Vec::new();
    for input in &ordered {
        args.push("-i".to_string());
        args.push(input.path.to_string_lossy().into_owned());
    }

    for (i, _) in videos.iter().enumerate() {
        args.push("-map".to_string());
        args.push(format!("{i}:v:0"));
    }
    for (j, _) in audios.iter().enumerate() {
        args.push("-map".to_string());
        args.push(format!("{}:a:0", videos.len() + j));
    }
    for (k, _) in subs.iter().enumerate() {
        args.push("-map".to_string());
        args.push(format!("{}:s:0", videos.len() + audios.len() + k));
    }

    if !videos.is_empty() {
        args.push("-c:v".to_string());
        args.push("copy".to_string());
    }
    if !audios.is_empty() {
        args.push("-c:a".to_string());
        args.push("copy".to_string());
    }
    if !subs.is_empty() {
        // Stream-copying a text subtitle into an MP4 container fails;
        // `mov_text` is the container-compatible codec ffmpeg expects here.
        args.push("-c:s".to_string());
        args.push("mov_text".to_string());
    }

    for (j, input) in audios.iter().enumerate() {
        if let Some(lang) = &input.language {
            args.push(format!("-metadata:s:a:{j}"));
            args.push(format!("language={lang}"));
            args.push(format!("-metadata:s:a:{j}"));
            args.push(format!("title={lang}"));
        }
        if j == 0 {
            args.push(format!("-disposition:a:{j}"));
            args.push("default".to_string());
        }
    }
    for (k, input) in subs.iter().enumerate() {
        if let Some(lang) = &input.language {
            args.push(format!("-metadata:s:s:{k}"));
            args.push(format!("language={lang}"));
            args.push(format!("-metadata:s:s:{k}"));
            args.push(format!("title={lang}"));
        }
        if k == 0 {
            args.push(format!("-disposition:s:{k}"));
            args.push("default".to_string());
        }
    }

    args.push("-y".to_string());
    args.push(output_path.to_string_lossy().into_owned());
    args
}

/// Spawns the muxer and drives it to completion, reporting progress by
/// parsing its stderr. Returns `SUCCESS` on a zero exit code, `CANCELLED`
/// when `cancel` fires first (the child is killed), and `FAILED` carrying
/// the exit code and the last 128KB of stderr otherwise (including on
/// timeout).
pub async fn run_muxer(
    binary: &str,
    inputs: &[MuxInput],
    output_path: &Path,
    task_id: &str,
    cancel: CancellationToken,
    on_progress: impl Fn(ProgressUpdate) + Send + Sync + 'static,
) -> DownloadResult {
    let args = build_muxer_args(inputs, output_path);
    info!(task_id, binary, args = ?args, "spawning muxer");

    let mut child = match Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return DownloadResult::failed(format!("failed to spawn muxer: {e}")),
    };

    let stderr = child.stderr.take().expect("muxer stderr was piped");
    let mut lines = BufReader::new(stderr).lines();
    let mut parser = ProgressParser::new();
    let mut stderr_tail = String::new();

    let run = async {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return MuxOutcome::Cancelled;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            append_tail(&mut stderr_tail, &line);
                            if let Some(sample) = parser.parse_line(&line) {
                                let mut update = ProgressUpdate::new(task_id, Status::Merging)
                                    .with_bytes(sample.downloaded_bytes, None)
                                    .with_speed(sample.bitrate.clone());
                                if let Some(p) = sample.progress {
                                    update = update.with_progress(p);
                                }
                                on_progress(update);
                            }
                        }
                        Ok(None) => {
                            let status = child.wait().await;
                            return MuxOutcome::Exited(status);
                        }
                        Err(e) => {
                            warn!(task_id, error = %e, "error reading muxer stderr");
                            let status = child.wait().await;
                            return MuxOutcome::Exited(status);
                        }
                    }
                }
            }
        }
    };

    let outcome = match timeout(MUXER_TIMEOUT, run).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(task_id, "muxer exceeded wall-clock timeout, terminating");
            terminate_gracefully(&mut child).await;
            MuxOutcome::TimedOut
        }
    };

    match outcome {
        MuxOutcome::Cancelled => {
            terminate_gracefully(&mut child).await;
            DownloadResult::cancelled()
        }
        MuxOutcome::TimedOut => DownloadResult::failed("muxer exceeded wall-clock timeout").with_cause(tail(&stderr_tail)),
        MuxOutcome::Exited(Ok(status)) if status.success() => DownloadResult::success(),
        MuxOutcome::Exited(Ok(status)) => {
            DownloadResult::failed(format!("muxer exited with status {status}")).with_cause(tail(&stderr_tail))
        }
        MuxOutcome::Exited(Err(e)) => DownloadResult::failed(format!("failed to wait on muxer: {e}")),
    }
}

/// Sends a graceful termination signal and gives the muxer `MUXER_KILL_GRACE`
/// to exit on its own before escalating to a hard kill, per the wall-clock
/// timeout and cancellation contracts ("termination signal, then kill after
/// a short grace period").
async fn terminate_gracefully(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        #[cfg(windows)]
        {
            let _ = pid;
        }
    }

    if timeout(MUXER_KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

enum MuxOutcome {
    Cancelled,
    TimedOut,
    Exited(std::io::Result<std::process::ExitStatus>),
}

fn append_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > STDERR_TAIL_BYTES * 2 {
        let start = tail.len() - STDERR_TAIL_BYTES;
        *tail = tail[start..].to_string();
    }
}

fn tail(stderr_tail: &str) -> String {
    if stderr_tail.len() <= STDERR_TAIL_BYTES {
        stderr_tail.to_string()
    } else {
        stderr_tail[stderr_tail.len() - STDERR_TAIL_BYTES..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: SubTaskKind, language: Option<&str>, path: &str) -> MuxInput {
        MuxInput { kind, language: language.map(|s| s.to_string()), path: PathBuf::from(path) }
    }

    #[test]
    fn argv_orders_video_then_audio_then_subtitles() {
        let inputs = vec![
            input(SubTaskKind::Subtitle, Some("en"), "sub.en.vtt"),
            input(SubTaskKind::Video, None, "video.ts"),
            input(SubTaskKind::Audio, Some("fr"), "audio.fr.ts"),
        ];
        let args = build_muxer_args(&inputs, Path::new("out.mp4"));

        let i_positions: Vec<usize> = args.iter().enumerate().filter(|(_, a)| *a == "-i").map(|(i, _)| i).collect();
        assert_eq!(args[i_positions[0] + 1], "video.ts");
        assert_eq!(args[i_positions[1] + 1], "audio.fr.ts");
        assert_eq!(args[i_positions[2] + 1], "sub.en.vtt");
    }

    #[test]
    fn argv_maps_each_input_by_its_fixed_index() {
        let inputs = vec![
            input(SubTaskKind::Video, None, "video.ts"),
            input(SubTaskKind::Audio, Some("en"), "audio.en.ts"),
            input(SubTaskKind::Subtitle, Some("en"), "sub.en.vtt"),
        ];
        let args = build_muxer_args(&inputs, Path::new("out.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:v:0"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "2:s:0"));
    }

    #[test]
    fn first_audio_and_subtitle_get_default_disposition() {
        let inputs = vec![
            input(SubTaskKind::Video, None, "video.ts"),
            input(SubTaskKind::Audio, Some("en"), "audio.en.ts"),
            input(SubTaskKind::Audio, Some("fr"), "audio.fr.ts"),
            input(SubTaskKind::Subtitle, Some("en"), "sub.en.vtt"),
        ];
        let args = build_muxer_args(&inputs, Path::new("out.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-disposition:a:0" && w[1] == "default"));
        assert!(!args.iter().any(|a| a == "-disposition:a:1"));
        assert!(args.windows(2).any(|w| w[0] == "-disposition:s:0" && w[1] == "default"));
    }

    #[test]
    fn argv_ends_with_overwrite_flag_and_output_path() {
        let inputs = vec![input(SubTaskKind::Video, None, "video.ts")];
        let args = build_muxer_args(&inputs, Path::new("/tmp/out.mp4"));
        assert_eq!(args[args.len() - 2], "-y");
        assert_eq!(args[args.len() - 1], "/tmp/out.mp4");
    }

    #[test]
    fn codec_copy_is_used_for_video_and_audio() {
        let inputs = vec![
            input(SubTaskKind::Video, None, "video.ts"),
            input(SubTaskKind::Audio, Some("en"), "audio.en.ts"),
        ];
        let args = build_muxer_args(&inputs, Path::new("out.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "copy"));
    }

    #[test]
    fn subtitles_use_a_container_compatible_codec_not_stream_copy() {
        let inputs = vec![
            input(SubTaskKind::Video, None, "video.ts"),
            input(SubTaskKind::Subtitle, Some("en"), "sub.en.vtt"),
        ];
        let args = build_muxer_args(&inputs, Path::new("out.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-c:s" && w[1] == "mov_text"));
        assert!(!args.iter().any(|a| a == "-c"));
    }
}
