//! Download Queue / Scheduler: accepts tasks, enforces the global
//! `parallelDownloads` limit via a semaphore, drives each task from
//! `QUEUED` through resolution and download to a terminal status, and
//! keeps the in-memory `taskId → Task` index the public API reads from.
//!
//! Grounded on the teacher's `manager.rs` dispatcher-loop shape (bounded
//! worker pool pulling off a queue, per-task cancellation token registry),
//! generalised to this spec's Resolver → Track Orchestrator hand-off.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::ProgressBus;
use crate::config::Config;
use crate::downloader::path_builder::PathBuilder;
use crate::downloader::track_orchestrator;
use crate::error::EngineError;
use crate::fetch::RetryableFetcher;
use crate::model::{ProgressUpdate, Quality, SubTask, SubTaskVariant, Task, TaskKind};
use crate::resolver::catalogue::CatalogueClient;
use crate::resolver::{PlaylistResolver, ResolveOutcome};
use crate::statemachine::{transition, Status};

/// A new-task request from the public API, before `Task::new` assigns an id.
pub struct EnqueueRequest {
    pub kind: TaskKind,
    pub catalogue_id: String,
    pub languages: Vec<String>,
    pub quality: Quality,
}

struct TaskEntry {
    /// Shared with the in-flight `track_orchestrator::run_task` call (if
    /// any) so `get`/`list` observe live progress, not only the snapshot
    /// taken when the task was handed off to its worker.
    task: Arc<Mutex<Task>>,
    cancel: CancellationToken,
}

struct SchedulerInner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    queue_tx: mpsc::UnboundedSender<String>,
    semaphore: Arc<Semaphore>,
    config: Config,
    fetcher: Arc<RetryableFetcher>,
    resolver: Arc<PlaylistResolver>,
    catalogue: Arc<dyn CatalogueClient>,
    bus: ProgressBus,
    shutdown: CancellationToken,
}

/// Cloneable handle to the scheduler; the dispatcher loop and the public API
/// both hold one.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        fetcher: Arc<RetryableFetcher>,
        resolver: Arc<PlaylistResolver>,
        catalogue: Arc<dyn CatalogueClient>,
        bus: ProgressBus,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.download.parallel_downloads));
        let inner = Arc::new(SchedulerInner {
            tasks: Mutex::new(HashMap::new()),
            queue_tx,
            semaphore,
            config,
            fetcher,
            resolver,
            catalogue,
            bus,
            shutdown: CancellationToken::new(),
        });
        let scheduler = Self { inner };
        scheduler.spawn_dispatcher(queue_rx);
        scheduler
    }

    fn spawn_dispatcher(&self, mut queue_rx: mpsc::UnboundedReceiver<String>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = scheduler.inner.shutdown.cancelled() => {
                        info!("scheduler dispatcher shutting down");
                        return;
                    }
                    next = queue_rx.recv() => {
                        let Some(task_id) = next else { return };
                        let scheduler = scheduler.clone();
                        let permit = scheduler.inner.semaphore.clone().acquire_owned().await;
                        let Ok(permit) = permit else { return };
                        tokio::spawn(async move {
                            let _permit = permit;
                            scheduler.run(task_id).await;
                        });
                    }
                }
            }
        });
    }

    /// Creates the task, stores it `QUEUED`, and schedules it for dispatch.
    /// Returns immediately with the assigned id.
    pub async fn enqueue(&self, request: EnqueueRequest) -> String {
        let task = Task::new(request.kind, request.catalogue_id, request.languages, request.quality);
        let task_id = task.id.clone();
        let cancel = self.inner.shutdown.child_token();
        let task = Arc::new(Mutex::new(task));

        self.inner
            .tasks
            .lock()
            .await
            .insert(task_id.clone(), TaskEntry { task, cancel });

        let _ = self.inner.queue_tx.send(task_id.clone());
        task_id
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.inner.bus
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let task_arc = self.inner.tasks.lock().await.get(task_id).map(|e| e.task.clone())?;
        Some(task_arc.lock().await.clone())
    }

    pub async fn list(&self) -> Vec<Task> {
        let arcs: Vec<Arc<Mutex<Task>>> = self.inner.tasks.lock().await.values().map(|e| e.task.clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            out.push(arc.lock().await.clone());
        }
        out
    }

    /// Transitions the task toward `CANCELLED` if legal and fires its
    /// cancellation token; downstream stages observe it cooperatively.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let entry = {
            let tasks = self.inner.tasks.lock().await;
            tasks.get(task_id).map(|e| (e.task.clone(), e.cancel.clone()))
        };
        let Some((task_arc, cancel)) = entry else { return false };
        let mut task = task_arc.lock().await;
        if task.status.is_terminal() {
            return false;
        }
        task.status = transition(task.status, Status::Cancelled);
        cancel.cancel();
        task.status == Status::Cancelled
    }

    /// Cancels every in-flight task and stops the dispatcher from picking up
    /// new ones. Does not wait for in-flight tasks to finish cleaning up.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let entries: Vec<(Arc<Mutex<Task>>, CancellationToken)> = {
            let tasks = self.inner.tasks.lock().await;
            tasks.values().map(|e| (e.task.clone(), e.cancel.clone())).collect()
        };
        for (task_arc, cancel) in entries {
            if !task_arc.lock().await.status.is_terminal() {
                cancel.cancel();
            }
        }
    }

    async fn run(&self, task_id: String) {
        let entry = {
            let tasks = self.inner.tasks.lock().await;
            tasks.get(&task_id).map(|e| (e.task.clone(), e.cancel.clone()))
        };
        let Some((task_arc, cancel)) = entry else { return };
        if task_arc.lock().await.status.is_terminal() {
            return;
        }

        if let Err(e) = self.resolve_and_populate(&task_id, &task_arc, &cancel).await {
            error!(task_id, error = %e, "resolution failed");
            return;
        }

        if task_arc.lock().await.status.is_terminal() {
            return;
        }

        let result =
            track_orchestrator::run_task(task_arc.clone(), self.inner.fetcher.clone(), &self.inner.config, self.inner.bus.clone(), cancel)
                .await;

        // `run_task` already mutates the shared `task_arc` directly, but the
        // metadata on its returned `DownloadResult` is the authoritative
        // record of what the orchestrator observed — fold it back onto the
        // task rather than letting it evaporate with the return value.
        if let Some(missing) = result.metadata.get("missingSubtitles") {
            let mut task = task_arc.lock().await;
            for lang in missing.split(',').filter(|s| !s.is_empty()) {
                if !task.missing_subtitles.iter().any(|l| l == lang) {
                    task.missing_subtitles.push(lang.to_string());
                }
            }
        }
    }

    async fn resolve_and_populate(
        &self,
        task_id: &str,
        task_arc: &Arc<Mutex<Task>>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (catalogue_id, kind, languages, quality) = {
            let mut task = task_arc.lock().await;
            task.status = transition(task.status, Status::Extracting);
            (task.catalogue_id.clone(), task.kind.clone(), task.languages.clone(), task.quality)
        };
        self.inner
            .bus
            .publish(ProgressUpdate::new(task_id.to_string(), Status::Extracting))
            .await;

        let catalogue_info = self.inner.catalogue.title_info(&catalogue_id, &kind).await;
        let outcome = self
            .inner
            .resolver
            .resolve(&catalogue_id, &kind, &languages, quality, cancel)
            .await?;

        let mut task = task_arc.lock().await;

        task.title = catalogue_info.title.or_else(|| Some(catalogue_id.clone()));
        task.year = catalogue_info.year;
        task.episode_name = catalogue_info.episode_name;

        match outcome {
            ResolveOutcome::NotFound => {
                task.status = transition(task.status, Status::NotFound);
                Ok(())
            }
            ResolveOutcome::Found { descriptors, missing } => {
                let temp_dir = PathBuilder::build_temp_dir(task_id, &self.inner.config.download.temp_path);
                for descriptor in descriptors {
                    let variant = match descriptor.kind {
                        crate::model::SubTaskKind::Video => SubTaskVariant::Video {
                            resolution: descriptor.resolution.clone(),
                            bitrate: descriptor.bitrate,
                        },
                        crate::model::SubTaskKind::Audio => SubTaskVariant::Audio {
                            language: descriptor.language.clone().unwrap_or_default(),
                        },
                        crate::model::SubTaskKind::Subtitle => SubTaskVariant::Subtitle {
                            language: descriptor.language.clone().unwrap_or_default(),
                        },
                    };
                    let sub_task = SubTask::new(task_id, variant, descriptor.codec, descriptor.url, &temp_dir);
                    task.sub_tasks.push(sub_task);
                }
                if !missing.is_empty() {
                    warn!(task_id, ?missing, "some requested languages were not available");
                    for (kind, lang) in &missing {
                        match kind {
                            crate::model::SubTaskKind::Audio => task.missing_languages.push(lang.clone()),
                            crate::model::SubTaskKind::Subtitle => task.missing_subtitles.push(lang.clone()),
                            crate::model::SubTaskKind::Video => {}
                        }
                    }
                }
                task.started_at = Some(chrono::Utc::now());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_request_carries_task_fields() {
        let req = EnqueueRequest {
            kind: TaskKind::Movie,
            catalogue_id: "550".to_string(),
            languages: vec!["en".to_string()],
            quality: Quality::Best,
        };
        assert_eq!(req.catalogue_id, "550");
    }
}
