use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::{Semaphore, watch};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AnalysisConfig, BatchConfig, CancelPolicy};
use crate::context::AnalysisContext;
use crate::error::AnalysisError;
use crate::orchestrator::{ExportTarget, Orchestrator, RunOutcome};

/// One completion event per scheduled file, in completion order.
#[derive(Debug)]
pub enum FileEvent {
    Completed {
        path: PathBuf,
        outcome: RunOutcome,
        elapsed: Duration,
    },
    Failed {
        path: PathBuf,
        error: AnalysisError,
        elapsed: Duration,
    },
    Cancelled {
        path: PathBuf,
    },
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    pub errors: Vec<(PathBuf, String)>,
}

/// Requests that the owning batch stop scheduling new files. In-flight work
/// finishes or is abandoned according to the configured `CancelPolicy`;
/// results already produced are kept either way.
#[derive(Clone)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Runs the orchestrator over many files with bounded parallelism.
///
/// Files are fully independent: a failure is one event in the stream, never
/// a reason to abort the rest. Completion order is nondeterministic.
pub struct BatchProcessor {
    context: Arc<AnalysisContext>,
    analysis: AnalysisConfig,
    config: BatchConfig,
    export: Option<ExportTarget>,
    cancel: watch::Sender<bool>,
}

impl BatchProcessor {
    pub fn new(context: Arc<AnalysisContext>, analysis: AnalysisConfig, config: BatchConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        BatchProcessor {
            context,
            analysis,
            config,
            export: None,
            cancel,
        }
    }

    pub fn with_export(mut self, target: ExportTarget) -> Self {
        self.export = Some(target);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Starts the batch and returns the per-file completion events as they
    /// happen; reporting never waits for the whole set to finish.
    pub fn process(&self, files: Vec<PathBuf>) -> Receiver<FileEvent> {
        let permits = self.config.effective_workers();
        let (tx, rx) = mpsc::channel(permits * 2);

        let mut orchestrator = Orchestrator::new(self.context.clone(), self.analysis.clone());
        if let Some(target) = &self.export {
            orchestrator = orchestrator.with_export(target.clone());
        }
        let orchestrator = Arc::new(orchestrator);

        let cancel = self.cancel.subscribe();
        let file_timeout = self.config.file_timeout;
        let policy = self.config.cancel_policy;

        info!(files = files.len(), permits, "batch started");

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(permits));

            let runs = files.into_iter().map(|path| {
                let semaphore = semaphore.clone();
                let orchestrator = orchestrator.clone();
                let cancel = cancel.clone();
                async move {
                    run_one(path, orchestrator, semaphore, cancel, file_timeout, policy).await
                }
            });

            let mut events = stream::iter(runs).buffer_unordered(permits);
            while let Some(event) = events.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Convenience wrapper: drains the event stream into a summary.
    pub async fn run(&self, files: Vec<PathBuf>) -> BatchSummary {
        let total = files.len();
        let mut events = self.process(files);

        let mut summary = BatchSummary {
            total,
            ..BatchSummary::default()
        };

        while let Some(event) = events.recv().await {
            match event {
                FileEvent::Completed { path, outcome, elapsed } => {
                    debug!(path = %path.display(), ?elapsed, cache_hit = outcome.cache_hit, "file done");
                    summary.succeeded += 1;
                    if outcome.cache_hit {
                        summary.cache_hits += 1;
                    }
                }
                FileEvent::Failed { path, error, elapsed } => {
                    warn!(path = %path.display(), ?elapsed, %error, "file failed");
                    summary.errors.push((path, error.to_string()));
                    summary.failed += 1;
                }
                FileEvent::Cancelled { path } => {
                    debug!(path = %path.display(), "file cancelled");
                    summary.cancelled += 1;
                }
            }
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            cache_hits = summary.cache_hits,
            "batch finished"
        );
        summary
    }
}

async fn run_one(
    path: PathBuf,
    orchestrator: Arc<Orchestrator>,
    semaphore: Arc<Semaphore>,
    mut cancel: watch::Receiver<bool>,
    file_timeout: Duration,
    policy: CancelPolicy,
) -> FileEvent {
    let Ok(permit) = semaphore.acquire_owned().await else {
        return FileEvent::Cancelled { path };
    };

    // A cancellation seen before the permit means this file was never
    // started; it is skipped, not failed.
    if *cancel.borrow() {
        return FileEvent::Cancelled { path };
    }

    let start = Instant::now();
    let worker = {
        let orchestrator = orchestrator.clone();
        let path = path.clone();
        spawn_blocking(move || orchestrator.run(&path))
    };
    let timed = timeout(file_timeout, worker);

    let joined = match policy {
        CancelPolicy::Drain => Some(timed.await),
        CancelPolicy::Abandon => {
            tokio::select! {
                result = timed => Some(result),
                _ = cancelled(&mut cancel) => None,
            }
        }
    };
    drop(permit);

    let elapsed = start.elapsed();
    match joined {
        // Abandoned: the blocking call keeps running detached, but nobody
        // waits for it anymore.
        None => FileEvent::Cancelled { path },
        Some(Err(_)) => FileEvent::Failed {
            path,
            error: AnalysisError::Timeout(file_timeout),
            elapsed,
        },
        Some(Ok(Err(join_error))) => FileEvent::Failed {
            path,
            error: AnalysisError::Worker(join_error.to_string()),
            elapsed,
        },
        Some(Ok(Ok(Ok(outcome)))) => FileEvent::Completed {
            path,
            outcome,
            elapsed,
        },
        Some(Ok(Ok(Err(error)))) => FileEvent::Failed { path, error, elapsed },
    }
}

/// Resolves once the cancellation flag turns true.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{AnalysisConfigBuilder, BatchConfigBuilder};
    use crate::testing::stub_context;

    fn analysis(algorithm: &str) -> AnalysisConfig {
        AnalysisConfigBuilder::default()
            .algorithm(algorithm)
            .build()
            .unwrap()
    }

    fn batch_config(workers: usize) -> BatchConfig {
        BatchConfigBuilder::default().workers(workers).build().unwrap()
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/music/{n}"))).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupt_files_never_abort_the_batch() {
        let (context, _) = stub_context(None);
        let processor = BatchProcessor::new(context, analysis("stub"), batch_config(2));

        let summary = processor
            .run(paths(&[
                "a.wav",
                "corrupt-1.wav",
                "b.wav",
                "c.wav",
                "corrupt-2.wav",
                "d.wav",
            ]))
            .await;

        assert_eq!(summary.total, 6);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.errors.iter().all(|(path, _)| {
            path.to_string_lossy().contains("corrupt")
        }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_inputs_hit_the_cache() {
        let (context, _) = stub_context(None);
        let processor = BatchProcessor::new(context, analysis("stub"), batch_config(1));

        let summary = processor.run(paths(&["a.wav", "a.wav", "b.wav"])).await;

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.cache_hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_fails_only_the_slow_file() {
        let (context, _) = stub_context(None);
        let config = BatchConfigBuilder::default()
            .workers(2usize)
            .file_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let processor = BatchProcessor::new(context.clone(), analysis("slow"), config);

        let summary = processor.run(paths(&["slow.wav"])).await;
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].1.contains("timed out"));

        // The same context still analyzes fast files fine.
        let fast = BatchProcessor::new(context, analysis("stub"), batch_config(2));
        let summary = fast.run(paths(&["a.wav"])).await;
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_stops_scheduling_but_keeps_finished_work() {
        let (context, _) = stub_context(None);
        let processor = BatchProcessor::new(context, analysis("slow"), batch_config(1));
        let handle = processor.cancel_handle();

        let names: Vec<String> = (0..12).map(|i| format!("file-{i}.wav")).collect();
        let files: Vec<PathBuf> = names.iter().map(|n| PathBuf::from(format!("/music/{n}"))).collect();

        let mut events = processor.process(files);
        let mut completed = 0usize;
        let mut cancelled_count = 0usize;
        let mut seen = 0usize;

        while let Some(event) = events.recv().await {
            seen += 1;
            match event {
                FileEvent::Completed { .. } => {
                    completed += 1;
                    handle.cancel();
                }
                FileEvent::Cancelled { .. } => cancelled_count += 1,
                FileEvent::Failed { .. } => {}
            }
        }

        assert_eq!(seen, 12);
        assert!(completed >= 1);
        assert!(cancelled_count >= 1);
        assert_eq!(completed + cancelled_count, 12);
    }
}
