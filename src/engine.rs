use crate::{
    scheduler::{Enqueued, Scheduler},
    sink::Sink,
    ConfigError, CrawlerError, FailureKind, FetchError, Fetcher, Page, Pipeline, PipelineHandle,
    Task, TaskSpec,
};
use itertools::Itertools;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// Extra attempts for a task whose fetch failed with a retryable error.
    pub max_retries: u32,
    /// Wait before retry `n` is `retry_delay * n`.
    pub retry_delay: Duration,
    /// Drop tasks whose url was already queued for the same pipeline.
    pub dedupe: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            dedupe: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    Fetch(FailureKind),
    Extraction { rule: String },
    Sink { rule: String },
    /// The task's own processing panicked outside any extraction rule.
    Panic,
    UnknownPipeline,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Fetch(kind) => write!(f, "fetch ({:?})", kind),
            FailureCause::Extraction { rule } => write!(f, "extraction (rule {})", rule),
            FailureCause::Sink { rule } => write!(f, "sink (rule {})", rule),
            FailureCause::Panic => f.write_str("panic"),
            FailureCause::UnknownPipeline => f.write_str("unknown pipeline"),
        }
    }
}

/// A task that did not complete, with enough context to retry it by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub pipeline: String,
    pub url: String,
    pub seq: u64,
    pub cause: FailureCause,
    pub message: String,
    pub attempts: u32,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} failed after {} attempt(s): {}: {}",
            self.pipeline, self.url, self.attempts, self.cause, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub enqueued: u64,
    pub duplicates: u64,
    pub fetched: u64,
    pub skipped: u64,
    pub records: u64,
    /// Tasks still pending when a cancelled run stopped.
    pub abandoned: usize,
    pub cancelled: bool,
    pub failures: Vec<TaskFailure>,
    /// Error from the final sink flush; records may be incomplete.
    pub flush_error: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.flush_error.is_none()
    }

    pub fn log(&self) {
        info!(
            enqueued = self.enqueued,
            duplicates = self.duplicates,
            fetched = self.fetched,
            skipped = self.skipped,
            records = self.records,
            failed = self.failures.len(),
            abandoned = self.abandoned,
            cancelled = self.cancelled,
            "Crawl finished"
        );
        if let Some(err) = &self.flush_error {
            error!("Sink flush failed: {}", err);
        }
        if !self.failures.is_empty() {
            let per_pipeline = self
                .failures
                .iter()
                .map(|f| f.pipeline.as_str())
                .counts()
                .into_iter()
                .sorted()
                .map(|(pipeline, n)| format!("{}={}", pipeline, n))
                .join(", ");
            warn!("Failed tasks per pipeline: {}", per_pipeline);
        }
        for failure in &self.failures {
            warn!(
                pipeline = %failure.pipeline,
                url = %failure.url,
                cause = %failure.cause,
                "{}",
                failure
            );
        }
    }
}

/// Registers pipelines and checks their wiring before anything runs.
pub struct CrawlBuilder {
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    pipelines: Vec<Pipeline>,
}

impl CrawlBuilder {
    /// `fetcher` serves every pipeline that does not bring its own.
    pub fn new(config: EngineConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            pipelines: vec![],
        }
    }

    pub fn register(&mut self, pipeline: Pipeline) -> Result<PipelineHandle, ConfigError> {
        pipeline.validate()?;
        if self.pipelines.iter().any(|p| p.name == pipeline.name) {
            return Err(ConfigError::DuplicatePipeline(pipeline.name));
        }
        let handle = PipelineHandle::new(self.pipelines.len(), &pipeline.name);
        debug!("Registered pipeline {}", handle);
        self.pipelines.push(pipeline);
        Ok(handle)
    }

    pub fn build(self, sink: Arc<dyn Sink>) -> Result<Crawl, ConfigError> {
        if self.config.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let handles = self
            .pipelines
            .iter()
            .enumerate()
            .map(|(index, p)| PipelineHandle::new(index, &p.name))
            .collect();
        Ok(Crawl {
            scheduler: Scheduler::new(self.config.dedupe),
            config: self.config,
            fetcher: self.fetcher,
            pipelines: self.pipelines,
            handles,
            sink,
            stats: Stats::default(),
            cancel: CancellationToken::new(),
        })
    }
}

#[derive(Default)]
struct Stats {
    enqueued: AtomicU64,
    duplicates: AtomicU64,
    fetched: AtomicU64,
    skipped: AtomicU64,
    records: AtomicU64,
    failures: Mutex<Vec<TaskFailure>>,
}

/// A validated set of pipelines ready to run.
pub struct Crawl {
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    pipelines: Vec<Pipeline>,
    handles: Vec<PipelineHandle>,
    sink: Arc<dyn Sink>,
    scheduler: Scheduler,
    stats: Stats,
    cancel: CancellationToken,
}

impl Crawl {
    pub fn handle(&self, name: &str) -> Option<&PipelineHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    /// Seed every pipeline, then process tasks until none is left or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary, CrawlerError> {
        self.cancel = cancel;
        let crawl = Arc::new(self);

        for (pipeline, handle) in crawl.pipelines.iter().zip(&crawl.handles) {
            if let Some(dispatch) = &pipeline.dispatch {
                for spec in dispatch.submit_tasks() {
                    crawl.enqueue(handle, spec);
                }
            }
        }
        info!("Initial queue length: {}", crawl.scheduler.pending());

        if crawl.cancel.is_cancelled() {
            crawl.scheduler.close();
        }
        let watcher = {
            let crawl = Arc::clone(&crawl);
            tokio::spawn(async move {
                crawl.cancel.cancelled().await;
                warn!("Cancellation requested, waiting for in-flight tasks");
                crawl.scheduler.close();
            })
        };

        let workers: Vec<_> = (0..crawl.config.workers)
            .map(|id| tokio::spawn(Arc::clone(&crawl).work(id)))
            .collect();
        for joined in futures::future::join_all(workers).await {
            if let Err(err) = joined {
                error!("Worker stopped abnormally: {}", err);
            }
        }
        watcher.abort();

        let flush_error = match crawl.sink.flush().await {
            Ok(()) => None,
            Err(err) => {
                error!("Sink flush failed: {}", err);
                Some(err.to_string())
            }
        };

        let failures = std::mem::take(
            &mut *crawl
                .stats
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        Ok(RunSummary {
            enqueued: crawl.stats.enqueued.load(Ordering::Relaxed),
            duplicates: crawl.stats.duplicates.load(Ordering::Relaxed),
            fetched: crawl.stats.fetched.load(Ordering::Relaxed),
            skipped: crawl.stats.skipped.load(Ordering::Relaxed),
            records: crawl.stats.records.load(Ordering::Relaxed),
            abandoned: crawl.scheduler.pending(),
            cancelled: crawl.cancel.is_cancelled(),
            failures,
            flush_error,
        })
    }

    async fn work(self: Arc<Self>, id: usize) {
        while let Some(task) = self.scheduler.next().await {
            let span = info_span!(
                "task",
                pipeline = %task.pipeline(),
                seq = task.seq(),
                url = %task.url()
            );
            let processed = {
                let crawl = Arc::clone(&self);
                let task = task.clone();
                tokio::spawn(async move { crawl.process(&task).await }.instrument(span))
            };
            if let Err(err) = processed.await {
                error!("Task {} stopped abnormally: {}", task, err);
                self.fail(&task, FailureCause::Panic, err.to_string(), 1);
            }
            self.scheduler.complete();
        }
        debug!("Worker {} done", id);
    }

    fn enqueue(&self, target: &PipelineHandle, spec: TaskSpec) {
        let known = self
            .handles
            .get(target.index())
            .map_or(false, |handle| handle == target);
        if !known {
            error!("Dropping task {} for unknown pipeline {}", spec.url(), target);
            self.record_failure(TaskFailure {
                pipeline: target.name().to_string(),
                url: spec.url().to_string(),
                seq: 0,
                cause: FailureCause::UnknownPipeline,
                message: "pipeline is not registered with this crawl".to_string(),
                attempts: 0,
            });
            return;
        }

        let url = spec.url().to_string();
        match self.scheduler.enqueue(target, spec) {
            Enqueued::Queued(seq) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!("Queued [{}#{}] {}", target, seq, url);
            }
            Enqueued::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!("Already queued [{}] {}", target, url);
            }
            Enqueued::Closed => debug!("Crawl closed, dropping [{}] {}", target, url),
        }
    }

    async fn process(&self, task: &Task) {
        let pipeline = &self.pipelines[task.pipeline().index()];

        if let Some(ledger) = &pipeline.ledger {
            match ledger.already_fetched(task).await {
                Ok(true) => {
                    debug!("Already fetched in an earlier run");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(false) => {}
                Err(err) => warn!("Ledger lookup failed, fetching anyway: {}", err),
            }
        }

        let fetcher = pipeline.fetcher.as_deref().unwrap_or(self.fetcher.as_ref());
        let page = match self.fetch_with_retry(fetcher, task).await {
            Ok(page) => page,
            Err((err, attempts)) => {
                self.fail(task, FailureCause::Fetch(err.kind), err.message, attempts);
                return;
            }
        };
        self.stats.fetched.fetch_add(1, Ordering::Relaxed);

        let extraction = pipeline.active_extractor().extract(&page, task);
        for (target, spec) in extraction.tasks {
            self.enqueue(&target, spec);
        }

        let mut complete = true;
        for failure in extraction.failures {
            complete = false;
            self.fail(
                task,
                FailureCause::Extraction {
                    rule: failure.rule,
                },
                format!("match {}: {}", failure.index, failure.error),
                1,
            );
        }

        for extracted in extraction.records {
            match self
                .sink
                .persist(task, &extracted.record, &extracted.save_as)
                .await
            {
                Ok(()) => {
                    let num = self.stats.records.fetch_add(1, Ordering::Relaxed);
                    info!("[{}] Insert Result {}", num + 1, task.url());
                }
                Err(err) => {
                    complete = false;
                    self.fail(
                        task,
                        FailureCause::Sink {
                            rule: extracted.rule,
                        },
                        err.to_string(),
                        1,
                    );
                }
            }
        }

        if complete {
            if let Some(ledger) = &pipeline.ledger {
                if let Err(err) = ledger.mark_fetched(task).await {
                    warn!("Could not mark task as fetched: {}", err);
                }
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        fetcher: &dyn Fetcher,
        task: &Task,
    ) -> Result<Page, (FetchError, u32)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match fetcher.fetch(task).await {
                Ok(page) => return Ok(page),
                Err(err)
                    if err.kind.is_retryable()
                        && attempts <= self.config.max_retries
                        && !self.cancel.is_cancelled() =>
                {
                    warn!("Attempt {} failed, retrying: {}", attempts, err);
                    tokio::time::sleep(self.config.retry_delay * attempts).await;
                }
                Err(err) => return Err((err, attempts)),
            }
        }
    }

    fn fail(&self, task: &Task, cause: FailureCause, message: String, attempts: u32) {
        let failure = TaskFailure {
            pipeline: task.pipeline().name().to_string(),
            url: task.url().to_string(),
            seq: task.seq(),
            cause,
            message,
            attempts,
        };
        warn!("{}", failure);
        self.record_failure(failure);
    }

    fn record_failure(&self, failure: TaskFailure) {
        self.stats
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}
