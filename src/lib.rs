//! Task-driven crawler: pipelines of fetch + extraction rules, where a rule in
//! one pipeline can schedule tasks on another (listing pages feeding detail
//! pages), plus the tf2maps.net configuration of that engine.

pub mod config;
pub mod data;
pub mod engine;
pub mod extract;
pub mod fetch;
pub mod pipeline;
pub mod scheduler;
pub mod sink;
pub mod tf2maps;

mod error;
mod record;
mod task;
mod utils;

pub use engine::{Crawl, CrawlBuilder, EngineConfig, FailureCause, RunSummary, TaskFailure};
pub use error::{ConfigError, CrawlerError};
pub use extract::{
    Callback, ExtractionError, ExtractionRule, Extractor, FileFormat, PostExtract, RuleContext,
    SaveAs,
};
pub use fetch::{FailureKind, FetchError, FetchSettings, Fetcher, Page, ReqwestFetcher};
pub use pipeline::{Continuation, Dispatch, FetchLedger, MaxPages, Pipeline};
pub use record::Record;
pub use sink::{FileSink, MultiSink, Sink};
pub use task::{Context, PipelineHandle, Task, TaskSpec};
pub use utils::{all_text, own_text};
