#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("Database error")]
    DatabaseError(#[from] sqlx::error::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Sink error: {0}")]
    SinkError(#[from] crate::sink::SinkError),
}

/// Wiring mistakes detected while building a crawl, before any task runs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pipeline `{0}` is registered twice")]
    DuplicatePipeline(String),
    #[error("pipeline `{0}` has no extraction rules")]
    EmptyPipeline(String),
    #[error("rule `{rule}` has an invalid selector `{selector}`: {reason}")]
    InvalidSelector {
        rule: String,
        selector: String,
        reason: String,
    },
    #[error("rule `{0}` is declared twice in the same pipeline")]
    DuplicateRule(String),
    #[error("invalid base url `{0}`")]
    InvalidBaseUrl(String),
    #[error("worker count must be at least 1")]
    NoWorkers,
}
