use crate::{
    extract::{ExtractionRule, Extractor, RuleSet},
    ConfigError, CrawlerError, Fetcher, Task, TaskSpec,
};
use std::sync::Arc;

/// Seed logic of a pipeline, run once when the crawl starts.
pub trait Dispatch: Send + Sync {
    fn submit_tasks(&self) -> Vec<TaskSpec>;
}

impl Dispatch for TaskSpec {
    fn submit_tasks(&self) -> Vec<TaskSpec> {
        vec![self.clone()]
    }
}

impl Dispatch for Vec<TaskSpec> {
    fn submit_tasks(&self) -> Vec<TaskSpec> {
        self.clone()
    }
}

/// Decides whether a paginated crawl should request the page after `task`.
pub trait Continuation: Send + Sync {
    fn should_continue(&self, task: &Task) -> bool;
}

impl<F> Continuation for F
where
    F: Fn(&Task) -> bool + Send + Sync,
{
    fn should_continue(&self, task: &Task) -> bool {
        self(task)
    }
}

/// Continue while the task's `page` context field is below the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPages(pub u64);

impl Continuation for MaxPages {
    fn should_continue(&self, task: &Task) -> bool {
        task.context()
            .get_u64("page")
            .map_or(false, |page| page < self.0)
    }
}

/// Record of tasks already completed by an earlier run.
#[async_trait::async_trait]
pub trait FetchLedger: Send + Sync {
    async fn already_fetched(&self, task: &Task) -> Result<bool, CrawlerError>;
    async fn mark_fetched(&self, task: &Task) -> Result<(), CrawlerError>;
}

/// Named grouping of seed logic, fetcher, extraction rules and resume state.
pub struct Pipeline {
    pub(crate) name: String,
    pub(crate) dispatch: Option<Box<dyn Dispatch>>,
    pub(crate) fetcher: Option<Arc<dyn Fetcher>>,
    pub(crate) rules: RuleSet,
    pub(crate) extractor: Option<Arc<dyn Extractor>>,
    pub(crate) ledger: Option<Arc<dyn FetchLedger>>,
}

impl Pipeline {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            dispatch: None,
            fetcher: None,
            rules: RuleSet::default(),
            extractor: None,
            ledger: None,
        }
    }

    pub fn dispatch<D: Dispatch + 'static>(mut self, dispatch: D) -> Self {
        self.dispatch = Some(Box::new(dispatch));
        self
    }

    /// Replace the crawl-wide default fetcher for this pipeline.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the declared rules with a custom extractor.
    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn FetchLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn rule(mut self, rule: ExtractionRule) -> Result<Self, ConfigError> {
        self.rules.push(rule)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.extractor.is_none() && self.rules.is_empty() {
            return Err(ConfigError::EmptyPipeline(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn active_extractor(&self) -> &dyn Extractor {
        match &self.extractor {
            Some(extractor) => extractor.as_ref(),
            None => &self.rules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineHandle;

    fn page(n: u64) -> Task {
        Task::new(
            n,
            PipelineHandle::new(0, "links"),
            TaskSpec::new("u").with("page", n),
        )
    }

    #[test]
    fn max_pages_stops_at_limit() {
        let limit = MaxPages(2);
        assert!(limit.should_continue(&page(1)));
        assert!(!limit.should_continue(&page(2)));
        assert!(!limit.should_continue(&page(3)));
    }

    #[test]
    fn max_pages_needs_page_field() {
        let task = Task::new(0, PipelineHandle::new(0, "links"), TaskSpec::new("u"));
        assert!(!MaxPages(10).should_continue(&task));
    }

    #[test]
    fn closures_are_predicates() {
        let even_only = |task: &Task| task.context().get_u64("page") == Some(2);
        assert!(even_only.should_continue(&page(2)));
        assert!(!even_only.should_continue(&page(1)));
    }

    #[test]
    fn pipeline_without_rules_is_rejected() {
        let err = Pipeline::new("empty").validate().unwrap_err();
        assert_eq!(err, ConfigError::EmptyPipeline("empty".to_string()));
    }

    #[test]
    fn seeds_from_specs() {
        let seeds = vec![TaskSpec::new("a"), TaskSpec::new("b")];
        assert_eq!(seeds.submit_tasks().len(), 2);
        assert_eq!(TaskSpec::new("a").submit_tasks(), vec![TaskSpec::new("a")]);
    }
}
