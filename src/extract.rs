use crate::{ConfigError, Page, PipelineHandle, Record, Task, TaskSpec};
use scraper::{ElementRef, Html, Selector};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};
use tracing::{debug, error};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed field `{field}`: `{value}`")]
    Malformed { field: &'static str, value: String },
    #[error("callback panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// One pretty-printed file per record.
    Json,
    /// One line per record, appended to a file per pipeline.
    JsonLines,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAs {
    pub format: FileFormat,
    /// Record field used to name the persisted record.
    pub key_field: Option<String>,
}

impl SaveAs {
    pub fn new(format: FileFormat) -> Self {
        Self {
            format,
            key_field: None,
        }
    }

    pub fn keyed_by<S: Into<String>>(mut self, field: S) -> Self {
        self.key_field = Some(field.into());
        self
    }
}

/// Step run on records returned by a rule callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostExtract {
    SaveAs(SaveAs),
}

/// What a rule callback sees besides the matched element.
pub struct RuleContext<'a> {
    task: &'a Task,
    page: &'a Page,
    spawned: Vec<(PipelineHandle, TaskSpec)>,
}

impl<'a> RuleContext<'a> {
    pub fn new(task: &'a Task, page: &'a Page) -> Self {
        Self {
            task,
            page,
            spawned: vec![],
        }
    }

    pub fn task(&self) -> &Task {
        self.task
    }

    pub fn page(&self) -> &Page {
        self.page
    }

    /// Schedule a task on any registered pipeline.
    pub fn enqueue(&mut self, target: &PipelineHandle, spec: TaskSpec) {
        self.spawned.push((target.clone(), spec));
    }

    /// Schedule a task on the pipeline that produced the current one.
    pub fn follow(&mut self, spec: TaskSpec) {
        let target = self.task.pipeline().clone();
        self.spawned.push((target, spec));
    }

    pub fn into_spawned(self) -> Vec<(PipelineHandle, TaskSpec)> {
        self.spawned
    }
}

pub trait Callback: Send + Sync {
    fn apply(
        &self,
        element: ElementRef<'_>,
        idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError>;
}

impl<F> Callback for F
where
    F: Fn(ElementRef<'_>, usize, &mut RuleContext<'_>) -> Result<Option<Record>, ExtractionError>
        + Send
        + Sync,
{
    fn apply(
        &self,
        element: ElementRef<'_>,
        idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        self(element, idx, cx)
    }
}

pub struct ExtractionRule {
    name: String,
    selectors: Vec<Selector>,
    callback: Box<dyn Callback>,
    post_extract: Option<PostExtract>,
}

impl ExtractionRule {
    /// Selectors are parsed here so a typo fails the crawl before it starts.
    /// With no selectors the callback runs once against the document root.
    pub fn new<C: Callback + 'static>(
        name: &str,
        selectors: &[&str],
        callback: C,
    ) -> Result<Self, ConfigError> {
        let selectors = selectors
            .iter()
            .map(|s| {
                Selector::parse(s).map_err(|err| ConfigError::InvalidSelector {
                    rule: name.to_string(),
                    selector: s.to_string(),
                    reason: format!("{:?}", err),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            selectors,
            callback: Box::new(callback),
            post_extract: None,
        })
    }

    pub fn post_extract(mut self, post_extract: PostExtract) -> Self {
        self.post_extract = Some(post_extract);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches<'d>(&self, doc: &'d Html) -> Vec<ElementRef<'d>> {
        if self.selectors.is_empty() {
            return vec![doc.root_element()];
        }
        self.selectors
            .iter()
            .flat_map(|selector| doc.select(selector))
            .collect()
    }
}

pub struct ExtractionUnit<'a> {
    pub rule: &'a ExtractionRule,
    pub matches: Vec<ElementRef<'a>>,
}

#[derive(Debug)]
pub struct Extracted {
    pub rule: String,
    pub record: Record,
    pub save_as: SaveAs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub rule: String,
    pub index: usize,
    pub error: ExtractionError,
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<Extracted>,
    pub tasks: Vec<(PipelineHandle, TaskSpec)>,
    pub failures: Vec<RuleFailure>,
}

pub trait Extractor: Send + Sync {
    fn extract(&self, page: &Page, task: &Task) -> Extraction;
}

/// Default extractor: the ordered rules declared on a pipeline.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<ExtractionRule>,
}

impl RuleSet {
    pub fn push(&mut self, rule: ExtractionRule) -> Result<(), ConfigError> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(ConfigError::DuplicateRule(rule.name));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn units<'a>(&'a self, doc: &'a Html) -> impl Iterator<Item = ExtractionUnit<'a>> + 'a {
        self.rules.iter().map(move |rule| ExtractionUnit {
            rule,
            matches: rule.matches(doc),
        })
    }
}

impl Extractor for RuleSet {
    fn extract(&self, page: &Page, task: &Task) -> Extraction {
        let doc = Html::parse_document(&page.body);
        let mut cx = RuleContext::new(task, page);
        let mut extraction = Extraction::default();

        for unit in self.units(&doc) {
            let rule = unit.rule;
            debug!("Rule {} matched {} element(s)", rule.name, unit.matches.len());
            for (idx, element) in unit.matches.into_iter().enumerate() {
                let spawned = cx.spawned.len();
                let applied = panic::catch_unwind(AssertUnwindSafe(|| {
                    rule.callback.apply(element, idx, &mut cx)
                }))
                .unwrap_or_else(|payload| {
                    // Tasks queued by a callback that did not finish are dropped.
                    cx.spawned.truncate(spawned);
                    let message = panic_message(payload.as_ref());
                    error!("Rule {} panicked on match {}: {}", rule.name, idx, message);
                    Err(ExtractionError::Panicked(message))
                });
                match applied {
                    Ok(Some(record)) => match &rule.post_extract {
                        Some(PostExtract::SaveAs(save_as)) => {
                            extraction.records.push(Extracted {
                                rule: rule.name.clone(),
                                record,
                                save_as: save_as.clone(),
                            });
                        }
                        None => debug!("Rule {} has no post-extract step, record dropped", rule.name),
                    },
                    Ok(None) => {}
                    Err(error) => extraction.failures.push(RuleFailure {
                        rule: rule.name.clone(),
                        index: idx,
                        error,
                    }),
                }
            }
        }

        extraction.tasks = cx.into_spawned();
        extraction
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LIST: &str = r#"
        <ul>
            <li class="item" data-id="a">A</li>
            <li class="item" data-id="b">B</li>
            <li class="item">broken</li>
        </ul>
        <p class="extra" data-id="c">C</p>
    "#;

    fn item(
        element: ElementRef<'_>,
        _idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        let id = element
            .value()
            .attr("data-id")
            .ok_or(ExtractionError::MissingField("data-id"))?;
        cx.follow(TaskSpec::new(format!("https://example.org/{}", id)));
        Ok(Some(
            Record::new()
                .with("id", id)
                .with("page", cx.task().context().get_u64("page")),
        ))
    }

    fn whole_page(
        element: ElementRef<'_>,
        idx: usize,
        _cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        Ok(Some(
            Record::new()
                .with("root", element.value().name())
                .with("idx", idx),
        ))
    }

    fn fixture() -> (Task, Page) {
        let task = Task::new(
            1,
            PipelineHandle::new(0, "list"),
            TaskSpec::new("https://example.org/list").with("page", 4),
        );
        (task, Page::html("https://example.org/list", LIST))
    }

    fn rules(save: bool) -> RuleSet {
        let mut rule = ExtractionRule::new("items", &["li.item", "p.extra"], item).unwrap();
        if save {
            rule = rule.post_extract(PostExtract::SaveAs(SaveAs::new(FileFormat::Json)));
        }
        let mut set = RuleSet::default();
        set.push(rule).unwrap();
        set
    }

    #[test]
    fn callback_runs_once_per_match_across_selectors() {
        let (task, page) = fixture();
        let extraction = rules(true).extract(&page, &task);

        let ids: Vec<_> = extraction
            .records
            .iter()
            .map(|e| e.record.key("id").unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(extraction.tasks.len(), 3);
        assert!(extraction.tasks.iter().all(|(h, _)| h.name() == "list"));
        assert_eq!(
            extraction.failures,
            vec![RuleFailure {
                rule: "items".to_string(),
                index: 2,
                error: ExtractionError::MissingField("data-id"),
            }]
        );
    }

    #[test]
    fn records_without_post_extract_are_not_persisted() {
        let (task, page) = fixture();
        let extraction = rules(false).extract(&page, &task);
        assert!(extraction.records.is_empty());
        assert_eq!(extraction.tasks.len(), 3);
    }

    #[test]
    fn rule_without_selector_runs_on_document_root() {
        let (task, page) = fixture();
        let mut set = RuleSet::default();
        set.push(
            ExtractionRule::new("page", &[], whole_page)
                .unwrap()
                .post_extract(PostExtract::SaveAs(SaveAs::new(FileFormat::JsonLines))),
        )
        .unwrap();

        let extraction = set.extract(&page, &task);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(
            extraction.records[0].record,
            Record::new().with("root", "html").with("idx", 0)
        );
    }

    fn fragile(
        element: ElementRef<'_>,
        idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        let id = element.value().attr("data-id").unwrap_or("none");
        cx.follow(TaskSpec::new(format!("https://example.org/{}", id)));
        if idx == 1 {
            let empty: Vec<u8> = vec![];
            let _ = empty[idx];
        }
        Ok(Some(Record::new().with("id", id)))
    }

    #[test]
    fn panicking_callback_fails_only_its_match() {
        let (task, page) = fixture();
        let mut set = RuleSet::default();
        set.push(
            ExtractionRule::new("items", &["li.item", "p.extra"], fragile)
                .unwrap()
                .post_extract(PostExtract::SaveAs(SaveAs::new(FileFormat::Json))),
        )
        .unwrap();

        let extraction = set.extract(&page, &task);
        let ids: Vec<_> = extraction
            .records
            .iter()
            .map(|e| e.record.key("id").unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "none", "c"]);
        let urls: Vec<_> = extraction.tasks.iter().map(|(_, t)| t.url()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.org/a",
                "https://example.org/none",
                "https://example.org/c"
            ]
        );
        assert_eq!(extraction.failures.len(), 1);
        assert_eq!(extraction.failures[0].index, 1);
        assert!(matches!(
            &extraction.failures[0].error,
            ExtractionError::Panicked(message) if message.contains("index out of bounds")
        ));
    }

    #[test]
    fn no_match_is_not_an_error() {
        let task = fixture().0;
        let page = Page::html("https://example.org/list", "<html><body></body></html>");
        let extraction = rules(true).extract(&page, &task);
        assert!(extraction.records.is_empty());
        assert!(extraction.tasks.is_empty());
        assert!(extraction.failures.is_empty());
    }

    #[test]
    fn extraction_is_a_function_of_content_and_context() {
        let (task, page) = fixture();
        let set = rules(true);
        let first: Vec<Record> = set
            .extract(&page, &task)
            .records
            .into_iter()
            .map(|e| e.record)
            .collect();
        let second: Vec<Record> = set
            .extract(&page, &task)
            .records
            .into_iter()
            .map(|e| e.record)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first[0].get("page"), Some(&serde_json::json!(4)));
    }

    #[test]
    fn invalid_selector_is_a_configuration_error() {
        let err = ExtractionRule::new("bad", &["li[[["], item).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidSelector { rule, .. } if rule == "bad"));
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let mut set = RuleSet::default();
        set.push(ExtractionRule::new("items", &["li"], item).unwrap())
            .unwrap();
        let err = set
            .push(ExtractionRule::new("items", &["p"], item).unwrap())
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateRule("items".to_string()));
    }
}
