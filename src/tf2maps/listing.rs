use super::Site;
use crate::{
    all_text,
    extract::{Callback, ExtractionError, RuleContext},
    pipeline::Continuation,
    PipelineHandle, Record, TaskSpec,
};
use lazy_regex::regex_is_match;
use lazy_static::lazy_static;
use scraper::{ElementRef, Selector};
use std::sync::Arc;
use tracing::debug;

const E: &str = "Invalid selector";
lazy_static! {
    static ref TITLE_LINK: Selector = Selector::parse("h3.title a").expect(E);
}

/// Turns each listing entry into a task for the detail pipeline.
pub struct MapLinks {
    site: Arc<Site>,
    details: PipelineHandle,
}

impl MapLinks {
    pub fn new(site: Arc<Site>, details: PipelineHandle) -> Self {
        Self { site, details }
    }
}

impl Callback for MapLinks {
    fn apply(
        &self,
        element: ElementRef<'_>,
        _idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        // The title holds a prefix link first; the map link is the last one.
        let href = element
            .select(&TITLE_LINK)
            .last()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .ok_or(ExtractionError::MissingField("map_href"))?;
        let map_id = href
            .trim_start_matches('/')
            .split('/')
            .nth(1)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExtractionError::Malformed {
                field: "map_href",
                value: href.to_string(),
            })?;

        let url = self.site.absolute("map_href", href)?;
        cx.enqueue(&self.details, TaskSpec::new(url).with("map_id", map_id));
        Ok(None)
    }
}

/// Follows the listing's "Next" link while the continuation allows it.
pub struct NextPage<C> {
    site: Arc<Site>,
    continuation: C,
}

impl<C: Continuation> NextPage<C> {
    pub fn new(site: Arc<Site>, continuation: C) -> Self {
        Self { site, continuation }
    }
}

impl<C: Continuation> Callback for NextPage<C> {
    fn apply(
        &self,
        element: ElementRef<'_>,
        _idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        // The page nav carries both "< Prev" and "Next >" with the same class.
        if !regex_is_match!(r"(?i)^next", &all_text(element)) {
            return Ok(None);
        }
        if !self.continuation.should_continue(cx.task()) {
            debug!("Pagination stops at {}", cx.task().url());
            return Ok(None);
        }

        let page = cx
            .task()
            .context()
            .get_u64("page")
            .ok_or(ExtractionError::MissingField("page"))?;
        let href = element
            .value()
            .attr("href")
            .ok_or(ExtractionError::MissingField("next_page"))?;
        let url = self.site.absolute("next_page", href.trim())?;
        cx.follow(TaskSpec::new(url).with("page", page + 1));
        Ok(None)
    }
}
