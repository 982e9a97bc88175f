use super::Site;
use crate::{
    all_text,
    extract::{Callback, ExtractionError, RuleContext},
    own_text, Record,
};
use lazy_static::lazy_static;
use scraper::{ElementRef, Selector};
use serde_json::Value;
use std::sync::Arc;

const E: &str = "Invalid selector";
lazy_static! {
    static ref DOWNLOAD: Selector = Selector::parse("label.downloadButton a").expect(E);
    static ref NAME: Selector = Selector::parse("div.resourceInfo h1").expect(E);
    static ref TAGLINE: Selector = Selector::parse("div.resourceInfo p.tagLine").expect(E);
    static ref AUTHOR: Selector = Selector::parse("dl.author a").expect(E);
    static ref FIRST_RELEASE: Selector = Selector::parse("dl.firstRelease abbr").expect(E);
    static ref LAST_UPDATE: Selector = Selector::parse("dl.lastUpdate abbr").expect(E);
    static ref CATEGORY: Selector = Selector::parse("dl.resourceCategory a").expect(E);
}

/// Reads one map page into a record keyed by `map_id`.
pub struct MapDetails {
    site: Arc<Site>,
}

impl MapDetails {
    pub fn new(site: Arc<Site>) -> Self {
        Self { site }
    }
}

fn first<'a>(doc: ElementRef<'a>, selector: &Selector) -> Option<ElementRef<'a>> {
    doc.select(selector).next()
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ExtractionError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ExtractionError::MissingField(field))
}

fn optional_attr(doc: ElementRef<'_>, selector: &Selector, attr: &str) -> Value {
    first(doc, selector)
        .and_then(|el| el.value().attr(attr))
        .map_or(Value::Null, |v| Value::from(v.trim()))
}

impl Callback for MapDetails {
    fn apply(
        &self,
        doc: ElementRef<'_>,
        _idx: usize,
        cx: &mut RuleContext<'_>,
    ) -> Result<Option<Record>, ExtractionError> {
        let map_id = cx
            .task()
            .context()
            .get_str("map_id")
            .ok_or(ExtractionError::MissingField("map_id"))?;

        // The file itself is not downloaded; the link is kept for whoever consumes the record.
        let dl_url = match first(doc, &DOWNLOAD).and_then(|a| a.value().attr("href")) {
            Some(href) => Value::from(self.site.absolute("dl_url", href.trim())?),
            None => Value::Null,
        };

        let map_name = required(first(doc, &NAME).and_then(own_text), "map_name")?;
        let map_tagline = required(first(doc, &TAGLINE).map(all_text), "map_tagline")?;

        let author = first(doc, &AUTHOR).ok_or(ExtractionError::MissingField("author"))?;
        let author_name = required(Some(all_text(author)), "author_name")?;
        let author_href = author
            .value()
            .attr("href")
            .ok_or(ExtractionError::MissingField("author_id"))?;
        let author_id = author_href
            .trim()
            .rsplit('/')
            .nth(1)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExtractionError::Malformed {
                field: "author_id",
                value: author_href.to_string(),
            })?;

        let category = required(first(doc, &CATEGORY).map(all_text), "category")?;

        Ok(Some(
            Record::new()
                .with("dl_url", dl_url)
                .with("map_id", map_id)
                .with("map_name", map_name)
                .with("map_tagline", map_tagline)
                .with("author_name", author_name)
                .with("author_id", author_id)
                .with(
                    "first_release_epoch",
                    optional_attr(doc, &FIRST_RELEASE, "data-time"),
                )
                .with(
                    "last_update_epoch",
                    optional_attr(doc, &LAST_UPDATE, "data-time"),
                )
                .with("category", category),
        ))
    }
}
