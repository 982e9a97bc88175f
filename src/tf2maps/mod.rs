//! tf2maps.net: walk the map category listing and save every map's details.

mod detail;
mod listing;

pub use detail::MapDetails;
pub use listing::{MapLinks, NextPage};

use crate::{
    extract::{ExtractionError, ExtractionRule, FileFormat, PostExtract, SaveAs},
    pipeline::{Continuation, FetchLedger, Pipeline},
    ConfigError, CrawlBuilder, PipelineHandle, TaskSpec,
};
use reqwest::Url;
use std::sync::Arc;

pub const LINKS: &str = "tf2map_links";
pub const DETAILS: &str = "tf2map_details";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSettings {
    pub base_url: String,
    pub start_page: u64,
    pub format: FileFormat,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://tf2maps.net/".to_string(),
            start_page: 1,
            format: FileFormat::Json,
        }
    }
}

/// Resolves the site-relative hrefs found on listing and detail pages.
#[derive(Debug, Clone)]
pub struct Site {
    base: Url,
}

impl Site {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let with_slash = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base = Url::parse(&with_slash)
            .map_err(|_| ConfigError::InvalidBaseUrl(base_url.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self { base })
    }

    pub fn absolute(&self, field: &'static str, href: &str) -> Result<String, ExtractionError> {
        self.base
            .join(href.trim_start_matches('/'))
            .map(String::from)
            .map_err(|_| ExtractionError::Malformed {
                field,
                value: href.to_string(),
            })
    }

    pub fn listing(&self, page: u64) -> String {
        format!("{}downloads/categories/maps.2/?page={}", self.base, page)
    }
}

/// Register the listing and detail pipelines on `builder`.
///
/// `continuation` decides whether the listing moves on to the next page.
/// `ledger`, when given, lets the detail pipeline skip maps saved by an
/// earlier run.
pub fn register<C: Continuation + 'static>(
    builder: &mut CrawlBuilder,
    settings: &SiteSettings,
    continuation: C,
    ledger: Option<Arc<dyn FetchLedger>>,
) -> Result<(PipelineHandle, PipelineHandle), ConfigError> {
    let site = Arc::new(Site::new(&settings.base_url)?);

    let mut details = Pipeline::new(DETAILS).rule(
        ExtractionRule::new("map_details", &[], MapDetails::new(Arc::clone(&site)))?
            .post_extract(PostExtract::SaveAs(
                SaveAs::new(settings.format).keyed_by("map_id"),
            )),
    )?;
    if let Some(ledger) = ledger {
        details = details.ledger(ledger);
    }
    let details = builder.register(details)?;

    let seed = TaskSpec::new(site.listing(settings.start_page)).with("page", settings.start_page);
    let links = Pipeline::new(LINKS)
        .dispatch(seed)
        .rule(ExtractionRule::new(
            "map_links",
            &["li.resourceListItem"],
            MapLinks::new(Arc::clone(&site), details.clone()),
        )?)?
        .rule(ExtractionRule::new(
            "page",
            &["div.PageNav nav a.text"],
            NextPage::new(site, continuation),
        )?)?;
    let links = builder.register(links)?;

    Ok((links, details))
}
