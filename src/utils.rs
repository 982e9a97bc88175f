use chrono::{DateTime, FixedOffset};
use scraper::ElementRef;
use sqlx::SqlitePool;

pub(crate) async fn is_table_exists(
    pool: &SqlitePool,
    table_name: &str,
) -> Result<bool, sqlx::Error> {
    Ok(
        sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?
            .is_some(),
    )
}

pub(crate) fn get_now() -> DateTime<FixedOffset> {
    let now = chrono::offset::Local::now();
    now.with_timezone(now.offset())
}

/// First non-blank text node directly under `el`, trimmed.
pub fn own_text(el: ElementRef<'_>) -> Option<String> {
    el.children()
        .filter_map(|node| node.value().as_text())
        .map(|text| text.trim())
        .find(|text| !text.is_empty())
        .map(ToString::to_string)
}

/// All descendant text of `el`, trimmed.
pub fn all_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    #[test]
    fn own_text_skips_child_elements() {
        let doc = Html::parse_fragment("<h1>\n  Harvest <span>v2</span></h1>");
        let h1 = doc.select(&Selector::parse("h1").unwrap()).next().unwrap();
        assert_eq!(own_text(h1).as_deref(), Some("Harvest"));
        assert_eq!(all_text(h1), "Harvest v2");
    }
}
