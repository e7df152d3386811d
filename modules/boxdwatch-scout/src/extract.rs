//! Pure extraction over rendered watchlist page snapshots.
//!
//! No network, no session state — a DOM string goes in, typed records
//! come out. Selectors mirror the source site's watchlist markup:
//! films are `li.poster-container` entries whose inner `div` carries
//! `data-film-id` / `data-film-slug` / `data-film-link`, and the
//! pagination block is `li.paginate-page`.

use chrono::Utc;
use scraper::{Html, Selector};

use boxdwatch_common::{ScrapeError, WatchlistRecord};

/// One parsed watchlist page.
#[derive(Debug)]
pub struct ExtractedPage {
    pub records: Vec<WatchlistRecord>,
    /// Highest page number the pagination block advertises. `None`
    /// when the list fits on a single page (no pagination rendered).
    pub last_page: Option<u32>,
    /// Explicit end-of-list sentinel. The pagination driver trusts
    /// this, not absence-of-records, to terminate.
    pub end_of_list: bool,
}

/// Parse one watchlist page snapshot.
///
/// Fails with `MarkupMismatch` when the structural anchors are gone —
/// a page with film entries that lack their data attributes, or a
/// page without any watchlist container at all. An empty-but-well-
/// formed page comes back as zero records with `end_of_list = true`;
/// the driver decides whether to trust that after its retry bound.
pub fn extract(
    html: &str,
    target_user: &str,
    page: u32,
) -> Result<ExtractedPage, ScrapeError> {
    let document = Html::parse_document(html);

    let container_selector = Selector::parse("ul.poster-list, div.poster-list").unwrap();
    let film_selector = Selector::parse("li.poster-container > div").unwrap();
    let page_selector = Selector::parse("li.paginate-page").unwrap();
    let img_selector = Selector::parse("img").unwrap();

    let has_container = document.select(&container_selector).next().is_some();
    let mut records = Vec::new();

    for film in document.select(&film_selector) {
        let attrs = film.value();
        let (id, slug, url) = match (
            attrs.attr("data-film-id"),
            attrs.attr("data-film-slug"),
            attrs.attr("data-film-link"),
        ) {
            (Some(id), Some(slug), Some(url)) => (id, slug, url),
            _ => {
                return Err(ScrapeError::MarkupMismatch(format!(
                    "poster container on page {page} is missing film data attributes"
                )))
            }
        };

        // Poster alt text is the display title; the slug is the fallback.
        let title = film
            .select(&img_selector)
            .next()
            .and_then(|img| img.value().attr("alt"))
            .unwrap_or(slug)
            .to_string();

        records.push(WatchlistRecord {
            external_id: id.to_string(),
            target_user: target_user.to_string(),
            title,
            slug: slug.to_string(),
            url: url.to_string(),
            tmdb_id: None,
            runtime_minutes: None,
            poster_path: None,
            vote_average: None,
            observed_at: Utc::now(),
        });
    }

    if records.is_empty() && !has_container {
        return Err(ScrapeError::MarkupMismatch(format!(
            "no watchlist container found on page {page}"
        )));
    }

    // A pagination block whose entries no longer carry page numbers is
    // a layout change, not a one-page list; treating it as end-of-list
    // would silently truncate the walk.
    let last_page = match document.select(&page_selector).last() {
        Some(li) => {
            let text = li.text().collect::<String>();
            match text.trim().parse::<u32>() {
                Ok(last) => Some(last),
                Err(_) => {
                    return Err(ScrapeError::MarkupMismatch(format!(
                        "pagination entry on page {page} has no page number: {:?}",
                        text.trim()
                    )))
                }
            }
        }
        None => None,
    };

    // No pagination block means the whole list fits on this page.
    let end_of_list = records.is_empty() || last_page.map_or(true, |last| page >= last);

    Ok(ExtractedPage {
        records,
        last_page,
        end_of_list,
    })
}

/// Pull the TMDB id off a film detail page (`body[data-tmdb-id]`).
pub fn extract_tmdb_id(html: &str) -> Result<i64, ScrapeError> {
    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body[data-tmdb-id]").unwrap();

    document
        .select(&body_selector)
        .next()
        .and_then(|body| body.value().attr("data-tmdb-id"))
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(|| {
            ScrapeError::MarkupMismatch("film page has no usable data-tmdb-id".to_string())
        })
}
