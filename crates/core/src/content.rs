use crate::error::CollectError;
use crate::models::{ContentKind, FetchedContent, SearchResult, WebPage};
use chrono::NaiveDate;
use lopdf::Document;
use regex::Regex;
use scraper::{Html, Selector};

const SKIPPED_ELEMENTS: [&str; 9] = [
    "script", "style", "noscript", "template", "svg", "nav", "header", "footer", "iframe",
];

const DATE_SELECTORS: [(&str, &str); 7] = [
    (r#"meta[property="article:published_time"]"#, "content"),
    (r#"meta[name="article:published_time"]"#, "content"),
    (r#"meta[itemprop="datePublished"]"#, "content"),
    (r#"meta[name="date"]"#, "content"),
    (r#"meta[name="pubdate"]"#, "content"),
    (r#"meta[name="dc.date"]"#, "content"),
    ("time[datetime]", "datetime"),
];

pub fn detect_kind(url: &str, content_type: Option<&str>, bytes: &[u8]) -> ContentKind {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("application/pdf") || bytes.starts_with(b"%PDF") {
        return ContentKind::Pdf;
    }
    if content_type.contains("html") || content_type.contains("xml") {
        return ContentKind::Html;
    }
    if looks_like_pdf_url(url) {
        return ContentKind::Pdf;
    }
    if content_type.is_empty() || content_type.starts_with("text/") {
        ContentKind::Html
    } else {
        ContentKind::Other
    }
}

pub fn looks_like_pdf_url(url: &str) -> bool {
    url.to_ascii_lowercase().contains(".pdf")
}

/// Visible text of an HTML document, one line per text block.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };

        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| SKIPPED_ELEMENTS.contains(&element.name()))
        });
        if hidden {
            continue;
        }

        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }

    lines.join("\n")
}

pub fn html_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Publication date declared by the page markup, if any.
pub fn publication_date(html: &str) -> Option<NaiveDate> {
    let document = Html::parse_document(html);

    for (selector, attribute) in DATE_SELECTORS {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        let found = document
            .select(&selector)
            .filter_map(|element| element.value().attr(attribute))
            .find_map(parse_date_prefix);
        if found.is_some() {
            return found;
        }
    }

    let json_ld = Regex::new(r#""datePublished"\s*:\s*"([^"]+)""#).ok()?;
    let found = json_ld
        .captures_iter(html)
        .find_map(|capture| parse_date_prefix(&capture[1]));
    found
}

fn parse_date_prefix(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let prefix = value.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Text embedded in a PDF's text layer.
pub fn pdf_text_layer(bytes: &[u8]) -> Result<String, CollectError> {
    let document = Document::load_mem(bytes).map_err(|error| CollectError::Pdf(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| CollectError::Pdf(error.to_string()))?;
        if !text.trim().is_empty() {
            pages.push(text.trim().to_string());
        }
    }

    if pages.is_empty() {
        return Err(CollectError::Pdf("pdf had no readable text layer".to_string()));
    }

    Ok(pages.join("\n\n"))
}

/// Builds a page from a fetched body. HTML is converted to text right away;
/// PDF text is left for the extractor.
pub fn page_from_fetched(fetched: FetchedContent, result: Option<SearchResult>) -> WebPage {
    let kind = detect_kind(&fetched.url, fetched.content_type.as_deref(), &fetched.bytes);

    let (title, text) = match kind {
        ContentKind::Html => {
            let html = String::from_utf8_lossy(&fetched.bytes);
            (html_title(&html), html_to_text(&html))
        }
        ContentKind::Other => (None, String::from_utf8_lossy(&fetched.bytes).trim().to_string()),
        ContentKind::Pdf => (None, String::new()),
    };

    let url = result
        .as_ref()
        .map(|result| result.url.clone())
        .unwrap_or(fetched.url);

    WebPage {
        url,
        content: fetched.bytes,
        kind,
        title,
        text,
        ocr: false,
        result,
    }
}

/// Removes Markdown code fences an LLM may wrap its JSON reply in.
pub fn strip_code_fences(reply: &str) -> String {
    reply
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Cuts `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
