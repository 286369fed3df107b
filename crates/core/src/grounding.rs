//! Grounding: checking that extracted values occur in the page they came from.
//!
//! Both sides are reduced to lower-cased alphanumeric characters before an
//! exact substring test, so punctuation, spacing, thousands separators and
//! Markdown link targets never decide a match.

use crate::error::CollectError;
use crate::models::FieldGrounding;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const EVIDENCE_CONTEXT_BYTES: usize = 60;

/// Drops link targets and images from Markdown, keeping link text.
pub fn remove_markdown_links(text: &str) -> Result<String, CollectError> {
    let image = Regex::new(r"!\[[^\]]*\]\([^)]*\)")?;
    let inline = Regex::new(r"\[([^\]]+)\]\([^)]+\)")?;
    let reference = Regex::new(r"\[([^\]]+)\]\[[^\]]*\]")?;
    let definition = Regex::new(r"(?m)^\[[^\]]+\]:\s*.*$")?;
    let empty = Regex::new(r"\[\]\([^)]*\)")?;

    let text = image.replace_all(text, "");
    let text = empty.replace_all(&text, "");
    let text = inline.replace_all(&text, "$1");
    let text = reference.replace_all(&text, "$1");
    let text = definition.replace_all(&text, "");
    Ok(text.into_owned())
}

/// Lower-cased alphanumeric reduction of a source text that remembers where
/// each kept character came from.
#[derive(Debug, Clone)]
pub struct NormalizedText<'a> {
    source: &'a str,
    normalized: String,
    /// Byte offset in `source` of every char of `normalized`.
    offsets: Vec<usize>,
}

impl<'a> NormalizedText<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut normalized = String::with_capacity(source.len());
        let mut offsets = Vec::with_capacity(source.len());

        for (offset, character) in source.char_indices() {
            if !character.is_alphanumeric() {
                continue;
            }
            for lowered in character.to_lowercase() {
                normalized.push(lowered);
                offsets.push(offset);
            }
        }

        Self {
            source,
            normalized,
            offsets,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    pub fn contains(&self, needle: &str) -> bool {
        let needle = normalize(needle);
        !needle.is_empty() && self.normalized.contains(&needle)
    }

    /// Source text around the first occurrence of `needle`, matched anywhere
    /// in the reduced text.
    pub fn evidence(&self, needle: &str) -> Option<String> {
        let needle = normalize(needle);
        if needle.is_empty() {
            return None;
        }
        let byte_start = self.normalized.find(&needle)?;
        let span = self.source_span(byte_start, &needle)?;
        Some(self.window(span))
    }

    /// Like [`evidence`](Self::evidence), but the match must cover whole
    /// source tokens: `520` is not found in `52,000,000`.
    pub fn token_evidence(&self, needle: &str) -> Option<String> {
        let needle = normalize(needle);
        if needle.is_empty() {
            return None;
        }

        let mut from = 0;
        while let Some(found) = self.normalized[from..].find(&needle) {
            let byte_start = from + found;
            if let Some(span) = self.source_span(byte_start, &needle) {
                if self.on_token_boundary(span) {
                    return Some(self.window(span));
                }
            }
            from = byte_start
                + self.normalized[byte_start..]
                    .chars()
                    .next()
                    .map(char::len_utf8)
                    .unwrap_or(1);
        }
        None
    }

    /// Byte range in `source` covered by `needle` found at `byte_start` of
    /// the reduced text.
    fn source_span(&self, byte_start: usize, needle: &str) -> Option<(usize, usize)> {
        let first_char = self.normalized[..byte_start].chars().count();
        let last_char = first_char + needle.chars().count() - 1;

        let source_start = *self.offsets.get(first_char)?;
        let source_end = *self.offsets.get(last_char)?;
        let source_end = source_end
            + self.source[source_end..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(0);
        Some((source_start, source_end))
    }

    fn on_token_boundary(&self, (start, end): (usize, usize)) -> bool {
        let matched = &self.source[start..end];
        let mut before = self.source[..start].chars().rev();
        let mut after = self.source[end..].chars();

        !continues_token(matched.chars().next(), before.next(), before.next())
            && !continues_token(matched.chars().next_back(), after.next(), after.next())
    }

    fn window(&self, (start, end): (usize, usize)) -> String {
        let window_start = floor_boundary(self.source, start.saturating_sub(EVIDENCE_CONTEXT_BYTES));
        let window_end = ceil_boundary(self.source, end + EVIDENCE_CONTEXT_BYTES);

        self.source[window_start..window_end]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Whether `neighbour` (and the char past it) extends the token whose edge
/// char is `edge`. Digit group separators between digits count as part of
/// the number.
fn continues_token(edge: Option<char>, neighbour: Option<char>, beyond: Option<char>) -> bool {
    match neighbour {
        Some(neighbour) if neighbour.is_alphanumeric() => true,
        Some(',' | '.' | '\'') => {
            edge.is_some_and(|edge| edge.is_ascii_digit())
                && beyond.is_some_and(|beyond| beyond.is_ascii_digit())
        }
        _ => false,
    }
}

pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|character| character.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Text searched for a JSON field value.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => match number.as_f64() {
            Some(float) if !number.is_i64() && !number.is_u64() && float.fract() == 0.0 => {
                Some(format!("{float:.0}"))
            }
            _ => Some(number.to_string()),
        },
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Outcome of grounding one datapoint against its page.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundingReport {
    pub is_grounded: bool,
    pub fields: BTreeMap<String, FieldGrounding>,
}

/// Checks the datapoint's quote and each field value against `page_text`.
///
/// The record is grounded when its quote occurs in the page. A field is
/// grounded, with confidence 1.0, only when its own value occurs in the page
/// as whole tokens. Booleans never occur verbatim; they stay ungrounded but
/// carry confidence 0.5 and the quote evidence when the record quote was
/// found.
pub fn check_grounding(
    fields: &Map<String, Value>,
    quote: Option<&str>,
    page_text: &str,
) -> Result<GroundingReport, CollectError> {
    let cleaned = remove_markdown_links(page_text)?;
    let page = NormalizedText::new(&cleaned);

    let quote = quote.map(str::trim).filter(|quote| !quote.is_empty());
    let quote_evidence = quote.and_then(|quote| page.evidence(quote));
    let is_grounded = quote_evidence.is_some();

    let fields = fields
        .iter()
        .map(|(name, value)| {
            let verbatim = value_text(value).and_then(|text| page.token_evidence(&text));
            let grounding = match verbatim {
                Some(evidence) => FieldGrounding {
                    grounded: true,
                    confidence: 1.0,
                    evidence: Some(evidence),
                },
                None if is_grounded && value.is_boolean() => FieldGrounding {
                    grounded: false,
                    confidence: 0.5,
                    evidence: quote_evidence.clone(),
                },
                None => FieldGrounding {
                    grounded: false,
                    confidence: 0.0,
                    evidence: None,
                },
            };
            (name.clone(), grounding)
        })
        .collect();

    Ok(GroundingReport {
        is_grounded,
        fields,
    })
}

/// Link to `url` that highlights `quote` through a text fragment.
pub fn citation_url(url: &str, quote: &str) -> String {
    let base = url.split('#').next().unwrap_or(url);
    let encoded = url::form_urlencoded::byte_serialize(quote.trim().as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('-', "%2D");
    format!("{base}#:~:text={encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn verbatim_value_is_grounded_and_fabricated_is_not() {
        let page = "Acme Corp reported revenue of $394.3 billion for fiscal 2023.";
        let report = check_grounding(
            &fields(json!({"revenue": 394.3, "ceo": "Jane Fabricated"})),
            None,
            page,
        )
        .unwrap();

        assert!(!report.is_grounded);
        assert!(report.fields["revenue"].grounded);
        assert_eq!(report.fields["revenue"].confidence, 1.0);
        assert!(report.fields["revenue"]
            .evidence
            .as_deref()
            .unwrap()
            .contains("$394.3 billion"));
        assert!(!report.fields["ceo"].grounded);
    }

    #[test]
    fn quote_matching_ignores_case_punctuation_and_links() {
        let page = "Revenue: **$1,000,000** according to [the filing](https://sec.gov/x).";
        let report = check_grounding(
            &fields(json!({"revenue": 1000000})),
            Some("revenue $1,000,000 according to the filing"),
            page,
        )
        .unwrap();

        assert!(report.is_grounded);
        assert!(report.fields["revenue"].grounded);
    }

    #[test]
    fn boolean_backed_by_quote_gets_half_confidence_but_stays_ungrounded() {
        let page = "The company is publicly listed on NASDAQ.";
        let report = check_grounding(
            &fields(json!({"is_public": true})),
            Some("publicly listed on NASDAQ"),
            page,
        )
        .unwrap();

        assert!(report.is_grounded);
        assert!(!report.fields["is_public"].grounded);
        assert_eq!(report.fields["is_public"].confidence, 0.5);
        assert!(report.fields["is_public"].evidence.is_some());
    }

    #[test]
    fn fabricated_values_next_to_grounded_quote_stay_ungrounded() {
        let page = "Acme Corp reported annual revenue of 52,000,000 dollars in 2023.";
        let report = check_grounding(
            &fields(json!({"ceo": "Jane Fabricated", "revenue": 999})),
            Some("Acme Corp reported"),
            page,
        )
        .unwrap();

        assert!(report.is_grounded);
        for name in ["ceo", "revenue"] {
            assert!(!report.fields[name].grounded, "{name} should be ungrounded");
            assert_eq!(report.fields[name].confidence, 0.0);
            assert_eq!(report.fields[name].evidence, None);
        }
    }

    #[test]
    fn values_inside_longer_numbers_are_not_grounded() {
        let page = "Acme Corp reported revenue of 52,000,000 dollars in 2023.";
        let report = check_grounding(
            &fields(json!({"revenue": 520, "employees": 5, "exact": 52000000, "year": 2023})),
            None,
            page,
        )
        .unwrap();

        assert!(!report.fields["revenue"].grounded);
        assert!(!report.fields["employees"].grounded);
        assert!(report.fields["exact"].grounded);
        assert!(report.fields["year"].grounded);
    }

    #[test]
    fn token_match_rejects_word_fragments() {
        let page = NormalizedText::new("Acme Corporation, est. 1999");
        assert!(page.token_evidence("Corp").is_none());
        assert!(page.token_evidence("acme corporation").is_some());
        assert!(page.evidence("Corp").is_some());
    }

    #[test]
    fn empty_quote_is_not_grounded() {
        let report = check_grounding(&Map::new(), Some("  "), "anything").unwrap();
        assert!(!report.is_grounded);
    }

    #[test]
    fn whole_floats_match_integer_text() {
        assert_eq!(value_text(&json!(2023.0)).as_deref(), Some("2023"));
        assert_eq!(value_text(&json!(12.5)).as_deref(), Some("12.5"));
        assert_eq!(value_text(&json!(true)), None);
    }

    #[test]
    fn images_are_removed_before_links() {
        let cleaned = remove_markdown_links("![logo](a.png) see [docs](b.html)").unwrap();
        assert_eq!(cleaned.trim(), "see docs");
    }

    #[test]
    fn citation_encodes_quote_as_text_fragment() {
        assert_eq!(
            citation_url("https://a.com/p#top", "revenue of $1-2 bn"),
            "https://a.com/p#:~:text=revenue%20of%20%241%2D2%20bn"
        );
    }

    #[test]
    fn evidence_handles_multibyte_text() {
        let page = NormalizedText::new("Café Überlingen zählt 1200 Gäste");
        assert_eq!(page.evidence("1200").as_deref(), Some("Café Überlingen zählt 1200 Gäste"));
    }
}
