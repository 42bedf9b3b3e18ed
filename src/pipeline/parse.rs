//! Tolerant parsing of tagged model output.
//!
//! Models are asked to wrap their answers in XML-ish tags, and mostly do.
//! Every way they can fail to do so is an explicit branch here:
//!
//! * per-page blocks: a block without `<page_type>`/`<page_content>` is kept
//!   as [`BlockShape::MissingTag`] with its raw text as the content;
//! * JSON blocks: [`JsonBlock::MissingTag`] and [`JsonBlock::MalformedJson`]
//!   are returned, never raised, and [`SynthesisParse::into_result`] always
//!   yields a structurally complete [`SynthesisResult`].
//!
//! When a model emits the same block several times (interim and final
//! versions), the last one wins.

use crate::output::{PageRecord, SynthesisResult, UNKNOWN_PAGE_TYPE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

static RE_PAGE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<output\s+page\s*=\s*"(\d+)"\s*>(.*?)</output>"#).unwrap()
});

static RE_PAGE_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<page_type>(.*?)</page_type>").unwrap());

static RE_PAGE_CONTENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<page_content>(.*?)</page_content>").unwrap());

static RE_JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<output>(.*?)</output>").unwrap());

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n?(.*?)\n?```$").unwrap());

// ── Per-page blocks ──────────────────────────────────────────────────────

/// Whether a page block had the expected inner structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    /// Both `<page_type>` and `<page_content>` were present.
    Structured,
    /// At least one sub-tag was missing; the raw block is the content.
    MissingTag,
}

/// One `<output page="N">` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPage {
    pub page_type: String,
    pub content: String,
    pub shape: BlockShape,
}

/// Result of scanning model text for per-page blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedPages {
    pub pages: BTreeMap<usize, ParsedPage>,
    /// Page numbers that had a block, whatever its shape.
    pub found: BTreeSet<usize>,
}

impl TaggedPages {
    /// Records for exactly `expected` pages, in order, plus the pages that
    /// needed a placeholder.
    ///
    /// Blocks for pages outside `expected` are ignored.
    pub fn records_for(&self, expected: &[usize]) -> (Vec<PageRecord>, Vec<usize>) {
        let mut records = Vec::with_capacity(expected.len());
        let mut missing = Vec::new();
        for &page_num in expected {
            match self.pages.get(&page_num) {
                Some(p) => records.push(PageRecord::new(page_num, &p.page_type, &p.content)),
                None => {
                    missing.push(page_num);
                    records.push(PageRecord::placeholder(page_num));
                }
            }
        }
        (records, missing)
    }
}

/// Scan `text` for `<output page="N">…</output>` blocks.
///
/// Text without any block yields an empty result; filling placeholders is
/// the caller's job.
pub fn parse_page_blocks(text: &str) -> TaggedPages {
    let mut out = TaggedPages::default();

    for caps in RE_PAGE_BLOCK.captures_iter(text) {
        let Ok(page_num) = caps[1].parse::<usize>() else {
            warn!("Ignoring page block with unusable page number '{}'", &caps[1]);
            continue;
        };
        let body = caps[2].trim();

        let page_type = RE_PAGE_TYPE.captures(body).map(|c| c[1].trim().to_string());
        let content = RE_PAGE_CONTENT.captures(body).map(|c| c[1].trim().to_string());

        let parsed = match (page_type, content) {
            (Some(page_type), Some(content)) => ParsedPage {
                page_type,
                content,
                shape: BlockShape::Structured,
            },
            _ => {
                debug!("Page {}: block lacks page_type/page_content, keeping raw text", page_num);
                ParsedPage {
                    page_type: UNKNOWN_PAGE_TYPE.to_string(),
                    content: body.to_string(),
                    shape: BlockShape::MissingTag,
                }
            }
        };

        out.found.insert(page_num);
        out.pages.insert(page_num, parsed);
    }

    debug!("Found {} page blocks", out.found.len());
    out
}

// ── JSON blocks ──────────────────────────────────────────────────────────

/// Outcome of looking for a JSON `<output>` block.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonBlock {
    /// The last block parsed as a JSON object.
    Parsed(Map<String, Value>),
    /// No `<output>` block at all.
    MissingTag,
    /// The last block was not a JSON object.
    MalformedJson { detail: String },
}

/// Parse the **last** `<output>…</output>` block of `text` as a JSON object.
///
/// A ```` ```json ```` fence inside the block is stripped first.
pub fn extract_json_block(text: &str) -> JsonBlock {
    let Some(last) = RE_JSON_BLOCK.captures_iter(text).last() else {
        return JsonBlock::MissingTag;
    };
    let raw = strip_json_fence(last[1].trim());

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => JsonBlock::Parsed(map),
        Ok(other) => JsonBlock::MalformedJson {
            detail: format!("expected a JSON object, got {}", json_kind(&other)),
        },
        Err(e) => JsonBlock::MalformedJson {
            detail: e.to_string(),
        },
    }
}

fn strip_json_fence(block: &str) -> &str {
    match RE_JSON_FENCE.captures(block) {
        Some(c) => c.get(1).map_or(block, |m| m.as_str().trim()),
        None => block,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Synthesis-specific reading of a JSON block.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisParse {
    /// A JSON object was found. Keys it lacked are listed in `missing_keys`
    /// and already hold an `"Error: Missing KEY"` value in `result`.
    Parsed {
        result: SynthesisResult,
        missing_keys: Vec<&'static str>,
    },
    MissingTag,
    MalformedJson { detail: String },
}

impl SynthesisParse {
    /// A parsed block replaces the current result; the other variants don't.
    pub fn is_parsed(&self) -> bool {
        matches!(self, SynthesisParse::Parsed { .. })
    }

    /// Always a complete result: failures become all-fields error values.
    pub fn into_result(self) -> SynthesisResult {
        match self {
            SynthesisParse::Parsed { result, .. } => result,
            SynthesisParse::MissingTag => SynthesisResult::error_placeholder("No output block found"),
            SynthesisParse::MalformedJson { detail } => {
                let mut r = SynthesisResult::error_placeholder("JSON parse failed");
                r.risk_assessment = format!("Error parsing JSON: {detail}");
                r
            }
        }
    }
}

/// Read a synthesis reply into the fixed-shape result.
pub fn parse_synthesis(text: &str) -> SynthesisParse {
    match extract_json_block(text) {
        JsonBlock::MissingTag => {
            warn!("No <output> block found in synthesis reply");
            SynthesisParse::MissingTag
        }
        JsonBlock::MalformedJson { detail } => {
            warn!("Synthesis <output> block is not valid JSON: {}", detail);
            SynthesisParse::MalformedJson { detail }
        }
        JsonBlock::Parsed(map) => {
            let mut result = SynthesisResult::default();
            let mut missing_keys = Vec::new();
            for key in SynthesisResult::REQUIRED_KEYS {
                let value = match map.get(key) {
                    Some(v) => render_value(v),
                    None => {
                        missing_keys.push(key);
                        format!("Error: Missing {key}")
                    }
                };
                if let Some(slot) = result.field_mut(key) {
                    *slot = value;
                }
            }
            if !missing_keys.is_empty() {
                warn!("Synthesis JSON is missing keys: {:?}", missing_keys);
            }
            SynthesisParse::Parsed {
                result,
                missing_keys,
            }
        }
    }
}

/// Strings pass through; other values become pretty-printed JSON text.
fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

// ── Plain tags ───────────────────────────────────────────────────────────

/// Trimmed contents of the first `<tag>…</tag>` in `text`.
pub fn first_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let pattern = format!(r"(?is)<{0}>(.*?)</{0}>", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_structured_block() {
        let text = r#"<output page="2"><page_type>X</page_type><page_content>Y</page_content></output>"#;
        let parsed = parse_page_blocks(text);
        assert_eq!(parsed.found, BTreeSet::from([2]));
        let page = &parsed.pages[&2];
        assert_eq!(page.page_type, "X");
        assert_eq!(page.content, "Y");
        assert_eq!(page.shape, BlockShape::Structured);
    }

    #[test]
    fn no_blocks_means_empty_result() {
        let parsed = parse_page_blocks("I could not read these pages, sorry.");
        assert!(parsed.pages.is_empty());
        assert!(parsed.found.is_empty());
    }

    #[test]
    fn block_without_sub_tags_keeps_raw_text() {
        let text = "<OUTPUT page=\"5\">\n  Lab panel, glucose 101 mg/dL\n</OUTPUT>";
        let parsed = parse_page_blocks(text);
        let page = &parsed.pages[&5];
        assert_eq!(page.page_type, "Unknown");
        assert_eq!(page.content, "Lab panel, glucose 101 mg/dL");
        assert_eq!(page.shape, BlockShape::MissingTag);
        assert!(parsed.found.contains(&5));
    }

    #[test]
    fn multiline_blocks_with_thinking_between() {
        let text = "<thinking>page one is an application</thinking>\n\
            <output page=\"1\">\n<page_type>Application</page_type>\n<page_content>\n- Name: J. Doe\n- DOB: 01/02/1970\n</page_content>\n</output>\n\
            <thinking>page three is a lab</thinking>\n\
            <output page=\"3\"><page_type>Lab Report</page_type><page_content>A1C 6.9%</page_content></output>";
        let parsed = parse_page_blocks(text);
        assert_eq!(parsed.found, BTreeSet::from([1, 3]));
        assert_eq!(parsed.pages[&1].content, "- Name: J. Doe\n- DOB: 01/02/1970");

        let (records, missing) = parsed.records_for(&[1, 2, 3]);
        assert_eq!(missing, vec![2]);
        assert_eq!(records.len(), 3);
        assert!(records[1].is_placeholder());
        assert_eq!(records[2].page_type, "Lab Report");
    }

    #[test]
    fn records_for_ignores_pages_outside_the_batch() {
        let parsed = parse_page_blocks(&crate::testing::page_blocks([7, 8]));
        let (records, missing) = parsed.records_for(&[7]);
        assert_eq!(records.len(), 1);
        assert!(missing.is_empty());
    }

    #[test]
    fn duplicate_page_block_last_wins() {
        let text = "<output page=\"4\"><page_type>Draft</page_type><page_content>a</page_content></output>\
                    <output page=\"4\"><page_type>Final</page_type><page_content>b</page_content></output>";
        let parsed = parse_page_blocks(text);
        assert_eq!(parsed.pages[&4].page_type, "Final");
    }

    #[test]
    fn last_json_block_wins() {
        let text = r#"<thinking>interim</thinking><output>{"a": 1}</output>
                      <thinking>final</thinking><output>{"a": 2}</output>"#;
        match extract_json_block(text) {
            JsonBlock::Parsed(map) => assert_eq!(map["a"], 2),
            other => panic!("expected parsed block, got {other:?}"),
        }
    }

    #[test]
    fn missing_and_malformed_json_blocks_are_distinct() {
        assert_eq!(extract_json_block("no tags here"), JsonBlock::MissingTag);
        assert!(matches!(
            extract_json_block("<output>{not json</output>"),
            JsonBlock::MalformedJson { .. }
        ));
        assert!(matches!(
            extract_json_block("<output>[1, 2]</output>"),
            JsonBlock::MalformedJson { detail } if detail.contains("array")
        ));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let text = "<output>\n```json\n{\"RISK_ASSESSMENT\": \"ok\"}\n```\n</output>";
        assert!(matches!(extract_json_block(text), JsonBlock::Parsed(_)));
    }

    #[test]
    fn unparseable_json_still_yields_every_key() {
        let result = parse_synthesis("<output>{\"RISK_ASSESSMENT\": </output>").into_result();
        for key in SynthesisResult::REQUIRED_KEYS {
            let value = result.field(key).unwrap();
            assert!(value.starts_with("Error"), "{key} = {value}");
        }
        assert!(result.risk_assessment.starts_with("Error parsing JSON:"));
        assert_eq!(result.discrepancies, "Error: JSON parse failed");
    }

    #[test]
    fn missing_block_yields_error_shaped_result() {
        let parse = parse_synthesis("<thinking>hmm</thinking>");
        assert!(!parse.is_parsed());
        let result = parse.into_result();
        assert_eq!(result.final_recommendation, "Error: No output block found");
    }

    #[test]
    fn missing_keys_are_filled_not_dropped() {
        let text = r#"<output>{"RISK_ASSESSMENT": "Smoker (pg 2)", "DISCREPANCIES": ""}</output>"#;
        let parse = parse_synthesis(text);
        let SynthesisParse::Parsed { result, missing_keys } = parse else {
            panic!("expected a parsed result");
        };
        assert_eq!(missing_keys, vec!["MEDICAL_TIMELINE", "FINAL_RECOMMENDATION"]);
        assert_eq!(result.risk_assessment, "Smoker (pg 2)");
        assert_eq!(result.discrepancies, "");
        assert_eq!(result.timeline, "Error: Missing MEDICAL_TIMELINE");
    }

    #[test]
    fn structured_values_are_rendered_as_text() {
        let text = r#"<output>{
            "RISK_ASSESSMENT": "r",
            "DISCREPANCIES": ["height differs (pg 1, pg 4)"],
            "MEDICAL_TIMELINE": {"2019": "diagnosis (pg 3)"},
            "FINAL_RECOMMENDATION": null
        }</output>"#;
        let result = parse_synthesis(text).into_result();
        assert!(result.discrepancies.contains("height differs (pg 1, pg 4)"));
        assert!(result.timeline.contains("\"2019\""));
        assert_eq!(result.final_recommendation, "");
    }

    #[test]
    fn first_tag_finds_thinking() {
        let text = "<thinking>\n Reviewing labs \n</thinking><output>{}</output><thinking>later</thinking>";
        assert_eq!(first_tag(text, "thinking"), Some("Reviewing labs"));
        assert_eq!(first_tag("<output>Comparing meds...</output>", "output"), Some("Comparing meds..."));
        assert_eq!(first_tag("nothing", "thinking"), None);
    }
}
