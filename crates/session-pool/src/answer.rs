//! Answer extraction from upstream payloads
//!
//! The upstream returns a loosely shaped JSON document. Callers get the
//! answer text (or structured answer) plus a deduplicated list of sources.

use serde::Serialize;
use serde_json::Value;
use session::Mode;

/// One cited source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Present when the answer came from a fallback tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackInfo {
    pub fallback: bool,
    pub fallback_mode: Mode,
    pub original_mode: Mode,
    pub original_model: Option<String>,
    /// Degraded member that answered, when tier two succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_member: Option<String>,
}

/// Successful query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: Option<Value>,
    pub sources: Vec<Source>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackInfo>,
}

const SEARCH_RESULTS_STEP: &str = "SEARCH_RESULTS";

/// Pull the answer and its sources out of an upstream payload.
///
/// Sources come from the search-results step when present, otherwise from
/// the `chunks` list.
pub fn extract_answer(payload: &Value) -> Answer {
    let answer = payload
        .get("answer")
        .filter(|v| !v.is_null())
        .cloned();

    let mut sources = step_sources(payload);
    if sources.is_empty() {
        sources = chunk_sources(payload);
    }
    dedup_by_url(&mut sources);

    Answer {
        answer,
        sources,
        fallback: None,
    }
}

/// Whether the payload carries a usable answer.
pub fn has_answer(payload: &Value) -> bool {
    match payload.get("answer") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn step_sources(payload: &Value) -> Vec<Source> {
    let Some(steps) = payload.get("text").and_then(Value::as_array) else {
        return Vec::new();
    };
    steps
        .iter()
        .filter(|step| {
            step.get("step_type").and_then(Value::as_str) == Some(SEARCH_RESULTS_STEP)
        })
        .filter_map(|step| step.pointer("/content/web_results").and_then(Value::as_array))
        .flatten()
        .filter_map(|result| {
            let url = result.get("url")?.as_str()?;
            Some(Source {
                url: url.to_string(),
                title: string_field(result, "name"),
            })
        })
        .collect()
}

fn chunk_sources(payload: &Value) -> Vec<Source> {
    let Some(chunks) = payload.get("chunks").and_then(Value::as_array) else {
        return Vec::new();
    };
    chunks
        .iter()
        .filter_map(|chunk| {
            let url = chunk.get("url")?.as_str()?;
            Some(Source {
                url: url.to_string(),
                title: string_field(chunk, "title").or_else(|| string_field(chunk, "name")),
            })
        })
        .collect()
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn dedup_by_url(sources: &mut Vec<Source>) {
    let mut seen = std::collections::HashSet::new();
    sources.retain(|s| seen.insert(s.url.clone()));
}
